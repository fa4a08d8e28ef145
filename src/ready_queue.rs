/*
 *  ready_queue.rs
 *
 *  meterbank - levels on the wire, bars on the glass
 *	(c) 2020-26 Stuart Hunter
 *
 *	Bounded FIFO that holds work until its consumer says it is ready
 *
 *	This program is free software: you can redistribute it and/or modify
 *	it under the terms of the GNU General Public License as published by
 *	the Free Software Foundation, either version 3 of the License, or
 *	(at your option) any later version.
 *
 *	This program is distributed in the hope that it will be useful,
 *	but WITHOUT ANY WARRANTY; without even the implied warranty of
 *	MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *	GNU General Public License for more details.
 *
 *	See <http://www.gnu.org/licenses/> to get a copy of the GNU General
 *	Public License.
 *
 */

use std::collections::VecDeque;

pub const DEFAULT_CAPACITY: usize = 256;

/// What the caller should do with a submitted item.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission<T> {
    /// Consumer is ready: deliver the item now.
    Dispatch(T),
    /// Parked until [`ReadyQueue::mark_ready`].
    Queued,
}

/// Queue was full; the item is handed back untouched.
#[derive(Debug, PartialEq, Eq)]
pub struct Rejected<T>(pub T);

/// Queue-until-ready.
///
/// Items submitted before readiness are kept in order; `mark_ready` flips
/// the flag and hands back everything parked, in one step, so nothing
/// submitted afterwards can overtake them.
#[derive(Debug)]
pub struct ReadyQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
    ready: bool,
}

impl<T> ReadyQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self { items: VecDeque::new(), capacity: capacity.max(1), ready: false }
    }

    pub fn submit(&mut self, item: T) -> Result<Admission<T>, Rejected<T>> {
        if self.ready {
            return Ok(Admission::Dispatch(item));
        }
        if self.items.len() >= self.capacity {
            return Err(Rejected(item));
        }
        self.items.push_back(item);
        Ok(Admission::Queued)
    }

    /// Readiness transition. Returns the parked items the first time only.
    pub fn mark_ready(&mut self) -> Option<Vec<T>> {
        if self.ready {
            return None;
        }
        self.ready = true;
        Some(self.items.drain(..).collect())
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> Default for ReadyQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
