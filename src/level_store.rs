/*
 *  level_store.rs
 *
 *  meterbank - levels on the wire, bars on the glass
 *	(c) 2020-26 Stuart Hunter
 *
 *	Versioned level snapshot, one per execution context
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

use std::sync::Arc;

use crate::levels::{LevelError, LevelEvent, LevelSnapshot, MeterTarget, StereoLevel};

/// Holds the current [`LevelSnapshot`].
///
/// Every update publishes a fresh `Arc<LevelSnapshot>`; readers that kept an
/// older `Arc` keep seeing the old values, so always go through the accessors.
/// Single owner per context, no locking inside.
#[derive(Debug, Clone, Default)]
pub struct LevelStore {
    current: Arc<LevelSnapshot>,
}

impl LevelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a raw payload and publish it. A bad payload leaves the store untouched.
    pub fn update(&mut self, raw: &str) -> Result<u64, LevelError> {
        let event = LevelEvent::parse(raw)?;
        Ok(self.apply(event))
    }

    /// Publish an already validated event. Tracks the event omits keep their last value.
    pub fn apply(&mut self, event: LevelEvent) -> u64 {
        let mut tracks = self.current.tracks.clone();
        tracks.extend(event.tracks);
        let version = self.current.version + 1;
        self.current = Arc::new(LevelSnapshot {
            version,
            master: event.master,
            tracks,
        });
        version
    }

    /// Drop every track and zero the master.
    pub fn reset(&mut self) -> u64 {
        let version = self.current.version + 1;
        self.current = Arc::new(LevelSnapshot {
            version,
            ..LevelSnapshot::default()
        });
        version
    }

    pub fn get(&self, target: &MeterTarget) -> StereoLevel {
        self.current.get(target)
    }

    pub fn master(&self) -> StereoLevel {
        self.current.master
    }

    pub fn track(&self, id: &str) -> StereoLevel {
        self.current.tracks.get(id).copied().unwrap_or_default()
    }

    pub fn snapshot(&self) -> Arc<LevelSnapshot> {
        Arc::clone(&self.current)
    }

    pub fn version(&self) -> u64 {
        self.current.version
    }
}
