/*
 *  peak_hold.rs
 *
 *  meterbank - levels on the wire, bars on the glass
 *	(c) 2020-26 Stuart Hunter
 *
 *	Peak-hold with multiplicative release
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

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::levels::{db_from_linear, MeterTarget, SILENCE_LINEAR};

pub const HOLD_WINDOW: Duration = Duration::from_millis(20_000);
pub const HOLD_DECAY: f32 = 0.98;   // per tick once the window has run out

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HoldSettings {
    pub window: Duration,
    pub decay: f32,
}

impl Default for HoldSettings {
    fn default() -> Self {
        Self { window: HOLD_WINDOW, decay: HOLD_DECAY }
    }
}

/// Highest recent peak per channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakHold {
    pub left: f32,
    pub right: f32,
    pub last_rise: Instant,
    // decay steps already taken since `last_rise`, for paced updates
    decays: u64,
}

impl PeakHold {
    fn new(now: Instant) -> Self {
        Self { left: 0.0, right: 0.0, last_rise: now, decays: 0 }
    }

    pub fn level(&self) -> f32 {
        self.left.max(self.right)
    }

    pub fn left_db(&self) -> f32 {
        db_from_linear(self.left)
    }

    pub fn right_db(&self) -> f32 {
        db_from_linear(self.right)
    }

    fn rise(&mut self, left: f32, right: f32, now: Instant) -> bool {
        let mut rose = false;
        if left > self.left {
            self.left = left;
            rose = true;
        }
        if right > self.right {
            self.right = right;
            rose = true;
        }
        if rose {
            self.last_rise = now;
            self.decays = 0;
        }
        rose
    }

    /// One tick. Returns true when either channel moved.
    fn advance(&mut self, left: f32, right: f32, now: Instant, settings: &HoldSettings) -> bool {
        if self.rise(left, right, now) {
            return true;
        }
        if now.saturating_duration_since(self.last_rise) <= settings.window {
            return false;
        }
        if self.left == 0.0 && self.right == 0.0 {
            return false;
        }
        self.left = release(self.left, settings.decay);
        self.right = release(self.right, settings.decay);
        self.decays += 1;
        true
    }

    /// Like [`advance`](Self::advance), but for callers that are not ticked:
    /// takes every decay step a `tick`-paced observer would have taken by `now`.
    fn advance_paced(&mut self, left: f32, right: f32, now: Instant, tick: Duration, settings: &HoldSettings) -> bool {
        if self.rise(left, right, now) {
            return true;
        }
        let past = now.saturating_duration_since(self.last_rise).saturating_sub(settings.window);
        if past.is_zero() {
            return false;
        }
        let due = past.as_nanos().div_ceil(tick.as_nanos().max(1)) as u64;
        let steps = due.saturating_sub(self.decays);
        self.decays = self.decays.max(due);
        let mut moved = false;
        for _ in 0..steps {
            if self.left == 0.0 && self.right == 0.0 {
                break;
            }
            self.left = release(self.left, settings.decay);
            self.right = release(self.right, settings.decay);
            moved = true;
        }
        moved
    }
}

#[inline]
fn release(v: f32, decay: f32) -> f32 {
    let next = v * decay;
    if next < SILENCE_LINEAR { 0.0 } else { next }
}

/// Peak-hold state for every observed target, created lazily.
#[derive(Debug, Clone, Default)]
pub struct PeakHoldBank {
    settings: HoldSettings,
    holds: HashMap<MeterTarget, PeakHold>,
}

impl PeakHoldBank {
    pub fn new(settings: HoldSettings) -> Self {
        Self { settings, holds: HashMap::new() }
    }

    /// Feed the current per-channel peaks for `target` at `now`.
    pub fn observe(&mut self, target: &MeterTarget, left: f32, right: f32, now: Instant) -> PeakHold {
        let settings = self.settings;
        let hold = self
            .holds
            .entry(target.clone())
            .or_insert_with(|| PeakHold::new(now));
        hold.advance(left, right, now, &settings);
        *hold
    }

    /// Event-driven variant of [`observe`](Self::observe): the hold decays as if
    /// it had been observed every `tick`, however often this is called.
    pub fn observe_paced(
        &mut self,
        target: &MeterTarget,
        left: f32,
        right: f32,
        now: Instant,
        tick: Duration,
    ) -> PeakHold {
        let settings = self.settings;
        let hold = self
            .holds
            .entry(target.clone())
            .or_insert_with(|| PeakHold::new(now));
        hold.advance_paced(left, right, now, tick, &settings);
        *hold
    }

    /// Bring an existing hold up to `now` without new input.
    pub fn settle(&mut self, target: &MeterTarget, now: Instant, tick: Duration) -> Option<PeakHold> {
        let settings = self.settings;
        let hold = self.holds.get_mut(target)?;
        hold.advance_paced(0.0, 0.0, now, tick, &settings);
        Some(*hold)
    }

    pub fn get(&self, target: &MeterTarget) -> Option<PeakHold> {
        self.holds.get(target).copied()
    }

    pub fn clear(&mut self) {
        self.holds.clear();
    }

    pub fn len(&self) -> usize {
        self.holds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holds.is_empty()
    }
}
