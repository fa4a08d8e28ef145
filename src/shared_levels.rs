/*
 *  shared_levels.rs
 *
 *  meterbank - levels on the wire, bars on the glass
 *	(c) 2020-26 Stuart Hunter
 *
 *	Lock-free shared level region, one writer and many readers
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
//! Layout, in 32-bit cells:
//!
//! ```text
//! [0]        version (u32, odd while a write is in progress)
//! [1..9]     master: rms peak leftRms leftPeak rightRms rightPeak peakDb clipping
//! [9..17]    track slot 0
//! ...        up to `max_tracks` slots, ascending track id
//! ```
//!
//! Readers take the version before and after copying the fields and throw
//! the copy away if it was odd or moved.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use memmap2::MmapMut;

use crate::levels::{LevelSnapshot, StereoLevel};

pub const DEFAULT_MAX_TRACKS: usize = 32;
pub const CELLS_PER_LEVEL: usize = 8;
const READ_ATTEMPTS: usize = 4;

struct Region {
    _map: MmapMut,          // keep mapping alive
    base: *const AtomicU32,
    cells: usize,
    max_tracks: usize,
    // slot -> track id, written inside the version window like the cells
    names: Mutex<Vec<String>>,
}

// The mapping is only touched through AtomicU32 cells and the mutex.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    #[inline]
    fn cell(&self, i: usize) -> &AtomicU32 {
        assert!(i < self.cells);
        // Safety: base is page aligned and the mapping holds `cells` u32s for our lifetime.
        unsafe { &*self.base.add(i) }
    }

    fn version(&self) -> &AtomicU32 {
        self.cell(0)
    }

    fn slot_base(slot: usize) -> usize {
        1 + slot * CELLS_PER_LEVEL
    }

    fn store_level(&self, slot: usize, level: &StereoLevel) {
        let base = Self::slot_base(slot);
        for (k, v) in level.to_cells().iter().enumerate() {
            self.cell(base + k).store(v.to_bits(), Ordering::Relaxed);
        }
    }

    fn load_level(&self, slot: usize) -> StereoLevel {
        let base = Self::slot_base(slot);
        let mut c = [0f32; CELLS_PER_LEVEL];
        for (k, v) in c.iter_mut().enumerate() {
            *v = f32::from_bits(self.cell(base + k).load(Ordering::Relaxed));
        }
        StereoLevel::from_cells(c)
    }
}

/// Allocates the region and splits it into its two ends.
pub struct SharedLevelBuffer;

impl SharedLevelBuffer {
    /// Map an anonymous region big enough for master plus `max_tracks` tracks.
    pub fn allocate(max_tracks: usize) -> io::Result<(SharedLevelWriter, SharedLevelReader)> {
        let cells = 1 + CELLS_PER_LEVEL * (1 + max_tracks);
        let mut map = MmapMut::map_anon(cells * std::mem::size_of::<u32>())?;
        let base = map.as_mut_ptr() as *const AtomicU32;
        debug!("shared levels: mapped {} cells for {} tracks", cells, max_tracks);
        let region = Arc::new(Region {
            _map: map,
            base,
            cells,
            max_tracks,
            names: Mutex::new(Vec::new()),
        });
        Ok((
            SharedLevelWriter { region: Arc::clone(&region), seq: 0, truncated_warned: false },
            SharedLevelReader { region },
        ))
    }
}

/// The single writing end. Not `Clone`; whoever holds it is the only writer.
pub struct SharedLevelWriter {
    region: Arc<Region>,
    seq: u32,
    truncated_warned: bool,
}

impl std::fmt::Debug for SharedLevelWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedLevelWriter").field("seq", &self.seq).finish()
    }
}

impl SharedLevelWriter {
    pub fn max_tracks(&self) -> usize {
        self.region.max_tracks
    }

    /// Copy a snapshot into the region. Returns the published version.
    pub fn publish(&mut self, snapshot: &LevelSnapshot) -> u32 {
        let max = self.region.max_tracks;
        if snapshot.tracks.len() > max && !self.truncated_warned {
            warn!(
                "shared levels: {} tracks, only the first {} are published",
                snapshot.tracks.len(),
                max
            );
            self.truncated_warned = true;
        }

        self.begin();
        self.region.store_level(0, &snapshot.master);
        let mut names = Vec::with_capacity(snapshot.tracks.len().min(max));
        for (slot, (id, level)) in snapshot.tracks.iter().take(max).enumerate() {
            self.region.store_level(slot + 1, level);
            names.push(id.clone());
        }
        for slot in names.len()..max {
            self.region.store_level(slot + 1, &StereoLevel::default());
        }
        *self.region.names.lock().unwrap_or_else(|e| e.into_inner()) = names;
        self.commit()
    }

    fn begin(&mut self) {
        self.region.version().store(self.seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
    }

    fn commit(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(2);
        self.region.version().store(self.seq, Ordering::Release);
        self.seq
    }
}

/// A consistent copy of the region.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedLevels {
    pub version: u32,
    pub master: StereoLevel,
    pub tracks: BTreeMap<String, StereoLevel>,
}

impl SharedLevels {
    pub fn track(&self, id: &str) -> StereoLevel {
        self.tracks.get(id).copied().unwrap_or_default()
    }
}

/// Reading end. Clone freely.
#[derive(Clone)]
pub struct SharedLevelReader {
    region: Arc<Region>,
}

impl std::fmt::Debug for SharedLevelReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedLevelReader")
            .field("cells", &self.region.cells)
            .field("version", &self.version())
            .finish()
    }
}

impl SharedLevelReader {
    pub fn version(&self) -> u32 {
        self.region.version().load(Ordering::Acquire)
    }

    /// A few attempts at a clean read; `None` if the writer kept getting in the way.
    pub fn read(&self) -> Option<SharedLevels> {
        (0..READ_ATTEMPTS).find_map(|_| self.try_read())
    }

    /// One attempt. `None` on a torn read.
    pub fn try_read(&self) -> Option<SharedLevels> {
        self.read_with(|| {})
    }

    /// `mid_read` runs between copying the fields and re-checking the version.
    pub(crate) fn read_with(&self, mid_read: impl FnOnce()) -> Option<SharedLevels> {
        let r = &self.region;
        let v1 = r.version().load(Ordering::Acquire);
        if v1 & 1 == 1 {
            return None;
        }
        let master = r.load_level(0);
        let names = r.names.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let tracks = names
            .into_iter()
            .enumerate()
            .map(|(slot, id)| (id, r.load_level(slot + 1)))
            .collect();
        mid_read();
        fence(Ordering::Acquire);
        let v2 = r.version().load(Ordering::Relaxed);
        if v1 != v2 {
            return None;
        }
        Some(SharedLevels { version: v2, master, tracks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level_store::LevelStore;

    fn store_with(raw: &str) -> LevelStore {
        let mut s = LevelStore::new();
        s.update(raw).unwrap();
        s
    }

    #[test]
    fn test_publish_and_read() {
        let (mut w, r) = SharedLevelBuffer::allocate(4).unwrap();
        assert_eq!(r.version(), 0);
        let store = store_with(
            r#"{"tracks":{"b":{"rms":0.2,"peak":0.4},"a":{"rms":0.1,"peak":0.3}},
                "master":{"rms":0.6,"peak":0.9,"clipping":true}}"#,
        );
        let v = w.publish(&store.snapshot());
        assert_eq!(v, 2);

        let got = r.read().unwrap();
        assert_eq!(got.version, 2);
        assert!(got.master.clipping);
        assert_eq!(got.master.peak, 0.9);
        assert_eq!(got.track("a").peak, 0.3);
        assert_eq!(got.track("b").peak, 0.4);
        assert_eq!(got.tracks.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_track_cap() {
        let (mut w, r) = SharedLevelBuffer::allocate(1).unwrap();
        let store = store_with(
            r#"{"tracks":{"x":{"rms":0,"peak":0.5},"y":{"rms":0,"peak":0.6}},"master":{"rms":0,"peak":0}}"#,
        );
        w.publish(&store.snapshot());
        let got = r.read().unwrap();
        assert_eq!(got.tracks.len(), 1);
        assert_eq!(got.track("x").peak, 0.5);
        assert_eq!(got.track("y"), StereoLevel::default());
    }

    #[test]
    fn test_torn_read_is_discarded() {
        let (mut w, r) = SharedLevelBuffer::allocate(2).unwrap();
        let first = store_with(r#"{"master":{"rms":0.1,"peak":0.1}}"#);
        let second = store_with(r#"{"master":{"rms":0.9,"peak":0.9}}"#);
        w.publish(&first.snapshot());

        let torn = r.read_with(|| {
            w.publish(&second.snapshot());
        });
        assert!(torn.is_none());

        let clean = r.try_read().unwrap();
        assert_eq!(clean.master.peak, 0.9);
        assert_eq!(clean.version, 4);
    }

    #[test]
    fn test_write_in_progress_is_not_read() {
        let (mut w, r) = SharedLevelBuffer::allocate(2).unwrap();
        w.begin();
        assert!(r.try_read().is_none());
        assert!(r.read().is_none());
        w.commit();
        assert!(r.try_read().is_some());
    }

    #[test]
    fn test_removed_tracks_are_zeroed() {
        let (mut w, r) = SharedLevelBuffer::allocate(2).unwrap();
        let mut store = store_with(r#"{"tracks":{"t":{"rms":0.3,"peak":0.3}},"master":{"rms":0,"peak":0}}"#);
        w.publish(&store.snapshot());
        store.reset();
        w.publish(&store.snapshot());
        let got = r.read().unwrap();
        assert!(got.tracks.is_empty());
        assert_eq!(got.master, StereoLevel::default());
    }
}
