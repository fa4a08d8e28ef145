/*
 *  levels.rs
 *
 *  meterbank - levels on the wire, bars on the glass
 *	(c) 2020-26 Stuart Hunter
 *
 *	Level data model, inbound payload parsing and dB helpers
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

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub const DB_FLOOR: f32 = -60.0;          // meter floor
pub const DB_CEIL: f32 = 0.0;             // 0 dBFS
pub const SILENCE_LINEAR: f32 = 0.001;    // -60 dB, anything at or below reads as floor

/// Error raised when an inbound level payload cannot be used.
#[derive(Debug, Error)]
pub enum LevelError {
    #[error("level payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("level field {field} is not a finite number")]
    NonFinite { field: String },
}

/// Linear amplitude to dBFS, clamped to [-60, 0].
#[inline]
pub fn db_from_linear(linear: f32) -> f32 {
    if !linear.is_finite() || linear <= SILENCE_LINEAR {
        return DB_FLOOR;
    }
    (20.0 * linear.log10()).clamp(DB_FLOOR, DB_CEIL)
}

/// Meter position in percent (0 = floor, 100 = 0 dBFS).
#[inline]
pub fn db_position(db: f32) -> f32 {
    let clamped = if db.is_finite() { db.clamp(DB_FLOOR, DB_CEIL) } else { DB_FLOOR };
    (clamped - DB_FLOOR) / (DB_CEIL - DB_FLOOR) * 100.0
}

/// Colour band a peak falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeakBand {
    Green,
    Yellow,
    Orange,
    Red,
}

impl PeakBand {
    pub fn from_db(db: f32) -> Self {
        if db > -3.0 {
            PeakBand::Red
        } else if db >= -6.0 {
            PeakBand::Orange
        } else if db >= -20.0 {
            PeakBand::Yellow
        } else {
            PeakBand::Green
        }
    }
}

/// One measurement for a track or the master bus.
///
/// Values are replaced wholesale on every update, never patched in place.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StereoLevel {
    pub rms: f32,
    pub peak: f32,
    pub left_rms: f32,
    pub left_peak: f32,
    pub right_rms: f32,
    pub right_peak: f32,
    pub clipping: bool,
    pub peak_db: f32,
}

impl Default for StereoLevel {
    fn default() -> Self {
        Self {
            rms: 0.0,
            peak: 0.0,
            left_rms: 0.0,
            left_peak: 0.0,
            right_rms: 0.0,
            right_peak: 0.0,
            clipping: false,
            peak_db: DB_FLOOR,
        }
    }
}

impl StereoLevel {
    /// Mono measurement mirrored onto both channels.
    pub fn mono(rms: f32, peak: f32, clipping: bool) -> Self {
        Self {
            rms,
            peak,
            left_rms: rms,
            left_peak: peak,
            right_rms: rms,
            right_peak: peak,
            clipping,
            peak_db: db_from_linear(peak),
        }
    }

    /// The eight floats of the shared buffer layout, in order.
    pub fn to_cells(&self) -> [f32; 8] {
        [
            self.rms,
            self.peak,
            self.left_rms,
            self.left_peak,
            self.right_rms,
            self.right_peak,
            self.peak_db,
            if self.clipping { 1.0 } else { 0.0 },
        ]
    }

    pub fn from_cells(c: [f32; 8]) -> Self {
        Self {
            rms: c[0],
            peak: c[1],
            left_rms: c[2],
            left_peak: c[3],
            right_rms: c[4],
            right_peak: c[5],
            peak_db: c[6],
            clipping: c[7] >= 0.5,
        }
    }
}

/// What a meter is bound to: the master bus or a named track.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum MeterTarget {
    Master,
    Track(String),
}

impl MeterTarget {
    pub fn track(id: impl Into<String>) -> Self {
        MeterTarget::Track(id.into())
    }
}

impl Default for MeterTarget {
    fn default() -> Self {
        MeterTarget::Master
    }
}

impl From<Option<String>> for MeterTarget {
    fn from(id: Option<String>) -> Self {
        match id {
            None => MeterTarget::Master,
            Some(s) if s == "master" => MeterTarget::Master,
            Some(s) => MeterTarget::Track(s),
        }
    }
}

impl From<Option<&str>> for MeterTarget {
    fn from(id: Option<&str>) -> Self {
        MeterTarget::from(id.map(str::to_string))
    }
}

impl From<MeterTarget> for Option<String> {
    fn from(t: MeterTarget) -> Self {
        match t {
            MeterTarget::Master => None,
            MeterTarget::Track(id) => Some(id),
        }
    }
}

impl fmt::Display for MeterTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeterTarget::Master => write!(f, "master"),
            MeterTarget::Track(id) => write!(f, "track:{id}"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLevel {
    rms: f64,
    peak: f64,
    #[serde(default)]
    clipping: bool,
    left_rms: Option<f64>,
    left_peak: Option<f64>,
    right_rms: Option<f64>,
    right_peak: Option<f64>,
    peak_db: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawLevelEvent {
    #[serde(default)]
    tracks: BTreeMap<String, RawLevel>,
    master: RawLevel,
}

fn amplitude(v: f64, field: &str) -> Result<f32, LevelError> {
    let v = v as f32;
    if !v.is_finite() {
        return Err(LevelError::NonFinite { field: field.to_string() });
    }
    Ok(v.max(0.0))
}

impl RawLevel {
    fn validate(&self, owner: &str) -> Result<StereoLevel, LevelError> {
        let rms = amplitude(self.rms, &format!("{owner}.rms"))?;
        let peak = amplitude(self.peak, &format!("{owner}.peak"))?;
        let or_mono = |v: Option<f64>, mono: f32, name: &str| -> Result<f32, LevelError> {
            match v {
                Some(v) => amplitude(v, &format!("{owner}.{name}")),
                None => Ok(mono),
            }
        };
        let peak_db = match self.peak_db {
            Some(db) => {
                let db = db as f32;
                if db.is_nan() {
                    return Err(LevelError::NonFinite { field: format!("{owner}.peakDb") });
                }
                db.clamp(DB_FLOOR, DB_CEIL)
            }
            None => db_from_linear(peak),
        };
        Ok(StereoLevel {
            rms,
            peak,
            left_rms: or_mono(self.left_rms, rms, "leftRms")?,
            left_peak: or_mono(self.left_peak, peak, "leftPeak")?,
            right_rms: or_mono(self.right_rms, rms, "rightRms")?,
            right_peak: or_mono(self.right_peak, peak, "rightPeak")?,
            clipping: self.clipping,
            peak_db,
        })
    }
}

/// A validated inbound level event.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelEvent {
    pub tracks: BTreeMap<String, StereoLevel>,
    pub master: StereoLevel,
}

impl LevelEvent {
    /// Parse and validate a raw JSON payload. Any bad field rejects the whole event.
    pub fn parse(raw: &str) -> Result<Self, LevelError> {
        let ev: RawLevelEvent = serde_json::from_str(raw)?;
        Self::from_raw(ev)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, LevelError> {
        let ev: RawLevelEvent = serde_json::from_value(value)?;
        Self::from_raw(ev)
    }

    fn from_raw(ev: RawLevelEvent) -> Result<Self, LevelError> {
        let master = ev.master.validate("master")?;
        let mut tracks = BTreeMap::new();
        for (id, raw) in ev.tracks {
            let level = raw.validate(&id)?;
            tracks.insert(id, level);
        }
        Ok(Self { tracks, master })
    }
}

/// Versioned, immutable view of every known level.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LevelSnapshot {
    pub version: u64,
    pub master: StereoLevel,
    pub tracks: BTreeMap<String, StereoLevel>,
}

impl LevelSnapshot {
    pub fn get(&self, target: &MeterTarget) -> StereoLevel {
        match target {
            MeterTarget::Master => self.master,
            MeterTarget::Track(id) => self.tracks.get(id).copied().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_clamp() {
        assert_eq!(db_from_linear(0.0), -60.0);
        assert_eq!(db_from_linear(0.001), -60.0);
        assert_eq!(db_from_linear(0.0005), -60.0);
        assert_eq!(db_from_linear(-1.0), -60.0);
        assert_eq!(db_from_linear(1.0), 0.0);
        assert_eq!(db_from_linear(4.0), 0.0);
        assert!((db_from_linear(0.5) - (-6.0206)).abs() < 1e-3);
    }

    #[test]
    fn test_db_position() {
        assert_eq!(db_position(-60.0), 0.0);
        assert_eq!(db_position(-90.0), 0.0);
        assert_eq!(db_position(0.0), 100.0);
        assert!((db_position(-30.0) - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_peak_bands() {
        assert_eq!(PeakBand::from_db(-40.0), PeakBand::Green);
        assert_eq!(PeakBand::from_db(-20.0), PeakBand::Yellow);
        assert_eq!(PeakBand::from_db(-10.0), PeakBand::Yellow);
        assert_eq!(PeakBand::from_db(-5.0), PeakBand::Orange);
        assert_eq!(PeakBand::from_db(-3.0), PeakBand::Orange);
        assert_eq!(PeakBand::from_db(-1.0), PeakBand::Red);
    }

    #[test]
    fn test_parse_defaults_stereo_fields() {
        let ev = LevelEvent::parse(
            r#"{"tracks":{"t1":{"rms":0.5,"peak":0.8,"clipping":false,"leftPeak":0.7}},
                "master":{"rms":0.6,"peak":0.9,"clipping":true}}"#,
        )
        .unwrap();
        let t1 = ev.tracks["t1"];
        assert_eq!(t1.left_peak, 0.7);
        assert_eq!(t1.right_peak, 0.8);
        assert_eq!(t1.left_rms, 0.5);
        assert!(ev.master.clipping);
        assert!((ev.master.peak_db - 20.0 * 0.9f32.log10()).abs() < 1e-4);
    }

    #[test]
    fn test_parse_clamps_supplied_peak_db() {
        let ev = LevelEvent::parse(r#"{"master":{"rms":0.1,"peak":0.2,"clipping":false,"peakDb":-120}}"#).unwrap();
        assert_eq!(ev.master.peak_db, -60.0);
        assert!(ev.tracks.is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(LevelEvent::parse("not json").is_err());
        assert!(LevelEvent::parse(r#"{"tracks":{}}"#).is_err());
        assert!(LevelEvent::parse(r#"{"master":{"rms":"loud","peak":1}}"#).is_err());
        assert!(matches!(
            LevelEvent::parse(r#"{"master":{"rms":1e300,"peak":0.1}}"#),
            Err(LevelError::NonFinite { .. })
        ));
    }

    #[test]
    fn test_target_from_option() {
        assert_eq!(MeterTarget::from(None::<&str>), MeterTarget::Master);
        assert_eq!(MeterTarget::from(Some("master")), MeterTarget::Master);
        assert_eq!(MeterTarget::from(Some("t1")), MeterTarget::track("t1"));
    }

    #[test]
    fn test_cells_layout() {
        let lvl = StereoLevel::mono(0.25, 0.5, true);
        let cells = lvl.to_cells();
        assert_eq!(cells[1], 0.5);
        assert_eq!(cells[7], 1.0);
        assert_eq!(StereoLevel::from_cells(cells), lvl);
    }
}
