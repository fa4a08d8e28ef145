/*
 *  protocol.rs
 *
 *  meterbank - levels on the wire, bars on the glass
 *	(c) 2020-26 Stuart Hunter
 *
 *	Bridge <-> worker control messages and render configuration
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

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::levels::MeterTarget;
use crate::shared_levels::SharedLevelWriter;
use crate::surface::Surface;

/// Worker-side handle for a registered surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SurfaceId(pub u32);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface#{}", self.0)
    }
}

/// Dynamics processor a threshold marker belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerKind {
    Gate,
    Compressor,
    Expander,
}

/// Dashed line drawn at a processor threshold. Cosmetic only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdMarker {
    pub kind: MarkerKind,
    pub db_threshold: f32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// How a meter surface is dressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RenderConfig {
    /// Fader position, 0..=1
    pub volume: f32,
    pub muted: bool,
    pub is_dragging: bool,
    pub threshold_markers: Vec<ThresholdMarker>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self { volume: 1.0, muted: false, is_dragging: false, threshold_markers: Vec::new() }
    }
}

impl RenderConfig {
    pub fn volume_clamped(&self) -> f32 {
        if self.volume.is_finite() { self.volume.clamp(0.0, 1.0) } else { 0.0 }
    }
}

/// Partial update for a [`RenderConfig`]; `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RenderConfigPatch {
    pub volume: Option<f32>,
    pub muted: Option<bool>,
    pub is_dragging: Option<bool>,
    pub threshold_markers: Option<Vec<ThresholdMarker>>,
}

impl RenderConfigPatch {
    pub fn is_empty(&self) -> bool {
        self.volume.is_none()
            && self.muted.is_none()
            && self.is_dragging.is_none()
            && self.threshold_markers.is_none()
    }

    pub fn apply_to(&self, cfg: &mut RenderConfig) {
        if let Some(v) = self.volume { cfg.volume = v; }
        if let Some(m) = self.muted { cfg.muted = m; }
        if let Some(d) = self.is_dragging { cfg.is_dragging = d; }
        if let Some(t) = &self.threshold_markers { cfg.threshold_markers = t.clone(); }
    }
}

/// What the worker does with a surface.
#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceRole {
    Meter { target: MeterTarget, config: RenderConfig },
    Preview,
}

/// Packed RGB (3 bytes per pixel) frame for a preview surface.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewFrame {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

impl PreviewFrame {
    /// Bytes a `width` x `height` RGB frame needs; `None` if that overflows.
    pub fn expected_len(width: u32, height: u32) -> Option<usize> {
        (width as usize).checked_mul(height as usize).and_then(|n| n.checked_mul(3))
    }

    pub fn is_well_formed(&self) -> bool {
        self.width > 0
            && self.height > 0
            && Self::expected_len(self.width, self.height) == Some(self.rgb.len())
    }
}

/// Bridge -> worker.
#[derive(Debug)]
pub enum WorkerRequest {
    Init { id: u64, shared: Option<SharedLevelWriter> },
    RegisterCanvas { id: u64, surface_id: SurfaceId, surface: Surface, role: SurfaceRole },
    UnregisterCanvas { id: u64, surface_id: SurfaceId },
    UpdateConfig { id: u64, surface_id: SurfaceId, patch: RenderConfigPatch },
    /// Raw inbound payload, forwarded untouched.
    AudioData { id: u64, payload: String },
    Frame { id: u64, surface_id: SurfaceId, frame: PreviewFrame },
    Resize { id: u64, surface_id: SurfaceId, width: u32, height: u32, dpr: Option<f32> },
    ResetLevels { id: u64 },
}

impl WorkerRequest {
    pub fn correlation_id(&self) -> u64 {
        match self {
            WorkerRequest::Init { id, .. }
            | WorkerRequest::RegisterCanvas { id, .. }
            | WorkerRequest::UnregisterCanvas { id, .. }
            | WorkerRequest::UpdateConfig { id, .. }
            | WorkerRequest::AudioData { id, .. }
            | WorkerRequest::Frame { id, .. }
            | WorkerRequest::Resize { id, .. }
            | WorkerRequest::ResetLevels { id } => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkerRequest::Init { .. } => "init",
            WorkerRequest::RegisterCanvas { .. } => "registerCanvas",
            WorkerRequest::UnregisterCanvas { .. } => "unregisterCanvas",
            WorkerRequest::UpdateConfig { .. } => "updateConfig",
            WorkerRequest::AudioData { .. } => "audioData",
            WorkerRequest::Frame { .. } => "frame",
            WorkerRequest::Resize { .. } => "resize",
            WorkerRequest::ResetLevels { .. } => "resetLevels",
        }
    }
}

/// Worker -> bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Sent once, after the first `Init`.
    Ready { shared_bound: bool },
    Registered { id: u64, surface_id: SurfaceId },
    Failed { id: u64, reason: String },
}
