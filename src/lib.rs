/*
 *  lib.rs
 *
 *  meterbank - levels on the wire, bars on the glass
 *	(c) 2020-26 Stuart Hunter
 *
 *	Off-thread audio level metering: level store, shared render loop,
 *	worker bridge and meter painter
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

pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod level_store;
pub mod levels;
pub mod peak_hold;
pub mod pipeline;
pub mod protocol;
pub mod ready_queue;
pub mod shared_levels;
pub mod surface;
pub mod transport;
pub mod vframebuf;
pub mod worker;

pub use bridge::{BridgeError, BridgeSettings, WorkerBridge};
pub use coordinator::{Registration, RenderCoordinator, Throttle};
pub use level_store::LevelStore;
pub use levels::{LevelError, LevelEvent, LevelSnapshot, MeterTarget, StereoLevel};
pub use peak_hold::{PeakHold, PeakHoldBank};
pub use pipeline::{MeterPipeline, PipelineSettings};
pub use protocol::{MarkerKind, PreviewFrame, RenderConfig, RenderConfigPatch, SurfaceId, ThresholdMarker};
pub use shared_levels::{SharedLevelReader, SharedLevels};
pub use surface::{CanvasElement, CaptureSink, NullSink, Surface, SurfaceError, SurfaceSink};
