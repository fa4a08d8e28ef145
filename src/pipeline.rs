/*
 *  pipeline.rs
 *
 *  meterbank - levels on the wire, bars on the glass
 *	(c) 2020-26 Stuart Hunter
 *
 *	Origin-side handle tying store, holds, render loop and worker together
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

use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;

use log::{debug, info};

use crate::bridge::{BridgeError, BridgeSettings, WorkerBridge};
use crate::coordinator::{RenderCoordinator, DISPLAY_RATE_HZ};
use crate::level_store::LevelStore;
use crate::levels::{LevelError, LevelEvent, LevelSnapshot, MeterTarget, StereoLevel};
use crate::peak_hold::{PeakHold, PeakHoldBank};
use crate::protocol::{PreviewFrame, RenderConfig, RenderConfigPatch, SurfaceId};
use crate::shared_levels::SharedLevelReader;
use crate::surface::CanvasElement;
use crate::worker::WorkerStats;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineSettings {
    pub coordinator_hz: u32,
    pub bridge: BridgeSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self { coordinator_hz: DISPLAY_RATE_HZ, bridge: BridgeSettings::default() }
    }
}

struct PipelineInner {
    store: RwLock<LevelStore>,
    holds: Mutex<PeakHoldBank>,
    coordinator: RenderCoordinator,
    bridge: WorkerBridge,
}

/// Built once by start-up code and passed around by clone.
#[derive(Clone)]
pub struct MeterPipeline {
    inner: Arc<PipelineInner>,
}

impl MeterPipeline {
    /// Spawn the worker and wire everything up. Needs a tokio runtime.
    pub fn new(settings: PipelineSettings) -> Self {
        let bridge = WorkerBridge::spawn(settings.bridge);
        Self::with_bridge(bridge, settings)
    }

    pub fn with_bridge(bridge: WorkerBridge, settings: PipelineSettings) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                store: RwLock::new(LevelStore::new()),
                holds: Mutex::new(PeakHoldBank::new(settings.bridge.worker.hold)),
                coordinator: RenderCoordinator::new(settings.coordinator_hz),
                bridge,
            }),
        }
    }

    fn holds(&self) -> MutexGuard<'_, PeakHoldBank> {
        self.inner.holds.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Inbound level payload: forwarded to the worker as is, then folded into
    /// the origin store. A bad payload still goes to the worker, which drops it
    /// on its own.
    pub fn on_level_event(&self, raw: &str) -> Result<u64, LevelError> {
        self.inner.bridge.forward_raw_level_data(raw);
        let event = LevelEvent::parse(raw).inspect_err(|e| debug!("pipeline: dropping level payload: {e}"))?;

        let now = Instant::now();
        let tick = self.inner.coordinator.period();
        {
            let mut holds = self.holds();
            holds.observe_paced(&MeterTarget::Master, event.master.left_peak, event.master.right_peak, now, tick);
            for (id, lvl) in &event.tracks {
                holds.observe_paced(&MeterTarget::track(id.as_str()), lvl.left_peak, lvl.right_peak, now, tick);
            }
        }
        let mut store = self.inner.store.write().unwrap_or_else(|e| e.into_inner());
        Ok(store.apply(event))
    }

    /// Upstream went away: zero everything, keep the surfaces.
    pub fn on_transport_disconnected(&self) {
        info!("pipeline: transport disconnected, resetting levels");
        self.inner.store.write().unwrap_or_else(|e| e.into_inner()).reset();
        self.holds().clear();
        self.inner.bridge.reset_levels();
    }

    pub async fn register_meter_canvas(
        &self,
        element: &CanvasElement,
        target: MeterTarget,
        config: RenderConfig,
    ) -> Result<SurfaceId, BridgeError> {
        self.inner.bridge.register_surface(element, target, config).await
    }

    pub fn update_meter_config(&self, id: SurfaceId, patch: RenderConfigPatch) {
        self.inner.bridge.update_config(id, patch);
    }

    pub fn unregister_meter_canvas(&self, id: SurfaceId) {
        self.inner.bridge.unregister_surface(id);
    }

    pub fn resize_canvas(&self, id: SurfaceId, width: u32, height: u32, dpr: Option<f32>) {
        self.inner.bridge.resize_surface(id, width, height, dpr);
    }

    pub async fn register_preview_canvas(&self, element: &CanvasElement) -> Result<SurfaceId, BridgeError> {
        self.inner.bridge.register_preview_surface(element).await
    }

    pub fn push_preview_frame(&self, id: SurfaceId, frame: PreviewFrame) {
        self.inner.bridge.push_preview_frame(id, frame);
    }

    fn store(&self) -> std::sync::RwLockReadGuard<'_, LevelStore> {
        self.inner.store.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn master_level(&self) -> StereoLevel {
        self.store().master()
    }

    pub fn track_level(&self, id: &str) -> StereoLevel {
        self.store().track(id)
    }

    pub fn level(&self, target: &MeterTarget) -> StereoLevel {
        self.store().get(target)
    }

    pub fn snapshot(&self) -> Arc<LevelSnapshot> {
        self.store().snapshot()
    }

    /// Origin-side hold for `target`, decayed at the coordinator rate up to now
    /// regardless of how often level events arrive.
    pub fn peak_hold(&self, target: &MeterTarget) -> Option<PeakHold> {
        let tick = self.inner.coordinator.period();
        self.holds().settle(target, Instant::now(), tick)
    }

    pub fn shared_levels(&self) -> Option<SharedLevelReader> {
        self.inner.bridge.shared_levels()
    }

    pub fn coordinator(&self) -> &RenderCoordinator {
        &self.inner.coordinator
    }

    pub fn bridge(&self) -> &WorkerBridge {
        &self.inner.bridge
    }

    pub fn worker_stats(&self) -> Arc<WorkerStats> {
        self.inner.bridge.stats()
    }

    pub fn shutdown(&self) {
        self.inner.bridge.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const E2E: &str = r#"{"tracks":{"t1":{"rms":0.5,"peak":0.8,"clipping":false}},
                          "master":{"rms":0.6,"peak":0.9,"clipping":true}}"#;

    #[tokio::test]
    async fn test_origin_store_and_holds_follow_events() {
        let p = MeterPipeline::new(PipelineSettings::default());
        assert_eq!(p.master_level(), StereoLevel::default());
        assert!(p.on_level_event(E2E).is_ok());
        assert!(p.master_level().clipping);
        assert_eq!(p.track_level("t1").peak, 0.8);
        assert_eq!(p.peak_hold(&MeterTarget::track("t1")).map(|h| h.left), Some(0.8));

        assert!(p.on_level_event("garbage").is_err());
        assert_eq!(p.track_level("t1").peak, 0.8);
        p.shutdown();
    }

    #[tokio::test]
    async fn test_origin_hold_decays_between_events() {
        use crate::peak_hold::HoldSettings;
        use std::time::Duration;

        let mut settings = PipelineSettings::default();
        settings.bridge.worker.hold = HoldSettings { window: Duration::ZERO, decay: 0.5 };
        let p = MeterPipeline::new(settings);
        p.on_level_event(E2E).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let held = p.peak_hold(&MeterTarget::track("t1")).map(|h| h.left).unwrap_or(1.0);
        assert!(held < 0.8 * 0.5, "no decay without events: {held}");
        p.shutdown();
    }

        #[tokio::test]
    async fn test_disconnect_resets_origin_side() {
        let p = MeterPipeline::new(PipelineSettings::default());
        p.on_level_event(E2E).unwrap();
        let before = p.snapshot().version;
        p.on_transport_disconnected();
        assert!(p.snapshot().version > before);
        assert_eq!(p.master_level(), StereoLevel::default());
        assert!(p.peak_hold(&MeterTarget::Master).is_none());
        p.shutdown();
    }
}
