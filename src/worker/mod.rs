/*
 *  worker/mod.rs
 *
 *  meterbank - levels on the wire, bars on the glass
 *	(c) 2020-26 Stuart Hunter
 *
 *	Meter worker: owns transferred surfaces and runs the paint loop
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
//! The worker is a single tokio task. It keeps its own [`LevelStore`] fed by
//! forwarded raw payloads, its own peak-hold state, and every surface handed
//! to it. While at least one surface is registered a fixed-interval timer
//! drives [`MeterWorker::paint_tick`]; nothing here depends on anyone
//! looking at the output.

pub mod paint;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};

use crate::level_store::LevelStore;
use crate::levels::{MeterTarget, StereoLevel};
use crate::peak_hold::{HoldSettings, PeakHold, PeakHoldBank};
use crate::protocol::{PreviewFrame, RenderConfigPatch, SurfaceId, SurfaceRole, WorkerEvent, WorkerRequest};
use crate::shared_levels::SharedLevelWriter;
use crate::surface::{DrawContext, Surface};

use paint::{blit_preview, paint_meter, Gradient, PaintInputs};

pub const PAINT_RATE_HZ: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerSettings {
    pub paint_hz: u32,
    pub hold: HoldSettings,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self { paint_hz: PAINT_RATE_HZ, hold: HoldSettings::default() }
    }
}

impl WorkerSettings {
    pub fn paint_period(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.paint_hz.max(1) as u64)
    }
}

/// Counters readable from any thread.
#[derive(Debug, Default)]
pub struct WorkerStats {
    paint_ticks: AtomicU64,
    frames_presented: AtomicU64,
    present_errors: AtomicU64,
    dropped_payloads: AtomicU64,
    surfaces: AtomicUsize,
    rendering: AtomicBool,
}

impl WorkerStats {
    pub fn paint_ticks(&self) -> u64 { self.paint_ticks.load(Ordering::Relaxed) }
    pub fn frames_presented(&self) -> u64 { self.frames_presented.load(Ordering::Relaxed) }
    pub fn present_errors(&self) -> u64 { self.present_errors.load(Ordering::Relaxed) }
    pub fn dropped_payloads(&self) -> u64 { self.dropped_payloads.load(Ordering::Relaxed) }
    pub fn surfaces(&self) -> usize { self.surfaces.load(Ordering::Relaxed) }
    pub fn is_rendering(&self) -> bool { self.rendering.load(Ordering::Relaxed) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Uninitialized,
    Ready,
    Rendering(usize),
}

struct RegisteredSurface {
    surface: Surface,
    role: SurfaceRole,
    context: Option<DrawContext>,
    gradient: Option<Gradient>,
    last_painted: Option<PaintInputs>,
}

impl RegisteredSurface {
    fn rebind(&mut self, id: SurfaceId) {
        self.context = match self.surface.bind_context() {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                warn!("{id}: {e}; kept registered but will not paint");
                None
            }
        };
        self.gradient = None;
        self.last_painted = None;
    }
}

/// Both ends of a running worker, as seen from the bridge.
pub struct WorkerEndpoint {
    pub requests: UnboundedSender<WorkerRequest>,
    pub events: UnboundedReceiver<WorkerEvent>,
    pub stats: Arc<WorkerStats>,
    pub task: Option<JoinHandle<()>>,
}

/// Start a worker task. Must be called inside a tokio runtime.
pub fn spawn(settings: WorkerSettings) -> WorkerEndpoint {
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let (evt_tx, evt_rx) = mpsc::unbounded_channel();
    let worker = MeterWorker::new(settings, evt_tx);
    let stats = worker.stats();
    let task = tokio::spawn(worker.run(req_rx));
    WorkerEndpoint { requests: req_tx, events: evt_rx, stats, task: Some(task) }
}

pub struct MeterWorker {
    settings: WorkerSettings,
    initialized: bool,
    levels: LevelStore,
    holds: PeakHoldBank,
    shared: Option<SharedLevelWriter>,
    surfaces: BTreeMap<SurfaceId, RegisteredSurface>,
    events: UnboundedSender<WorkerEvent>,
    stats: Arc<WorkerStats>,
}

impl MeterWorker {
    pub fn new(settings: WorkerSettings, events: UnboundedSender<WorkerEvent>) -> Self {
        Self {
            settings,
            initialized: false,
            levels: LevelStore::new(),
            holds: PeakHoldBank::new(settings.hold),
            shared: None,
            surfaces: BTreeMap::new(),
            events,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    pub fn state(&self) -> WorkerState {
        match (self.initialized, self.surfaces.len()) {
            (false, _) => WorkerState::Uninitialized,
            (true, 0) => WorkerState::Ready,
            (true, n) => WorkerState::Rendering(n),
        }
    }

    pub fn level(&self, target: &MeterTarget) -> StereoLevel {
        self.levels.get(target)
    }

    pub fn peak_hold(&self, target: &MeterTarget) -> Option<PeakHold> {
        self.holds.get(target)
    }

    pub async fn run(mut self, mut requests: UnboundedReceiver<WorkerRequest>) {
        info!("meter worker started");
        let mut ticker: Option<Interval> = None;
        loop {
            tokio::select! {
                req = requests.recv() => match req {
                    Some(req) => {
                        self.handle(req);
                        self.sync_ticker(&mut ticker);
                    }
                    None => break,
                },
                _ = next_tick(&mut ticker) => self.paint_tick(Instant::now()),
            }
        }
        self.stats.rendering.store(false, Ordering::Relaxed);
        info!("meter worker stopped");
    }

    fn sync_ticker(&self, ticker: &mut Option<Interval>) {
        let want = matches!(self.state(), WorkerState::Rendering(_));
        match (want, ticker.is_some()) {
            (true, false) => {
                let period = self.settings.paint_period();
                info!("meter worker: render loop started ({:?})", period);
                let mut t = interval(period);
                t.set_missed_tick_behavior(MissedTickBehavior::Skip);
                *ticker = Some(t);
            }
            (false, true) => {
                info!("meter worker: render loop stopped");
                *ticker = None;
            }
            _ => {}
        }
        self.stats.rendering.store(ticker.is_some(), Ordering::Relaxed);
    }

    fn emit(&self, event: WorkerEvent) {
        if self.events.send(event).is_err() {
            debug!("meter worker: bridge went away, event dropped");
        }
    }

    fn fail(&self, id: u64, reason: impl Into<String>) {
        let reason = reason.into();
        debug!("meter worker: request {id} failed: {reason}");
        self.emit(WorkerEvent::Failed { id, reason });
    }

    pub fn handle(&mut self, req: WorkerRequest) {
        debug!("meter worker: {} #{}", req.kind(), req.correlation_id());
        if !self.initialized && !matches!(req, WorkerRequest::Init { .. }) {
            self.fail(req.correlation_id(), format!("{} before init", req.kind()));
            return;
        }
        match req {
            WorkerRequest::Init { id, shared } => self.on_init(id, shared),
            WorkerRequest::RegisterCanvas { id, surface_id, surface, role } => {
                self.on_register(id, surface_id, surface, role)
            }
            WorkerRequest::UnregisterCanvas { id, surface_id } => {
                if self.surfaces.remove(&surface_id).is_some() {
                    debug!("{surface_id}: unregistered");
                } else {
                    self.fail(id, format!("{surface_id} is not registered"));
                }
                self.stats.surfaces.store(self.surfaces.len(), Ordering::Relaxed);
            }
            WorkerRequest::UpdateConfig { id, surface_id, patch } => self.on_update_config(id, surface_id, &patch),
            WorkerRequest::AudioData { payload, .. } => self.on_audio_data(&payload),
            WorkerRequest::Frame { id, surface_id, frame } => self.on_frame(id, surface_id, &frame),
            WorkerRequest::Resize { id, surface_id, width, height, dpr } => {
                match self.surfaces.get_mut(&surface_id) {
                    Some(entry) => {
                        entry.surface.set_css_size(width, height, dpr);
                        entry.rebind(surface_id);
                    }
                    None => self.fail(id, format!("{surface_id} is not registered")),
                }
            }
            WorkerRequest::ResetLevels { .. } => {
                self.levels.reset();
                self.holds.clear();
                self.publish_shared();
                debug!("meter worker: levels and holds reset");
            }
        }
    }

    fn on_init(&mut self, id: u64, shared: Option<SharedLevelWriter>) {
        if self.initialized {
            warn!("meter worker: repeated init #{id} ignored");
            return;
        }
        self.initialized = true;
        let shared_bound = shared.is_some();
        self.shared = shared;
        self.publish_shared();
        info!("meter worker ready (shared levels: {})", if shared_bound { "bound" } else { "off" });
        self.emit(WorkerEvent::Ready { shared_bound });
    }

    fn on_register(&mut self, id: u64, surface_id: SurfaceId, surface: Surface, role: SurfaceRole) {
        let mut entry = RegisteredSurface { surface, role, context: None, gradient: None, last_painted: None };
        entry.rebind(surface_id);
        if let Some(ctx) = entry.context {
            debug!("{surface_id}: registered {}x{} @{}", ctx.width, ctx.height, ctx.scale);
        }
        if self.surfaces.insert(surface_id, entry).is_some() {
            warn!("{surface_id}: registered twice, previous surface dropped");
        }
        self.stats.surfaces.store(self.surfaces.len(), Ordering::Relaxed);
        self.emit(WorkerEvent::Registered { id, surface_id });
    }

    fn on_update_config(&mut self, id: u64, surface_id: SurfaceId, patch: &RenderConfigPatch) {
        let why = match self.surfaces.get_mut(&surface_id).map(|e| &mut e.role) {
            Some(SurfaceRole::Meter { config, .. }) => {
                patch.apply_to(config);
                return;
            }
            Some(SurfaceRole::Preview) => "is a preview surface",
            None => "is not registered",
        };
        self.fail(id, format!("{surface_id} {why}"));
    }

    fn on_audio_data(&mut self, payload: &str) {
        match self.levels.update(payload) {
            Ok(_) => self.publish_shared(),
            Err(e) => {
                debug!("meter worker: dropping level payload: {e}");
                self.stats.dropped_payloads.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn on_frame(&mut self, id: u64, surface_id: SurfaceId, frame: &PreviewFrame) {
        let Some(entry) = self.surfaces.get_mut(&surface_id) else {
            return self.fail(id, format!("{surface_id} is not registered"));
        };
        if !matches!(entry.role, SurfaceRole::Preview) {
            return self.fail(id, format!("{surface_id} is not a preview surface"));
        }
        if !frame.is_well_formed() {
            let (w, h, n) = (frame.width, frame.height, frame.rgb.len());
            return self.fail(id, format!("{surface_id}: malformed {w}x{h} frame of {n} bytes"));
        }
        if entry.context.is_none() {
            return;
        }
        let fb = entry.surface.frame_mut();
        match blit_preview(fb, frame) {
            Ok(()) => {}
            Err(never) => match never {},
        }
        match entry.surface.present() {
            Ok(()) => {
                self.stats.frames_presented.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("{surface_id}: {e}");
                self.stats.present_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn publish_shared(&mut self) {
        if let Some(w) = self.shared.as_mut() {
            w.publish(&self.levels.snapshot());
        }
    }

    /// One paint pass: advance holds once per target, repaint what changed.
    pub fn paint_tick(&mut self, now: Instant) {
        self.stats.paint_ticks.fetch_add(1, Ordering::Relaxed);
        let snapshot = self.levels.snapshot();

        let targets: BTreeSet<&MeterTarget> = self
            .surfaces
            .values()
            .filter_map(|e| match &e.role {
                SurfaceRole::Meter { target, .. } => Some(target),
                SurfaceRole::Preview => None,
            })
            .collect();
        let mut holds: HashMap<MeterTarget, PeakHold> = HashMap::with_capacity(targets.len());
        for target in targets {
            let lvl = snapshot.get(target);
            let hold = self.holds.observe(target, lvl.left_peak, lvl.right_peak, now);
            holds.insert(target.clone(), hold);
        }

        for (id, entry) in self.surfaces.iter_mut() {
            let SurfaceRole::Meter { target, config } = &entry.role else { continue };
            let Some(ctx) = entry.context else { continue };
            let inputs = PaintInputs::new(snapshot.get(target), holds.get(target), config, &ctx);
            if entry.last_painted.as_ref() == Some(&inputs) {
                continue;
            }
            match paint_meter(entry.surface.frame_mut(), &ctx, &inputs, &mut entry.gradient) {
                Ok(()) => {}
                Err(never) => match never {},
            }
            match entry.surface.present() {
                Ok(()) => {
                    entry.last_painted = Some(inputs);
                    self.stats.frames_presented.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!("{id}: {e}");
                    self.stats.present_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RenderConfig;
    use crate::shared_levels::SharedLevelBuffer;
    use crate::surface::{CaptureSink, NullSink};

    const E2E: &str = r#"{"tracks":{"t1":{"rms":0.5,"peak":0.8,"clipping":false}},
                          "master":{"rms":0.6,"peak":0.9,"clipping":true}}"#;

    fn worker() -> (MeterWorker, UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MeterWorker::new(WorkerSettings::default(), tx), rx)
    }

    fn meter(target: MeterTarget) -> SurfaceRole {
        SurfaceRole::Meter { target, config: RenderConfig::default() }
    }

    fn init(w: &mut MeterWorker) {
        w.handle(WorkerRequest::Init { id: 1, shared: None });
    }

    #[test]
    fn test_requests_before_init_fail() {
        let (mut w, mut rx) = worker();
        w.handle(WorkerRequest::AudioData { id: 5, payload: E2E.into() });
        assert!(matches!(rx.try_recv(), Ok(WorkerEvent::Failed { id: 5, .. })));
        assert_eq!(w.state(), WorkerState::Uninitialized);
        assert_eq!(w.level(&MeterTarget::Master), StereoLevel::default());
    }

    #[test]
    fn test_ready_is_sent_once() {
        let (mut w, mut rx) = worker();
        let (writer, _reader) = SharedLevelBuffer::allocate(4).unwrap();
        w.handle(WorkerRequest::Init { id: 1, shared: Some(writer) });
        w.handle(WorkerRequest::Init { id: 2, shared: None });
        assert_eq!(rx.try_recv(), Ok(WorkerEvent::Ready { shared_bound: true }));
        assert!(rx.try_recv().is_err());
        assert_eq!(w.state(), WorkerState::Ready);
    }

    #[test]
    fn test_state_follows_surface_count() {
        let (mut w, mut rx) = worker();
        init(&mut w);
        let _ = rx.try_recv();
        let s = Surface::new(20, 100, 1.0, Box::new(NullSink));
        w.handle(WorkerRequest::RegisterCanvas { id: 2, surface_id: SurfaceId(1), surface: s, role: meter(MeterTarget::Master) });
        assert_eq!(rx.try_recv(), Ok(WorkerEvent::Registered { id: 2, surface_id: SurfaceId(1) }));
        assert_eq!(w.state(), WorkerState::Rendering(1));
        w.handle(WorkerRequest::UnregisterCanvas { id: 3, surface_id: SurfaceId(1) });
        assert_eq!(w.state(), WorkerState::Ready);
    }

    #[test]
    fn test_audio_data_updates_levels_and_shared() {
        let (mut w, _rx) = worker();
        let (writer, reader) = SharedLevelBuffer::allocate(4).unwrap();
        w.handle(WorkerRequest::Init { id: 1, shared: Some(writer) });
        w.handle(WorkerRequest::AudioData { id: 2, payload: E2E.into() });
        w.handle(WorkerRequest::AudioData { id: 3, payload: "{nope".into() });
        assert!(w.level(&MeterTarget::Master).clipping);
        assert_eq!(w.level(&MeterTarget::track("t1")).peak, 0.8);
        assert_eq!(w.stats().dropped_payloads(), 1);
        let shared = reader.read().unwrap();
        assert_eq!(shared.track("t1").peak, 0.8);
        assert!(shared.master.clipping);
    }

    #[test]
    fn test_unchanged_surface_is_not_repainted() {
        let (mut w, _rx) = worker();
        init(&mut w);
        let sink = CaptureSink::new();
        let s = Surface::new(20, 100, 1.0, Box::new(sink.clone()));
        w.handle(WorkerRequest::RegisterCanvas { id: 2, surface_id: SurfaceId(1), surface: s, role: meter(MeterTarget::Master) });

        let t0 = Instant::now();
        w.paint_tick(t0);
        w.paint_tick(t0 + Duration::from_millis(33));
        assert_eq!(sink.presents(), 1);

        w.handle(WorkerRequest::AudioData { id: 3, payload: E2E.into() });
        w.paint_tick(t0 + Duration::from_millis(66));
        assert_eq!(sink.presents(), 2);

        w.handle(WorkerRequest::UpdateConfig {
            id: 4,
            surface_id: SurfaceId(1),
            patch: RenderConfigPatch { muted: Some(true), ..Default::default() },
        });
        w.paint_tick(t0 + Duration::from_millis(99));
        assert_eq!(sink.presents(), 3);
        assert_eq!(w.stats().frames_presented(), 3);
    }

    #[test]
    fn test_zero_sized_surface_never_paints() {
        let (mut w, mut rx) = worker();
        init(&mut w);
        let _ = rx.try_recv();
        let sink = CaptureSink::new();
        let s = Surface::new(0, 0, 1.0, Box::new(sink.clone()));
        w.handle(WorkerRequest::RegisterCanvas { id: 2, surface_id: SurfaceId(9), surface: s, role: meter(MeterTarget::Master) });
        assert!(matches!(rx.try_recv(), Ok(WorkerEvent::Registered { .. })));
        w.paint_tick(Instant::now());
        assert_eq!(sink.presents(), 0);
        assert_eq!(w.state(), WorkerState::Rendering(1));

        // resizing to a real size brings it to life
        w.handle(WorkerRequest::Resize { id: 3, surface_id: SurfaceId(9), width: 10, height: 50, dpr: Some(2.0) });
        w.paint_tick(Instant::now());
        assert_eq!(sink.presents(), 1);
        assert_eq!(sink.last_frame().unwrap().height(), 100);
    }

    #[test]
    fn test_hold_advances_once_per_target() {
        let (mut w, _rx) = worker();
        init(&mut w);
        for n in 0..3 {
            let s = Surface::new(10, 40, 1.0, Box::new(NullSink));
            w.handle(WorkerRequest::RegisterCanvas { id: 10 + n, surface_id: SurfaceId(n as u32), surface: s, role: meter(MeterTarget::Master) });
        }
        w.handle(WorkerRequest::AudioData { id: 20, payload: r#"{"master":{"rms":0.1,"peak":0.5}}"#.into() });
        let t0 = Instant::now();
        w.paint_tick(t0);
        w.handle(WorkerRequest::AudioData { id: 21, payload: r#"{"master":{"rms":0,"peak":0}}"#.into() });
        let past = t0 + HoldSettings::default().window + Duration::from_millis(1);
        w.paint_tick(past);
        // three surfaces share the target, so one decay step, not three
        let held = w.peak_hold(&MeterTarget::Master).unwrap();
        assert!((held.left - 0.5 * 0.98).abs() < 1e-5);
    }

    #[test]
    fn test_reset_levels_clears_holds() {
        let (mut w, _rx) = worker();
        init(&mut w);
        let s = Surface::new(10, 40, 1.0, Box::new(NullSink));
        w.handle(WorkerRequest::RegisterCanvas { id: 2, surface_id: SurfaceId(1), surface: s, role: meter(MeterTarget::track("t1")) });
        w.handle(WorkerRequest::AudioData { id: 3, payload: E2E.into() });
        w.paint_tick(Instant::now());
        assert!(w.peak_hold(&MeterTarget::track("t1")).is_some());
        w.handle(WorkerRequest::ResetLevels { id: 4 });
        assert!(w.peak_hold(&MeterTarget::track("t1")).is_none());
        assert_eq!(w.level(&MeterTarget::track("t1")), StereoLevel::default());
        assert_eq!(w.state(), WorkerState::Rendering(1));
    }

    #[test]
    fn test_preview_frames_are_blitted() {
        let (mut w, mut rx) = worker();
        init(&mut w);
        let _ = rx.try_recv();
        let sink = CaptureSink::new();
        let s = Surface::new(4, 2, 1.0, Box::new(sink.clone()));
        w.handle(WorkerRequest::RegisterCanvas { id: 2, surface_id: SurfaceId(3), surface: s, role: SurfaceRole::Preview });
        let _ = rx.try_recv();
        let frame = PreviewFrame { width: 1, height: 1, rgb: vec![1, 2, 3] };
        w.handle(WorkerRequest::Frame { id: 3, surface_id: SurfaceId(3), frame });
        assert_eq!(sink.presents(), 1);
        w.paint_tick(Instant::now());
        assert_eq!(sink.presents(), 1);

        w.handle(WorkerRequest::UpdateConfig { id: 4, surface_id: SurfaceId(3), patch: RenderConfigPatch::default() });
        assert!(matches!(rx.try_recv(), Ok(WorkerEvent::Failed { id: 4, .. })));
    }

    #[test]
    fn test_oversized_frame_is_refused() {
        let (mut w, mut rx) = worker();
        init(&mut w);
        let _ = rx.try_recv();
        let sink = CaptureSink::new();
        let s = Surface::new(4, 2, 1.0, Box::new(sink.clone()));
        w.handle(WorkerRequest::RegisterCanvas { id: 2, surface_id: SurfaceId(3), surface: s, role: SurfaceRole::Preview });
        let _ = rx.try_recv();

        let frame = PreviewFrame { width: 65536, height: 65536, rgb: vec![] };
        w.handle(WorkerRequest::Frame { id: 3, surface_id: SurfaceId(3), frame });
        assert!(matches!(rx.try_recv(), Ok(WorkerEvent::Failed { id: 3, .. })));
        assert_eq!(sink.presents(), 0);

        // still serving frames afterwards
        let frame = PreviewFrame { width: 1, height: 1, rgb: vec![9, 9, 9] };
        w.handle(WorkerRequest::Frame { id: 4, surface_id: SurfaceId(3), frame });
        assert_eq!(sink.presents(), 1);
    }

    #[tokio::test]
    async fn test_run_loop_starts_and_stops() {
        let mut ep = spawn(WorkerSettings { paint_hz: 200, ..Default::default() });
        ep.requests.send(WorkerRequest::Init { id: 1, shared: None }).unwrap();
        assert_eq!(ep.events.recv().await, Some(WorkerEvent::Ready { shared_bound: false }));
        assert!(!ep.stats.is_rendering());

        let s = Surface::new(10, 40, 1.0, Box::new(NullSink));
        ep.requests
            .send(WorkerRequest::RegisterCanvas { id: 2, surface_id: SurfaceId(1), surface: s, role: meter(MeterTarget::Master) })
            .unwrap();
        assert!(matches!(ep.events.recv().await, Some(WorkerEvent::Registered { .. })));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ep.stats.is_rendering());
        assert!(ep.stats.paint_ticks() > 0);

        ep.requests.send(WorkerRequest::UnregisterCanvas { id: 3, surface_id: SurfaceId(1) }).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!ep.stats.is_rendering());
        let settled = ep.stats.paint_ticks();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(ep.stats.paint_ticks(), settled);

        drop(ep.requests);
        if let Some(task) = ep.task.take() {
            task.await.unwrap();
        }
    }
}
