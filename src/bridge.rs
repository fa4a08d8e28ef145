/*
 *  bridge.rs
 *
 *  meterbank - levels on the wire, bars on the glass
 *	(c) 2020-26 Stuart Hunter
 *
 *	Caller-side control plane for the meter worker
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
//! [`WorkerBridge`] owns one worker. Everything submitted before the worker
//! reports ready is parked in a [`ReadyQueue`] and flushed, in order, the
//! moment `Ready` arrives. Registration is the only request with an answer:
//! the caller awaits the worker's ack (or a timeout); everything else is
//! fire-and-forget.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::levels::MeterTarget;
use crate::protocol::{
    PreviewFrame, RenderConfig, RenderConfigPatch, SurfaceId, SurfaceRole, WorkerEvent, WorkerRequest,
};
use crate::ready_queue::{Admission, ReadyQueue, Rejected, DEFAULT_CAPACITY};
use crate::shared_levels::{SharedLevelBuffer, SharedLevelReader, DEFAULT_MAX_TRACKS};
use crate::surface::{CanvasElement, ElementId};
use crate::worker::{self, WorkerEndpoint, WorkerSettings, WorkerStats};

pub const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("request queue is full")]
    QueueFull,
    #[error("registration of {id} timed out")]
    RegistrationTimedOut { id: SurfaceId },
    #[error("surface has already been transferred")]
    SurfaceUnavailable,
    #[error("registration of {id} was cancelled by unregister")]
    Cancelled { id: SurfaceId },
    #[error("meter worker is gone")]
    WorkerGone,
    #[error("meter worker rejected the request: {reason}")]
    Rejected { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BridgeSettings {
    pub queue_capacity: usize,
    pub register_timeout: Duration,
    pub shared_buffer: bool,
    pub max_tracks: usize,
    pub worker: WorkerSettings,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_CAPACITY,
            register_timeout: REGISTER_TIMEOUT,
            shared_buffer: true,
            max_tracks: DEFAULT_MAX_TRACKS,
            worker: WorkerSettings::default(),
        }
    }
}

type Waiter = oneshot::Sender<Result<SurfaceId, BridgeError>>;

enum ElementState {
    Pending { id: SurfaceId, waiters: Vec<Waiter> },
    Registered(SurfaceId),
}

impl ElementState {
    fn surface_id(&self) -> SurfaceId {
        match self {
            ElementState::Pending { id, .. } | ElementState::Registered(id) => *id,
        }
    }
}

enum SubmitError {
    Full(WorkerRequest),
    Gone(WorkerRequest),
}

struct BridgeState {
    queue: ReadyQueue<WorkerRequest>,
    // correlation id of an in-flight RegisterCanvas -> element
    pending: HashMap<u64, ElementId>,
    elements: HashMap<ElementId, ElementState>,
    offered: Option<SharedLevelReader>,
    shared: Option<SharedLevelReader>,
}

struct BridgeInner {
    state: Mutex<BridgeState>,
    requests: UnboundedSender<WorkerRequest>,
    next_request: AtomicU64,
    next_surface: AtomicU32,
    settings: BridgeSettings,
    stats: Arc<WorkerStats>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BridgeInner {
    fn state(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue or dispatch under the state lock so flushes cannot be overtaken.
    fn submit(&self, st: &mut BridgeState, req: WorkerRequest) -> Result<(), SubmitError> {
        match st.queue.submit(req) {
            Ok(Admission::Queued) => Ok(()),
            Ok(Admission::Dispatch(req)) => self.requests.send(req).map_err(|e| SubmitError::Gone(e.0)),
            Err(Rejected(req)) => Err(SubmitError::Full(req)),
        }
    }

    fn on_event(&self, event: WorkerEvent) {
        let mut st = self.state();
        match event {
            WorkerEvent::Ready { shared_bound } => {
                let Some(parked) = st.queue.mark_ready() else {
                    warn!("bridge: duplicate ready from worker ignored");
                    return;
                };
                let n = parked.len();
                for req in parked {
                    if self.requests.send(req).is_err() {
                        warn!("bridge: worker closed while flushing queued requests");
                        break;
                    }
                }
                let offered = st.offered.take();
                if shared_bound {
                    st.shared = offered;
                }
                info!("bridge: worker ready, flushed {} queued request(s)", n);
            }
            WorkerEvent::Registered { id, surface_id } => {
                let Some(element) = st.pending.remove(&id) else {
                    debug!("bridge: unexpected ack #{id} for {surface_id}");
                    return;
                };
                if let Some(state) = st.elements.get_mut(&element) {
                    let old = std::mem::replace(state, ElementState::Registered(surface_id));
                    if let ElementState::Pending { waiters, .. } = old {
                        for w in waiters {
                            let _ = w.send(Ok(surface_id));
                        }
                    }
                }
                debug!("bridge: {surface_id} registered");
            }
            WorkerEvent::Failed { id, reason } => {
                let Some(element) = st.pending.remove(&id) else {
                    debug!("bridge: request #{id} failed: {reason}");
                    return;
                };
                warn!("bridge: registration #{id} rejected: {reason}");
                if let Some(ElementState::Pending { waiters, .. }) = st.elements.remove(&element) {
                    for w in waiters {
                        let _ = w.send(Err(BridgeError::Rejected { reason: reason.clone() }));
                    }
                }
            }
        }
    }

    fn on_worker_gone(&self) {
        let mut st = self.state();
        let pending: Vec<ElementId> = st.pending.drain().map(|(_, el)| el).collect();
        for el in pending {
            if let Some(ElementState::Pending { waiters, .. }) = st.elements.remove(&el) {
                for w in waiters {
                    let _ = w.send(Err(BridgeError::WorkerGone));
                }
            }
        }
    }

    fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for t in tasks.drain(..) {
            t.abort();
        }
    }
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Handle to the worker. Cheap to clone; all clones talk to the same worker.
#[derive(Clone)]
pub struct WorkerBridge {
    inner: Arc<BridgeInner>,
}

impl WorkerBridge {
    /// Start a worker and connect to it. Must be called inside a tokio runtime.
    pub fn spawn(settings: BridgeSettings) -> Self {
        Self::connect(worker::spawn(settings.worker), settings)
    }

    /// Connect to an already running worker endpoint and send it `Init`.
    pub fn connect(endpoint: WorkerEndpoint, settings: BridgeSettings) -> Self {
        let WorkerEndpoint { requests, events, stats, task } = endpoint;

        let (writer, offered) = if settings.shared_buffer {
            match SharedLevelBuffer::allocate(settings.max_tracks) {
                Ok((w, r)) => (Some(w), Some(r)),
                Err(e) => {
                    warn!("bridge: shared level buffer unavailable ({e}), using messages only");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let inner = Arc::new(BridgeInner {
            state: Mutex::new(BridgeState {
                queue: ReadyQueue::new(settings.queue_capacity),
                pending: HashMap::new(),
                elements: HashMap::new(),
                offered,
                shared: None,
            }),
            requests,
            next_request: AtomicU64::new(1),
            next_surface: AtomicU32::new(1),
            settings,
            stats,
            tasks: Mutex::new(Vec::new()),
        });

        let init = WorkerRequest::Init { id: inner.next_id(), shared: writer };
        if inner.requests.send(init).is_err() {
            warn!("bridge: worker closed before init");
        }

        let pump = tokio::spawn(pump_events(Arc::downgrade(&inner), events));
        {
            let mut tasks = inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.extend(task);
            tasks.push(pump);
        }
        Self { inner }
    }

    /// Hand a meter surface to the worker and wait for its ack.
    pub async fn register_surface(
        &self,
        element: &CanvasElement,
        target: MeterTarget,
        config: RenderConfig,
    ) -> Result<SurfaceId, BridgeError> {
        self.register(element, SurfaceRole::Meter { target, config }).await
    }

    /// Hand a video-preview surface to the worker and wait for its ack.
    pub async fn register_preview_surface(&self, element: &CanvasElement) -> Result<SurfaceId, BridgeError> {
        self.register(element, SurfaceRole::Preview).await
    }

    async fn register(&self, element: &CanvasElement, role: SurfaceRole) -> Result<SurfaceId, BridgeError> {
        let (surface_id, rx) = {
            let mut st = self.inner.state();
            match st.elements.get_mut(&element.id()) {
                Some(ElementState::Registered(id)) => return Ok(*id),
                Some(ElementState::Pending { id, waiters }) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    (*id, rx)
                }
                None => {
                    let Some(surface) = element.take_for_transfer() else {
                        return Err(BridgeError::SurfaceUnavailable);
                    };
                    let surface_id = SurfaceId(self.inner.next_surface.fetch_add(1, Ordering::Relaxed));
                    let id = self.inner.next_id();
                    let req = WorkerRequest::RegisterCanvas { id, surface_id, surface, role };
                    if let Err(e) = self.inner.submit(&mut st, req) {
                        let (req, err) = match e {
                            SubmitError::Full(req) => (req, BridgeError::QueueFull),
                            SubmitError::Gone(req) => (req, BridgeError::WorkerGone),
                        };
                        if let WorkerRequest::RegisterCanvas { surface, .. } = req {
                            element.restore(surface);
                        }
                        warn!("bridge: registration of {surface_id} refused: {err}");
                        return Err(err);
                    }
                    let (tx, rx) = oneshot::channel();
                    st.pending.insert(id, element.id());
                    st.elements.insert(element.id(), ElementState::Pending { id: surface_id, waiters: vec![tx] });
                    (surface_id, rx)
                }
            }
        };

        match tokio::time::timeout(self.inner.settings.register_timeout, rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(BridgeError::WorkerGone),
            Err(_) => {
                warn!("bridge: no ack for {surface_id} within {:?}", self.inner.settings.register_timeout);
                Err(BridgeError::RegistrationTimedOut { id: surface_id })
            }
        }
    }

    fn fire(&self, make: impl FnOnce(u64) -> WorkerRequest) {
        let req = make(self.inner.next_id());
        let kind = req.kind();
        let mut st = self.inner.state();
        match self.inner.submit(&mut st, req) {
            Ok(()) => {}
            Err(SubmitError::Full(_)) => warn!("bridge: queue full, {kind} dropped"),
            Err(SubmitError::Gone(_)) => debug!("bridge: worker gone, {kind} dropped"),
        }
    }

    /// Forget a surface. Works for registrations that timed out too; callers
    /// still awaiting a pending registration get `Cancelled`.
    pub fn unregister_surface(&self, surface_id: SurfaceId) {
        {
            let mut st = self.inner.state();
            let dropped: Vec<ElementId> = st
                .elements
                .iter()
                .filter(|(_, s)| s.surface_id() == surface_id)
                .map(|(el, _)| *el)
                .collect();
            for el in &dropped {
                if let Some(ElementState::Pending { waiters, .. }) = st.elements.remove(el) {
                    for w in waiters {
                        let _ = w.send(Err(BridgeError::Cancelled { id: surface_id }));
                    }
                }
            }
            st.pending.retain(|_, el| !dropped.contains(el));
        }
        self.fire(|id| WorkerRequest::UnregisterCanvas { id, surface_id });
    }

    pub fn update_config(&self, surface_id: SurfaceId, patch: RenderConfigPatch) {
        self.fire(|id| WorkerRequest::UpdateConfig { id, surface_id, patch });
    }

    /// Pass an inbound payload through untouched.
    pub fn forward_raw_level_data(&self, payload: impl Into<String>) {
        let payload = payload.into();
        self.fire(|id| WorkerRequest::AudioData { id, payload });
    }

    pub fn push_preview_frame(&self, surface_id: SurfaceId, frame: PreviewFrame) {
        self.fire(|id| WorkerRequest::Frame { id, surface_id, frame });
    }

    pub fn resize_surface(&self, surface_id: SurfaceId, width: u32, height: u32, dpr: Option<f32>) {
        self.fire(|id| WorkerRequest::Resize { id, surface_id, width, height, dpr });
    }

    pub fn reset_levels(&self) {
        self.fire(|id| WorkerRequest::ResetLevels { id });
    }

    /// Reader for the shared region, once the worker has confirmed it bound it.
    pub fn shared_levels(&self) -> Option<SharedLevelReader> {
        self.inner.state().shared.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.state().queue.is_ready()
    }

    pub fn queued(&self) -> usize {
        self.inner.state().queue.len()
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.inner.stats)
    }

    /// Stop the worker and the event pump. Pending registrations fail.
    pub fn shutdown(&self) {
        info!("bridge: shutting down worker");
        self.inner.abort_tasks();
        self.inner.on_worker_gone();
    }
}

async fn pump_events(inner: Weak<BridgeInner>, mut events: UnboundedReceiver<WorkerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else { return };
        inner.on_event(event);
    }
    if let Some(inner) = inner.upgrade() {
        debug!("bridge: worker event stream closed");
        inner.on_worker_gone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{NullSink, Surface};
    use tokio::sync::mpsc;

    struct FakeWorker {
        requests: UnboundedReceiver<WorkerRequest>,
        events: UnboundedSender<WorkerEvent>,
    }

    fn fake(settings: BridgeSettings) -> (WorkerBridge, FakeWorker) {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();
        let ep = WorkerEndpoint { requests: req_tx, events: evt_rx, stats: Arc::default(), task: None };
        (WorkerBridge::connect(ep, settings), FakeWorker { requests: req_rx, events: evt_tx })
    }

    fn element() -> CanvasElement {
        CanvasElement::new(Surface::new(10, 40, 1.0, Box::new(NullSink)))
    }

    #[tokio::test]
    async fn test_fire_and_forget_waits_for_ready() {
        let (bridge, mut fw) = fake(BridgeSettings { shared_buffer: false, ..Default::default() });
        assert!(matches!(fw.requests.recv().await, Some(WorkerRequest::Init { shared: None, .. })));

        bridge.forward_raw_level_data("a");
        bridge.reset_levels();
        bridge.forward_raw_level_data("b");
        assert_eq!(bridge.queued(), 3);
        assert!(fw.requests.try_recv().is_err());

        fw.events.send(WorkerEvent::Ready { shared_bound: false }).unwrap();
        let kinds: Vec<_> = [
            fw.requests.recv().await.unwrap(),
            fw.requests.recv().await.unwrap(),
            fw.requests.recv().await.unwrap(),
        ]
        .iter()
        .map(|r| r.kind())
        .collect();
        assert_eq!(kinds, vec!["audioData", "resetLevels", "audioData"]);
        assert!(bridge.is_ready());
    }

    #[tokio::test]
    async fn test_queue_overflow_returns_surface() {
        let (bridge, _fw) = fake(BridgeSettings { queue_capacity: 1, shared_buffer: false, ..Default::default() });
        bridge.forward_raw_level_data("fills the queue");
        let el = element();
        let err = bridge.register_surface(&el, MeterTarget::Master, RenderConfig::default()).await;
        assert_eq!(err, Err(BridgeError::QueueFull));
        assert!(!el.is_transferred());
    }

    #[tokio::test]
    async fn test_registration_timeout_carries_id() {
        let settings = BridgeSettings {
            register_timeout: Duration::from_millis(30),
            shared_buffer: false,
            ..Default::default()
        };
        let (bridge, _fw) = fake(settings);
        let el = element();
        let err = bridge.register_surface(&el, MeterTarget::Master, RenderConfig::default()).await;
        let Err(BridgeError::RegistrationTimedOut { id }) = err else { panic!("expected timeout, got {err:?}") };
        assert!(el.is_transferred());
        assert_eq!(bridge.inner.state().pending.len(), 1);
        bridge.unregister_surface(id);
        assert!(bridge.inner.state().pending.is_empty());
        assert!(bridge.inner.state().elements.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_cancels_pending_registration() {
        let (bridge, mut fw) = fake(BridgeSettings { shared_buffer: false, ..Default::default() });
        let _init = fw.requests.recv().await;
        fw.events.send(WorkerEvent::Ready { shared_bound: false }).unwrap();

        let el = element();
        let b = bridge.clone();
        let reg = tokio::spawn(async move {
            b.register_surface(&el, MeterTarget::Master, RenderConfig::default()).await
        });
        let Some(WorkerRequest::RegisterCanvas { id, surface_id, .. }) = fw.requests.recv().await else {
            panic!("no register")
        };
        bridge.unregister_surface(surface_id);
        assert_eq!(reg.await.unwrap(), Err(BridgeError::Cancelled { id: surface_id }));
        assert!(bridge.inner.state().pending.is_empty());
        assert!(matches!(fw.requests.recv().await, Some(WorkerRequest::UnregisterCanvas { .. })));

        // a late ack for the cancelled registration is ignored
        fw.events.send(WorkerEvent::Registered { id, surface_id }).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(bridge.inner.state().elements.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_registration() {
        let (bridge, mut fw) = fake(BridgeSettings { shared_buffer: false, ..Default::default() });
        let _init = fw.requests.recv().await;
        fw.events.send(WorkerEvent::Ready { shared_bound: false }).unwrap();

        let el = element();
        let b = bridge.clone();
        let reg = tokio::spawn(async move {
            b.register_surface(&el, MeterTarget::Master, RenderConfig::default()).await
        });
        let Some(WorkerRequest::RegisterCanvas { id, .. }) = fw.requests.recv().await else { panic!("no register") };
        fw.events.send(WorkerEvent::Failed { id, reason: "nope".into() }).unwrap();
        assert_eq!(reg.await.unwrap(), Err(BridgeError::Rejected { reason: "nope".into() }));
    }

    #[tokio::test]
    async fn test_shared_reader_only_after_bound_ready() {
        let (bridge, mut fw) = fake(BridgeSettings::default());
        let Some(WorkerRequest::Init { shared, .. }) = fw.requests.recv().await else { panic!("no init") };
        assert!(shared.is_some());
        assert!(bridge.shared_levels().is_none());
        fw.events.send(WorkerEvent::Ready { shared_bound: true }).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(bridge.shared_levels().is_some());
    }

    #[tokio::test]
    async fn test_shared_reader_withheld_when_not_bound() {
        let (bridge, fw) = fake(BridgeSettings::default());
        fw.events.send(WorkerEvent::Ready { shared_bound: false }).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(bridge.is_ready());
        assert!(bridge.shared_levels().is_none());
    }

    #[tokio::test]
    async fn test_worker_gone_fails_pending() {
        let (bridge, fw) = fake(BridgeSettings { shared_buffer: false, ..Default::default() });
        let el = element();
        let b = bridge.clone();
        let reg = tokio::spawn(async move {
            b.register_surface(&el, MeterTarget::Master, RenderConfig::default()).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(fw);
        assert_eq!(reg.await.unwrap(), Err(BridgeError::WorkerGone));
    }
}
