/*
 *  coordinator.rs
 *
 *  meterbank - levels on the wire, bars on the glass
 *	(c) 2020-26 Stuart Hunter
 *
 *	One shared tick loop for every on-screen consumer
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
//! Instead of every meter running its own timer, consumers register a
//! callback here and a single loop drives them all. The loop only exists
//! while at least one callback is registered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

pub const DISPLAY_RATE_HZ: u32 = 60;

type Callback = Box<dyn FnMut(f64) + Send>;

/// Keyed "has enough time passed" helper.
///
/// Lets a caller run a sub-step less often than it is ticked, e.g. redraw a
/// numeric readout at 10 Hz while the bar itself moves every tick.
#[derive(Debug, Default, Clone)]
pub struct Throttle {
    last: HashMap<String, f64>,
}

impl Throttle {
    pub fn new() -> Self {
        Self::default()
    }

    /// True (and re-armed) when `interval_ms` has passed since the last `true` for `key`.
    pub fn should_update(&mut self, key: &str, timestamp_ms: f64, interval_ms: f64) -> bool {
        match self.last.get_mut(key) {
            Some(last) if timestamp_ms - *last < interval_ms => false,
            Some(last) => {
                *last = timestamp_ms;
                true
            }
            None => {
                self.last.insert(key.to_string(), timestamp_ms);
                true
            }
        }
    }

    pub fn forget(&mut self, key: &str) {
        self.last.remove(key);
    }
}

#[derive(Default)]
struct Registry {
    // id -> (generation, callback); the generation ties a Registration to one callback
    callbacks: HashMap<String, (u64, Arc<Mutex<Callback>>)>,
    next_generation: u64,
    throttle: Throttle,
    loop_task: Option<JoinHandle<()>>,
}

struct Shared {
    registry: Mutex<Registry>,
    epoch: Instant,
    period: Duration,
    ticks: AtomicU64,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now_ms(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1000.0
    }

    fn tick(&self) {
        let ts = self.now_ms();
        // run callbacks without the registry lock so they may (un)register
        let callbacks: Vec<_> = self.registry().callbacks.values().map(|(_, cb)| Arc::clone(cb)).collect();
        for cb in callbacks {
            let mut f = cb.lock().unwrap_or_else(|e| e.into_inner());
            (*f)(ts);
        }
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }
}

/// Shared scheduling loop. Cheap to clone; clones drive the same loop.
///
/// `register` must be called from inside a tokio runtime.
#[derive(Clone)]
pub struct RenderCoordinator {
    shared: Arc<Shared>,
}

/// Returned by [`RenderCoordinator::register`]; consume it to unregister.
#[must_use = "dropping the registration leaves the callback running"]
pub struct Registration {
    id: String,
    generation: u64,
    shared: Arc<Shared>,
}

impl Registration {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn unregister(self) {
        RenderCoordinator::remove(&self.shared, &self.id, self.generation);
    }
}

impl RenderCoordinator {
    pub fn new(rate_hz: u32) -> Self {
        let period = Duration::from_micros((1_000_000u32 / rate_hz.max(1)) as u64);
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                epoch: Instant::now(),
                period,
                ticks: AtomicU64::new(0),
            }),
        }
    }

    /// Add (or replace) the callback for `id`, starting the loop if it is idle.
    ///
    /// Replacing retires the older [`Registration`]: unregistering it later is a no-op.
    pub fn register<F>(&self, id: impl Into<String>, callback: F) -> Registration
    where
        F: FnMut(f64) + Send + 'static,
    {
        let id = id.into();
        let callback: Callback = Box::new(callback);
        let mut reg = self.shared.registry();
        reg.next_generation += 1;
        let generation = reg.next_generation;
        if reg
            .callbacks
            .insert(id.clone(), (generation, Arc::new(Mutex::new(callback))))
            .is_some()
        {
            warn!("render coordinator: callback '{id}' replaced");
        }
        if reg.loop_task.is_none() {
            debug!("render coordinator: starting loop at {:?}", self.shared.period);
            reg.loop_task = Some(spawn_loop(Arc::downgrade(&self.shared), self.shared.period));
        }
        Registration { id, generation, shared: Arc::clone(&self.shared) }
    }

    fn remove(shared: &Arc<Shared>, id: &str, generation: u64) {
        let mut reg = shared.registry();
        if !matches!(reg.callbacks.get(id), Some((g, _)) if *g == generation) {
            debug!("render coordinator: stale registration for '{id}' ignored");
            return;
        }
        reg.callbacks.remove(id);
        reg.throttle.forget(id);
        if reg.callbacks.is_empty() {
            if let Some(task) = reg.loop_task.take() {
                debug!("render coordinator: last consumer gone, stopping loop");
                task.abort();
            }
        }
    }

    /// Throttle helper shared by all callbacks; see [`Throttle::should_update`].
    pub fn should_update(&self, key: &str, timestamp_ms: f64, interval_ms: f64) -> bool {
        self.shared.registry().throttle.should_update(key, timestamp_ms, interval_ms)
    }

    pub fn is_running(&self) -> bool {
        self.shared.registry().loop_task.is_some()
    }

    pub fn len(&self) -> usize {
        self.shared.registry().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn period(&self) -> Duration {
        self.shared.period
    }

    pub fn tick_count(&self) -> u64 {
        self.shared.ticks.load(Ordering::Relaxed)
    }

    /// Milliseconds since this coordinator was created, same clock as the tick timestamps.
    pub fn now_ms(&self) -> f64 {
        self.shared.now_ms()
    }
}

fn spawn_loop(shared: std::sync::Weak<Shared>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(shared) = shared.upgrade() else { break };
            shared.tick();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_throttle() {
        let mut t = Throttle::new();
        assert!(t.should_update("label", 0.0, 100.0));
        assert!(!t.should_update("label", 50.0, 100.0));
        assert!(t.should_update("label", 100.0, 100.0));
        assert!(t.should_update("other", 101.0, 100.0));
        assert!(!t.should_update("label", 150.0, 100.0));
    }

    #[tokio::test]
    async fn test_loop_starts_and_stops_with_consumers() {
        let coord = RenderCoordinator::new(200);
        assert!(!coord.is_running());

        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let reg = coord.register("meter-a", move |_ts| {
            h.fetch_add(1, Ordering::Relaxed);
        });
        assert!(coord.is_running());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(hits.load(Ordering::Relaxed) > 0);

        reg.unregister();
        assert!(!coord.is_running());
        tokio::time::sleep(Duration::from_millis(10)).await;
        let settled = coord.tick_count();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(coord.tick_count(), settled);
    }

    #[tokio::test]
    async fn test_timestamps_increase() {
        let coord = RenderCoordinator::new(200);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let reg = coord.register("ts", move |ts| s.lock().unwrap().push(ts));
        tokio::time::sleep(Duration::from_millis(50)).await;
        reg.unregister();
        let seen = seen.lock().unwrap();
        assert!(seen.len() >= 2);
        assert!(seen.windows(2).all(|w| w[1] >= w[0]));
    }

    #[tokio::test]
    async fn test_callback_may_unregister_itself() {
        let coord = RenderCoordinator::new(200);
        let slot: Arc<Mutex<Option<Registration>>> = Arc::new(Mutex::new(None));
        let s = Arc::clone(&slot);
        let reg = coord.register("once", move |_| {
            if let Some(r) = s.lock().unwrap().take() {
                r.unregister();
            }
        });
        *slot.lock().unwrap() = Some(reg);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(coord.is_empty());
        assert!(!coord.is_running());
    }

    #[tokio::test]
    async fn test_replaced_registration_cannot_remove_successor() {
        let coord = RenderCoordinator::new(200);
        let hits = Arc::new(AtomicUsize::new(0));
        let old = coord.register("meter", |_| {});
        let h = Arc::clone(&hits);
        let new = coord.register("meter", move |_| {
            h.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(coord.len(), 1);

        old.unregister();
        assert_eq!(coord.len(), 1);
        assert!(coord.is_running());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(hits.load(Ordering::Relaxed) > 0);

        new.unregister();
        assert!(coord.is_empty());
        assert!(!coord.is_running());
    }
}
