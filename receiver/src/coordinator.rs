//! Process-wide dequeue scheduling for video streams.
//!
//! Rather than one timer per stream, every stream registers with a single
//! [`VideoDequeueCoordinator`] which sleeps until the earliest deadline and
//! services every stream due within a small batching tolerance in one pass.

use anyhow::Result;
use moq_playout_common::{MetricsHandle, Ticks};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// A stream that can be serviced by the coordinator.
pub trait DequeueSchedulable: Send + Sync {
    /// Unique key for this stream. Registering another handler with the same
    /// identifier replaces this one.
    fn dequeue_identifier(&self) -> &str;

    /// When the next frame is due, computed from `from`. `None` when nothing
    /// is pending.
    fn calculate_next_deadline(&self, from: Ticks) -> Option<Ticks>;

    /// Handles the frame due at `at`. Returns whether a frame was produced.
    /// Errors are local to this stream.
    fn process_frame(&self, at: Ticks) -> Result<bool>;
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Deadlines this close after a wake-up are serviced in the same pass.
    pub batch_tolerance: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            batch_tolerance: Duration::from_millis(1),
        }
    }
}

struct Registration {
    // ---
    handler: Arc<dyn DequeueSchedulable>,
    deadline: Option<Ticks>,
    generation: u64,
}

struct Shared {
    // ---
    config: CoordinatorConfig,
    registrations: Mutex<HashMap<String, Registration>>,
    generation: AtomicU64,
    wake: Notify,
    /// Held for a whole servicing pass so the timer task and manual
    /// [`VideoDequeueCoordinator::service`] calls never overlap.
    pass: Mutex<()>,
    metrics: Option<MetricsHandle>,
}

/// Deadline-driven scheduler shared by all video streams.
///
/// # Concurrency
///
/// Registration may happen from any thread, including from inside a
/// handler's own callback: handlers are always invoked without the
/// registration lock held. A handler unregistered (or replaced) while a pass
/// is in flight may finish its current call but is never rescheduled.
///
/// A handler whose next deadline is `None` stays registered but idle until
/// [`reschedule`](Self::reschedule) is called for it.
pub struct VideoDequeueCoordinator {
    // ---
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl VideoDequeueCoordinator {
    // ---
    /// Creates a coordinator with no timer running. Call
    /// [`start`](Self::start) from within a tokio runtime, or drive it by hand
    /// with [`service`](Self::service).
    pub fn new(config: CoordinatorConfig, metrics: Option<MetricsHandle>) -> Self {
        // ---
        Self {
            shared: Arc::new(Shared {
                config,
                registrations: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                wake: Notify::new(),
                pass: Mutex::new(()),
                metrics,
            }),
            task: Mutex::new(None),
        }
    }

    /// Creates and starts a coordinator on the current tokio runtime.
    pub fn spawn(config: CoordinatorConfig, metrics: Option<MetricsHandle>) -> Arc<Self> {
        // ---
        let coordinator = Arc::new(Self::new(config, metrics));
        coordinator.start();
        coordinator
    }

    /// Starts the timer task. Does nothing if already running.
    pub fn start(&self) {
        // ---
        let mut task = self.task.lock();
        if task.is_none() {
            let shared = Arc::clone(&self.shared);
            *task = Some(tokio::spawn(run(shared)));
            info!("dequeue coordinator started");
        }
    }

    /// Stops the timer task and drops every registration.
    pub fn shutdown(&self) {
        // ---
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        let dropped = {
            let mut registrations = self.shared.registrations.lock();
            let dropped = registrations.len();
            registrations.clear();
            dropped
        };
        info!("dequeue coordinator stopped ({dropped} streams dropped)");
    }

    /// Adds or replaces the handler for its identifier and schedules its
    /// first deadline, computed from now.
    pub fn register(&self, handler: Arc<dyn DequeueSchedulable>) {
        self.register_from(handler, Ticks::now());
    }

    /// As [`register`](Self::register), computing the first deadline from
    /// `from`.
    pub fn register_from(&self, handler: Arc<dyn DequeueSchedulable>, from: Ticks) {
        // ---
        let identifier = handler.dequeue_identifier().to_owned();
        let deadline = handler.calculate_next_deadline(from);
        let generation = self.shared.generation.fetch_add(1, Ordering::Relaxed);

        let (replaced, count) = {
            let mut registrations = self.shared.registrations.lock();
            let replaced = registrations
                .insert(
                    identifier.clone(),
                    Registration {
                        handler,
                        deadline,
                        generation,
                    },
                )
                .is_some();
            (replaced, registrations.len())
        };

        debug!("registered {identifier} (replaced={replaced}, deadline={deadline:?})");
        self.shared.report_scheduled(count, from);
        self.shared.wake.notify_one();
    }

    /// Removes a handler. Returns whether it was registered.
    pub fn unregister(&self, identifier: &str) -> bool {
        // ---
        let (removed, count) = {
            let mut registrations = self.shared.registrations.lock();
            let removed = registrations.remove(identifier).is_some();
            (removed, registrations.len())
        };
        if removed {
            debug!("unregistered {identifier}");
            self.shared.report_scheduled(count, Ticks::now());
            self.shared.wake.notify_one();
        }
        removed
    }

    /// Recomputes the deadline of an already registered handler, e.g. after
    /// new media arrived for an idle stream. Returns whether it was found.
    pub fn reschedule(&self, identifier: &str, from: Ticks) -> bool {
        // ---
        let Some((handler, generation)) = self
            .shared
            .registrations
            .lock()
            .get(identifier)
            .map(|r| (Arc::clone(&r.handler), r.generation))
        else {
            return false;
        };

        let deadline = handler.calculate_next_deadline(from);
        if self.shared.store_deadline(identifier, generation, deadline) {
            self.shared.wake.notify_one();
        }
        true
    }

    pub fn is_registered(&self, identifier: &str) -> bool {
        self.shared.registrations.lock().contains_key(identifier)
    }

    pub fn len(&self) -> usize {
        self.shared.registrations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest deadline across all handlers.
    pub fn next_wakeup(&self) -> Option<Ticks> {
        self.shared.next_wakeup()
    }

    /// Services every handler due at or before `now` plus the batching
    /// tolerance. Returns the number of handlers processed, failures
    /// included.
    ///
    /// Passes are serialized with the timer task, so mixing manual calls
    /// with [`start`](Self::start) never services a deadline twice. Must not
    /// be called from inside a handler's `process_frame`.
    pub fn service(&self, now: Ticks) -> usize {
        self.shared.service(now)
    }
}

impl Drop for VideoDequeueCoordinator {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

impl Shared {
    // ---
    fn next_wakeup(&self) -> Option<Ticks> {
        self.registrations
            .lock()
            .values()
            .filter_map(|r| r.deadline)
            .min()
    }

    fn service(&self, now: Ticks) -> usize {
        // ---
        let _pass = self.pass.lock();
        let horizon = now + self.config.batch_tolerance;
        let mut due: Vec<(String, u64, Ticks, Arc<dyn DequeueSchedulable>)> = self
            .registrations
            .lock()
            .iter()
            .filter_map(|(identifier, r)| match r.deadline {
                Some(deadline) if deadline <= horizon => Some((
                    identifier.clone(),
                    r.generation,
                    deadline,
                    Arc::clone(&r.handler),
                )),
                _ => None,
            })
            .collect();
        due.sort_by_key(|(_, _, deadline, _)| *deadline);

        let mut processed = 0;
        for (identifier, generation, deadline, handler) in due {
            if !self.is_current(&identifier, generation) {
                trace!("{identifier} unregistered mid-pass, skipping");
                continue;
            }

            match handler.process_frame(deadline) {
                Ok(produced) => trace!("{identifier} processed (produced={produced})"),
                Err(e) => {
                    warn!("{identifier}: process_frame failed: {e:#}");
                    if let Some(metrics) = &self.metrics {
                        metrics.counter("process_failures", 1, now);
                    }
                }
            }
            processed += 1;

            let next = handler.calculate_next_deadline(now);
            self.store_deadline(&identifier, generation, next);
        }
        processed
    }

    fn is_current(&self, identifier: &str, generation: u64) -> bool {
        self.registrations
            .lock()
            .get(identifier)
            .is_some_and(|r| r.generation == generation)
    }

    /// Stores `deadline` only if the registration has not been replaced or
    /// removed since `generation` was read.
    fn store_deadline(&self, identifier: &str, generation: u64, deadline: Option<Ticks>) -> bool {
        // ---
        match self.registrations.lock().get_mut(identifier) {
            Some(r) if r.generation == generation => {
                r.deadline = deadline;
                true
            }
            _ => false,
        }
    }

    fn report_scheduled(&self, count: usize, at: Ticks) {
        if let Some(metrics) = &self.metrics {
            metrics.gauge("scheduled_streams", count as f64, at);
        }
    }
}

async fn run(shared: Arc<Shared>) {
    // ---
    loop {
        match shared.next_wakeup() {
            Some(deadline) => {
                let at = tokio::time::Instant::from_std(deadline.to_instant());
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => {
                        shared.service(Ticks::now());
                    }
                    _ = shared.wake.notified() => {}
                }
            }
            None => shared.wake.notified().await,
        }
    }
}
