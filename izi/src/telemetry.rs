//! In-process pub/sub for lifecycle events.
//!
//! Subscribers attach to a single event name or to everything; handlers run
//! synchronously on the emitting task, so they must stay cheap and
//! non-blocking. A panicking handler is swallowed and never reaches the
//! emitter.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::job::Job;

/// Every event the system emits.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Event {
    JobStart,
    JobComplete,
    JobError,
    JobCancel,
    JobSnooze,
    JobRescue,
    JobUniqueConflict,
    JobIsolatedStart,
    JobIsolatedTimeout,
    QueueStart,
    QueueStop,
    QueuePause,
    QueueResume,
    ThreadSpawn,
    ThreadExit,
    PluginStart,
    PluginStop,
    PluginError,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::JobStart => "job:start",
            Event::JobComplete => "job:complete",
            Event::JobError => "job:error",
            Event::JobCancel => "job:cancel",
            Event::JobSnooze => "job:snooze",
            Event::JobRescue => "job:rescue",
            Event::JobUniqueConflict => "job:unique_conflict",
            Event::JobIsolatedStart => "job:isolated:start",
            Event::JobIsolatedTimeout => "job:isolated:timeout",
            Event::QueueStart => "queue:start",
            Event::QueueStop => "queue:stop",
            Event::QueuePause => "queue:pause",
            Event::QueueResume => "queue:resume",
            Event::ThreadSpawn => "thread:spawn",
            Event::ThreadExit => "thread:exit",
            Event::PluginStart => "plugin:start",
            Event::PluginStop => "plugin:stop",
            Event::PluginError => "plugin:error",
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What subscribers receive. `event` and `timestamp` are always present;
/// the rest is filled in when relevant.
#[derive(Debug, Clone)]
pub struct EventPayload {
    pub event: Event,
    pub timestamp: DateTime<Utc>,
    pub job: Option<Job>,
    pub queue: Option<String>,
    pub worker: Option<String>,
    pub plugin: Option<&'static str>,
    pub duration: Option<Duration>,
    pub error: Option<String>,
    pub result: Option<Value>,
    pub count: Option<u64>,
}

impl EventPayload {
    pub(crate) fn new(event: Event) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
            job: None,
            queue: None,
            worker: None,
            plugin: None,
            duration: None,
            error: None,
            result: None,
            count: None,
        }
    }

    pub(crate) fn with_job(mut self, job: &Job) -> Self {
        self.queue = Some(job.queue.clone());
        self.worker = Some(job.worker.clone());
        self.job = Some(job.clone());
        self
    }

    pub(crate) fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub(crate) fn with_plugin(mut self, plugin: &'static str) -> Self {
        self.plugin = Some(plugin);
        self
    }

    pub(crate) fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub(crate) fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub(crate) fn with_result(mut self, result: Option<Value>) -> Self {
        self.result = result;
        self
    }

    pub(crate) fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }
}

type Handler = Arc<dyn Fn(&EventPayload) + Send + Sync>;

struct Entry {
    id: u64,
    once: bool,
    handler: Handler,
}

#[derive(Default)]
struct Table {
    next_id: u64,
    named: HashMap<Event, Vec<Entry>>,
    wildcard: Vec<Entry>,
}

/// The bus itself; clones share subscribers.
#[derive(Clone, Default)]
pub struct TelemetryBus {
    table: Arc<Mutex<Table>>,
}

/// Key for one subscription, used to unsubscribe.
#[derive(Debug)]
pub struct Subscription {
    bus: TelemetryBus,
    event: Option<Event>,
    id: u64,
}

impl Subscription {
    /// Removes the handler. Dropping a `Subscription` without calling this
    /// leaves the handler attached.
    pub fn cancel(self) {
        self.bus.remove(self.event, self.id);
    }
}

impl std::fmt::Debug for TelemetryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TelemetryBus")
    }
}

impl TelemetryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, event: Event, handler: F) -> Subscription
    where
        F: Fn(&EventPayload) + Send + Sync + 'static,
    {
        self.insert(Some(event), false, Arc::new(handler))
    }

    /// Subscribes to every event.
    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&EventPayload) + Send + Sync + 'static,
    {
        self.insert(None, false, Arc::new(handler))
    }

    /// Like [`TelemetryBus::subscribe`] but detaches after the first
    /// delivery.
    pub fn subscribe_once<F>(&self, event: Event, handler: F) -> Subscription
    where
        F: Fn(&EventPayload) + Send + Sync + 'static,
    {
        self.insert(Some(event), true, Arc::new(handler))
    }

    pub fn emit(&self, payload: EventPayload) {
        let event = payload.event;
        let handlers: Vec<Handler> = {
            let mut table = self.lock();
            let mut handlers = Vec::new();
            if let Some(entries) = table.named.get_mut(&event) {
                handlers.extend(entries.iter().map(|entry| entry.handler.clone()));
                entries.retain(|entry| !entry.once);
            }
            handlers.extend(table.wildcard.iter().map(|entry| entry.handler.clone()));
            table.wildcard.retain(|entry| !entry.once);
            handlers
        };

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&payload))).is_err() {
                tracing::warn!(event = %event, "telemetry handler panicked");
            }
        }
    }

    fn insert(&self, event: Option<Event>, once: bool, handler: Handler) -> Subscription {
        let mut table = self.lock();
        table.next_id += 1;
        let id = table.next_id;
        let entry = Entry { id, once, handler };
        match event {
            Some(event) => table.named.entry(event).or_default().push(entry),
            None => table.wildcard.push(entry),
        }
        Subscription {
            bus: self.clone(),
            event,
            id,
        }
    }

    fn remove(&self, event: Option<Event>, id: u64) {
        let mut table = self.lock();
        match event {
            Some(event) => {
                if let Some(entries) = table.named.get_mut(&event) {
                    entries.retain(|entry| entry.id != id);
                }
            }
            None => table.wildcard.retain(|entry| entry.id != id),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&EventPayload) + Send + Sync) {
        let count = Arc::new(AtomicUsize::new(0));
        let clone = count.clone();
        (count, move |_: &EventPayload| {
            clone.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn named_subscription_only_sees_its_event() {
        let bus = TelemetryBus::new();
        let (count, handler) = counter();
        bus.subscribe(Event::JobComplete, handler);

        bus.emit(EventPayload::new(Event::JobComplete));
        bus.emit(EventPayload::new(Event::JobStart));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wildcard_sees_everything() {
        let bus = TelemetryBus::new();
        let (count, handler) = counter();
        bus.subscribe_all(handler);

        bus.emit(EventPayload::new(Event::JobComplete));
        bus.emit(EventPayload::new(Event::QueuePause));
        bus.emit(EventPayload::new(Event::PluginError));

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn once_detaches_after_first_delivery() {
        let bus = TelemetryBus::new();
        let (count, handler) = counter();
        bus.subscribe_once(Event::JobComplete, handler);

        bus.emit(EventPayload::new(Event::JobComplete));
        bus.emit(EventPayload::new(Event::JobComplete));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_unsubscribes() {
        let bus = TelemetryBus::new();
        let (count, handler) = counter();
        let subscription = bus.subscribe(Event::JobComplete, handler);

        bus.emit(EventPayload::new(Event::JobComplete));
        subscription.cancel();
        bus.emit(EventPayload::new(Event::JobComplete));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_handler_does_not_reach_the_emitter() {
        let bus = TelemetryBus::new();
        let (count, handler) = counter();
        bus.subscribe(Event::JobComplete, |_| panic!("bad handler"));
        bus.subscribe(Event::JobComplete, handler);

        bus.emit(EventPayload::new(Event::JobComplete));

        // the healthy subscriber still got its delivery
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delivery_order_matches_emission_order() {
        let bus = TelemetryBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let clone = seen.clone();
        bus.subscribe_all(move |payload| clone.lock().unwrap().push(payload.event));

        bus.emit(EventPayload::new(Event::JobStart));
        bus.emit(EventPayload::new(Event::JobError));
        bus.emit(EventPayload::new(Event::JobComplete));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Event::JobStart, Event::JobError, Event::JobComplete]
        );
    }

    #[test]
    fn payload_carries_job_context() {
        let job = Job::mock("mailer");
        let payload = EventPayload::new(Event::JobStart).with_job(&job);

        assert_eq!(payload.queue.as_deref(), Some("default"));
        assert_eq!(payload.worker.as_deref(), Some("mailer"));
        assert!(payload.timestamp <= Utc::now());
    }
}
