//! Typed publish/subscribe event bus.
//!
//! Events are plain types implementing [`Event`], registered on the bus and
//! delivered to subscribers either synchronously in the publisher's call or
//! asynchronously through a bounded queue serviced by a worker pool.
//! Handlers are isolated: an error or panic in one subscriber is counted,
//! reported and logged, and never stops the fan-out or the publisher.
//!
//! Ordering: synchronous publishes observe program order trivially. With one
//! worker, asynchronous delivery is FIFO (or priority-then-FIFO); with
//! several workers, events are dequeued FIFO but handlers for one event type
//! may be observed out of order across workers. Subscribers that need strict
//! ordering belong on a single-worker bus.

pub mod queue;

pub use self::queue::BackpressurePolicy;

use std::any::{Any, TypeId};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use ahash::AHashMap as HashMap;
use log::{debug, warn};

use self::queue::{build_queue, Pop, QueueConsumer, QueueProducer, QueuedEvent, StopToken};
use crate::{
    error::{BoxedErr, EventError},
    storage::ComponentTypeId,
    world::Entity,
};

/// Delivery priority of an event; higher drains first on a priority bus.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    /// Background-grade traffic.
    Low,
    /// The default.
    #[default]
    Normal,
    /// Ahead of normal traffic.
    High,
    /// Drains before everything else.
    Critical,
}

/// A typed event payload.
///
/// Events carry their subject entity (if any) and a delivery priority;
/// everything else is up to the concrete type. `as_any` is the one line of
/// boilerplate each event type writes (`fn as_any(&self) -> &dyn Any
/// { self }`); it gives the bus the concrete type identity a bare trait
/// object cannot report.
pub trait Event: Any + Send + Sync {
    /// Returns `self` as `&dyn Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// The entity this event is about, if any.
    fn entity(&self) -> Option<Entity> {
        None
    }

    /// Delivery priority; only consulted by priority-queue buses.
    fn priority(&self) -> EventPriority {
        EventPriority::Normal
    }
}

impl dyn Event {
    /// Downcasts a borrowed event to a concrete type.
    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        self.as_any().downcast_ref::<E>()
    }
}

/// Stable small-integer id of a registered event type.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventTypeId(pub u32);

/// Unique id of one subscription; never reused over the bus's lifetime.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Result type for event handlers.
pub type HandlerResult = Result<(), BoxedErr>;

type DynHandler = Box<dyn Fn(&dyn Event) -> HandlerResult + Send + Sync>;
type DynFilter = Box<dyn Fn(&dyn Event) -> bool + Send + Sync>;

/// Sink for handler failures; installed via [`EventBus::set_error_sink`].
pub type HandlerErrorSink =
    Arc<dyn Fn(EventTypeId, SubscriptionId, &BoxedErr) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    event_type: EventTypeId,
    handler: DynHandler,
    filter: Option<DynFilter>,
    created_at: Instant,
    active: AtomicBool,
}

/// Bus configuration, consumed by [`EventBus::new`].
#[derive(Clone, Debug)]
pub struct EventBusConfig {
    /// Async queue capacity.
    pub buffer_size: usize,
    /// Worker threads draining the async queue.
    pub num_workers: usize,
    /// Use a priority queue instead of plain FIFO.
    pub enable_priority: bool,
    /// Full-queue behavior for async publishes.
    pub backpressure: BackpressurePolicy,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        EventBusConfig {
            buffer_size: 1024,
            num_workers: 2,
            enable_priority: false,
            backpressure: BackpressurePolicy::DropNewest,
        }
    }
}

/// Counter snapshot returned by [`EventBus::get_stats`].
#[derive(Clone, Debug, Default)]
pub struct EventBusStats {
    /// Events accepted for delivery (sync publishes + successful enqueues).
    pub published: u64,
    /// Successful handler invocations.
    pub processed: u64,
    /// Async events rejected by a full queue.
    pub dropped: u64,
    /// Handler invocations that returned an error.
    pub handler_errors: u64,
    /// Handler invocations that panicked.
    pub handler_panics: u64,
    /// Live subscriptions.
    pub subscriptions: usize,
    /// Events currently queued.
    pub queue_depth: usize,
    /// Configured worker count.
    pub workers: usize,
    /// Exponentially-weighted average fan-out latency in seconds.
    pub avg_latency: f64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    handler_errors: AtomicU64,
    handler_panics: AtomicU64,
}

const LATENCY_ALPHA: f64 = 0.1;

struct BusInner {
    registered: RwLock<HashMap<TypeId, EventTypeId>>,
    type_names: RwLock<Vec<&'static str>>,
    by_id: RwLock<HashMap<SubscriptionId, Arc<Subscription>>>,
    by_type: RwLock<HashMap<EventTypeId, Vec<Arc<Subscription>>>>,
    producer: RwLock<Option<QueueProducer>>,
    running: AtomicBool,
    next_sub_id: AtomicU64,
    next_seq: AtomicU64,
    counters: Counters,
    avg_latency: Mutex<f64>,
    error_sink: RwLock<Option<HandlerErrorSink>>,
}

impl BusInner {
    fn deliver(&self, type_id: EventTypeId, event: &dyn Event) {
        // Snapshot the fan-out list, then release the lock before running
        // handlers so they can subscribe/unsubscribe freely.
        let targets: Vec<Arc<Subscription>> = {
            let by_type = self.by_type.read().expect("subscription map poisoned");
            match by_type.get(&type_id) {
                Some(list) => list.clone(),
                None => return,
            }
        };

        for sub in targets {
            if !sub.active.load(Ordering::Acquire) {
                continue;
            }
            if let Some(ref filter) = sub.filter {
                if !filter(event) {
                    continue;
                }
            }
            match catch_unwind(AssertUnwindSafe(|| (sub.handler)(event))) {
                Ok(Ok(())) => {
                    self.counters.processed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(err)) => {
                    self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "event handler {} failed for event type {:?}: {}",
                        sub.id.0, type_id, err
                    );
                    if let Some(sink) = self
                        .error_sink
                        .read()
                        .expect("error sink poisoned")
                        .clone()
                    {
                        sink(type_id, sub.id, &err);
                    }
                }
                Err(_) => {
                    self.counters.handler_panics.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "event handler {} panicked for event type {:?}",
                        sub.id.0, type_id
                    );
                }
            }
        }
    }

    fn record_latency(&self, started: Instant) {
        let sample = started.elapsed().as_secs_f64();
        let mut avg = self.avg_latency.lock().expect("latency gauge poisoned");
        *avg = if *avg == 0.0 {
            sample
        } else {
            *avg * (1.0 - LATENCY_ALPHA) + sample * LATENCY_ALPHA
        };
    }
}

/// The event bus. Cheap to share: wrap it in an `Arc` and clone handles.
pub struct EventBus {
    inner: Arc<BusInner>,
    config: EventBusConfig,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
    stop: Mutex<Option<StopToken>>,
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(EventBusConfig::default())
    }
}

impl EventBus {
    /// Creates a bus with the given configuration. The bus starts stopped.
    pub fn new(config: EventBusConfig) -> Self {
        EventBus {
            inner: Arc::new(BusInner {
                registered: RwLock::new(HashMap::new()),
                type_names: RwLock::new(Vec::new()),
                by_id: RwLock::new(HashMap::new()),
                by_type: RwLock::new(HashMap::new()),
                producer: RwLock::new(None),
                running: AtomicBool::new(false),
                next_sub_id: AtomicU64::new(1),
                next_seq: AtomicU64::new(0),
                counters: Counters::default(),
                avg_latency: Mutex::new(0.0),
                error_sink: RwLock::new(None),
            }),
            config,
            workers: Mutex::new(Vec::new()),
            stop: Mutex::new(None),
        }
    }

    /// Installs the sink notified of handler errors (in addition to the
    /// counters and the log).
    pub fn set_error_sink(&self, sink: HandlerErrorSink) {
        *self.inner.error_sink.write().expect("error sink poisoned") = Some(sink);
    }

    /// Creates the queue and spawns the worker pool. Idempotent.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(
            "event bus starting: {} workers, buffer {}, priority {}",
            self.config.num_workers, self.config.buffer_size, self.config.enable_priority
        );

        let (producer, consumer, stop) =
            build_queue(self.config.buffer_size, self.config.enable_priority);
        *self.inner.producer.write().expect("queue producer poisoned") = Some(producer);
        *self.stop.lock().expect("stop token poisoned") = Some(stop);

        let mut workers = self.workers.lock().expect("worker pool poisoned");
        for n in 0..self.config.num_workers.max(1) {
            let inner = self.inner.clone();
            let consumer = consumer.clone();
            let handle = std::thread::Builder::new()
                .name(format!("hearth-event-{}", n))
                .spawn(move || worker_loop(inner, consumer))
                .expect("failed to spawn event worker");
            workers.push(handle);
        }
    }

    /// Signals the stop token, lets workers drain the queue best-effort,
    /// joins them, and flips the running flag. Idempotent. In-flight
    /// handlers complete; nothing is force-terminated.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!("event bus stopping");

        // Dropping the producer side closes the FIFO to publishers.
        *self.inner.producer.write().expect("queue producer poisoned") = None;
        if let Some(stop) = self.stop.lock().expect("stop token poisoned").take() {
            stop.fire();
        }
        let mut workers = self.workers.lock().expect("worker pool poisoned");
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    /// Whether the bus is currently running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Registers `E`, assigning it a stable [`EventTypeId`]. Idempotent.
    pub fn register_event_type<E: Event>(&self) -> EventTypeId {
        let mut registered = self
            .inner
            .registered
            .write()
            .expect("event registry poisoned");
        if let Some(&id) = registered.get(&TypeId::of::<E>()) {
            return id;
        }
        let mut names = self.inner.type_names.write().expect("event registry poisoned");
        let id = EventTypeId(names.len() as u32);
        names.push(std::any::type_name::<E>());
        registered.insert(TypeId::of::<E>(), id);
        id
    }

    /// The recorded name of a registered event type.
    pub fn event_type_name(&self, id: EventTypeId) -> Option<&'static str> {
        self.inner
            .type_names
            .read()
            .expect("event registry poisoned")
            .get(id.0 as usize)
            .copied()
    }

    fn type_id_of<E: Event>(&self) -> Result<EventTypeId, EventError> {
        self.inner
            .registered
            .read()
            .expect("event registry poisoned")
            .get(&TypeId::of::<E>())
            .copied()
            .ok_or_else(|| EventError::InvalidEventType(std::any::type_name::<E>()))
    }

    /// Subscribes `handler` to events of type `E`.
    pub fn subscribe<E, F>(&self, handler: F) -> Result<SubscriptionId, EventError>
    where
        E: Event,
        F: Fn(&E) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscribe_inner::<E>(Box::new(move |ev| {
            let ev = ev.downcast_ref::<E>().expect("event type confusion");
            handler(ev)
        }), None)
    }

    /// Subscribes `handler` to events of type `E` that pass `filter`.
    pub fn subscribe_with_filter<E, P, F>(
        &self,
        filter: P,
        handler: F,
    ) -> Result<SubscriptionId, EventError>
    where
        E: Event,
        P: Fn(&E) -> bool + Send + Sync + 'static,
        F: Fn(&E) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscribe_inner::<E>(
            Box::new(move |ev| {
                let ev = ev.downcast_ref::<E>().expect("event type confusion");
                handler(ev)
            }),
            Some(Box::new(move |ev| {
                let ev = ev.downcast_ref::<E>().expect("event type confusion");
                filter(ev)
            })),
        )
    }

    fn subscribe_inner<E: Event>(
        &self,
        handler: DynHandler,
        filter: Option<DynFilter>,
    ) -> Result<SubscriptionId, EventError> {
        if !self.is_running() {
            return Err(EventError::EventBusNotStarted);
        }
        let event_type = self.register_event_type::<E>();
        let id = SubscriptionId(self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed));
        let sub = Arc::new(Subscription {
            id,
            event_type,
            handler,
            filter,
            created_at: Instant::now(),
            active: AtomicBool::new(true),
        });

        self.inner
            .by_id
            .write()
            .expect("subscription map poisoned")
            .insert(id, sub.clone());
        self.inner
            .by_type
            .write()
            .expect("subscription map poisoned")
            .entry(event_type)
            .or_default()
            .push(sub);
        Ok(id)
    }

    /// Removes a subscription from both indexes.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), EventError> {
        let sub = self
            .inner
            .by_id
            .write()
            .expect("subscription map poisoned")
            .remove(&id)
            .ok_or(EventError::SubscriptionNotFound(id.0))?;
        sub.active.store(false, Ordering::Release);

        let mut by_type = self.inner.by_type.write().expect("subscription map poisoned");
        if let Some(list) = by_type.get_mut(&sub.event_type) {
            list.retain(|s| s.id != id);
            if list.is_empty() {
                by_type.remove(&sub.event_type);
            }
        }
        Ok(())
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner
            .by_id
            .read()
            .expect("subscription map poisoned")
            .len()
    }

    /// Age of a subscription, mostly for diagnostics.
    pub fn subscription_age(&self, id: SubscriptionId) -> Option<std::time::Duration> {
        self.inner
            .by_id
            .read()
            .expect("subscription map poisoned")
            .get(&id)
            .map(|s| s.created_at.elapsed())
    }

    /// Publishes synchronously: every matching subscriber's handler runs in
    /// the caller before this returns. Handler failures are isolated.
    pub fn publish<E: Event>(&self, event: E) -> Result<(), EventError> {
        if !self.is_running() {
            return Err(EventError::EventBusNotStarted);
        }
        self.type_id_of::<E>()?;
        self.publish_erased(Some(Arc::new(event)))
    }

    /// Type-erased synchronous publish. `None` is rejected as `EventNil`.
    pub fn publish_erased(&self, event: Option<Arc<dyn Event>>) -> Result<(), EventError> {
        let event = event.ok_or(EventError::EventNil)?;
        if !self.is_running() {
            return Err(EventError::EventBusNotStarted);
        }
        let type_id = self.erased_type_id(&event)?;

        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        self.inner.deliver(type_id, event.as_ref());
        self.inner.record_latency(started);
        Ok(())
    }

    /// Publishes asynchronously through the bounded queue. Under the default
    /// drop policy a full queue rejects with `QueueFull`.
    pub fn publish_async<E: Event>(&self, event: E) -> Result<(), EventError> {
        if !self.is_running() {
            return Err(EventError::EventBusNotStarted);
        }
        self.type_id_of::<E>()?;
        self.publish_async_erased(Some(Arc::new(event)))
    }

    /// Type-erased asynchronous publish.
    pub fn publish_async_erased(
        &self,
        event: Option<Arc<dyn Event>>,
    ) -> Result<(), EventError> {
        let event = event.ok_or(EventError::EventNil)?;
        if !self.is_running() {
            return Err(EventError::EventBusNotStarted);
        }
        let type_id = self.erased_type_id(&event)?;

        let producer = self.inner.producer.read().expect("queue producer poisoned");
        let producer = producer.as_ref().ok_or(EventError::EventBusNotStarted)?;
        let item = QueuedEvent {
            priority: event.priority(),
            event,
            type_id,
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            enqueued: Instant::now(),
        };
        match producer.push(item, self.config.backpressure) {
            Ok(()) => {
                self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(EventError::QueueFull) => {
                self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
                Err(EventError::QueueFull)
            }
            Err(other) => Err(other),
        }
    }

    fn erased_type_id(&self, event: &Arc<dyn Event>) -> Result<EventTypeId, EventError> {
        let rust_id = event.as_any().type_id();
        self.inner
            .registered
            .read()
            .expect("event registry poisoned")
            .get(&rust_id)
            .copied()
            .ok_or(EventError::InvalidEventType("<unregistered event type>"))
    }

    /// Counter snapshot.
    pub fn get_stats(&self) -> EventBusStats {
        let queue_depth = self
            .inner
            .producer
            .read()
            .expect("queue producer poisoned")
            .as_ref()
            .map(|p| p.len())
            .unwrap_or(0);
        EventBusStats {
            published: self.inner.counters.published.load(Ordering::Relaxed),
            processed: self.inner.counters.processed.load(Ordering::Relaxed),
            dropped: self.inner.counters.dropped.load(Ordering::Relaxed),
            handler_errors: self.inner.counters.handler_errors.load(Ordering::Relaxed),
            handler_panics: self.inner.counters.handler_panics.load(Ordering::Relaxed),
            subscriptions: self.subscription_count(),
            queue_depth,
            workers: self.config.num_workers.max(1),
            avg_latency: *self.inner.avg_latency.lock().expect("latency gauge poisoned"),
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(inner: Arc<BusInner>, consumer: QueueConsumer) {
    loop {
        match consumer.pop() {
            Pop::Event(item) => {
                inner.deliver(item.type_id, item.event.as_ref());
                inner.record_latency(item.enqueued);
            }
            Pop::Stopped => {
                // Drain what is already queued, best-effort, then exit.
                while let Some(item) = consumer.try_pop() {
                    inner.deliver(item.type_id, item.event.as_ref());
                    inner.record_latency(item.enqueued);
                }
                return;
            }
        }
    }
}

/// Lifecycle notification: an entity was created.
#[derive(Clone, Copy, Debug)]
pub struct EntityCreated {
    /// The new entity.
    pub entity: Entity,
}

impl Event for EntityCreated {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn entity(&self) -> Option<Entity> {
        Some(self.entity)
    }
}

/// Lifecycle notification: an entity was destroyed and its components
/// removed.
#[derive(Clone, Copy, Debug)]
pub struct EntityDestroyed {
    /// The destroyed entity (its id is now stale).
    pub entity: Entity,
}

impl Event for EntityDestroyed {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn entity(&self) -> Option<Entity> {
        Some(self.entity)
    }
}

/// Lifecycle notification: a component was attached to an entity.
#[derive(Clone, Copy, Debug)]
pub struct ComponentAdded {
    /// The entity gaining the component.
    pub entity: Entity,
    /// Registry id of the component's type.
    pub component: ComponentTypeId,
}

impl Event for ComponentAdded {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn entity(&self) -> Option<Entity> {
        Some(self.entity)
    }
}

/// Lifecycle notification: a component was removed from an entity.
#[derive(Clone, Copy, Debug)]
pub struct ComponentRemoved {
    /// The entity losing the component.
    pub entity: Entity,
    /// Registry id of the component's type.
    pub component: ComponentTypeId,
}

impl Event for ComponentRemoved {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn entity(&self) -> Option<Entity> {
        Some(self.entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug)]
    struct Damage {
        entity: Entity,
        amount: i32,
    }
    impl Event for Damage {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn entity(&self) -> Option<Entity> {
            Some(self.entity)
        }
    }

    fn ent(i: u32) -> Entity {
        Entity::from_raw_parts(i, crate::world::Generation::new(1))
    }

    fn bus(config: EventBusConfig) -> EventBus {
        let bus = EventBus::new(config);
        bus.start();
        bus.register_event_type::<Damage>();
        bus
    }

    #[test]
    fn sync_publish_reaches_all_subscribers() {
        let bus = bus(Default::default());
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            bus.subscribe::<Damage, _>(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }

        bus.publish(Damage {
            entity: ent(1),
            amount: 5,
        })
        .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);

        let stats = bus.get_stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.processed, 3);
    }

    #[test]
    fn filter_gates_delivery() {
        let bus = bus(Default::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe_with_filter::<Damage, _, _>(
            |ev| ev.entity == ent(42),
            move |ev| {
                sink.lock().unwrap().push(ev.entity);
                Ok(())
            },
        )
        .unwrap();

        for id in [42, 10, 42] {
            bus.publish(Damage {
                entity: ent(id),
                amount: 1,
            })
            .unwrap();
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|&e| e == ent(42)));
    }

    #[test]
    fn handler_errors_are_isolated_and_counted() {
        let bus = bus(Default::default());
        let reached = Arc::new(AtomicUsize::new(0));
        bus.subscribe::<Damage, _>(|_| Err(BoxedErr::msg("boom"))).unwrap();
        let r = reached.clone();
        bus.subscribe::<Damage, _>(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        bus.publish(Damage {
            entity: ent(1),
            amount: 1,
        })
        .unwrap();

        assert_eq!(reached.load(Ordering::SeqCst), 1);
        let stats = bus.get_stats();
        assert_eq!(stats.handler_errors, 1);
        assert_eq!(stats.processed, 1);
    }

    #[test]
    fn handler_panic_is_caught() {
        let bus = bus(Default::default());
        bus.subscribe::<Damage, _>(|_| panic!("handler bug")).unwrap();

        bus.publish(Damage {
            entity: ent(1),
            amount: 1,
        })
        .unwrap();
        assert_eq!(bus.get_stats().handler_panics, 1);
    }

    #[test]
    fn unregistered_type_and_stopped_bus_are_rejected() {
        let bus = EventBus::new(Default::default());
        assert!(matches!(
            bus.publish(Damage {
                entity: ent(1),
                amount: 1
            }),
            Err(EventError::EventBusNotStarted)
        ));

        bus.start();
        assert!(matches!(
            bus.publish(Damage {
                entity: ent(1),
                amount: 1
            }),
            Err(EventError::InvalidEventType(_))
        ));
        assert!(matches!(
            bus.publish_erased(None),
            Err(EventError::EventNil)
        ));
    }

    #[test]
    fn unsubscribe_restores_counts() {
        let bus = bus(Default::default());
        let id = bus.subscribe::<Damage, _>(|_| Ok(())).unwrap();
        assert_eq!(bus.subscription_count(), 1);
        bus.unsubscribe(id).unwrap();
        assert_eq!(bus.subscription_count(), 0);
        assert!(matches!(
            bus.unsubscribe(id),
            Err(EventError::SubscriptionNotFound(_))
        ));
    }

    #[test]
    fn async_drop_policy_accounts_exactly() {
        let bus = bus(EventBusConfig {
            buffer_size: 2,
            num_workers: 1,
            ..Default::default()
        });
        bus.subscribe::<Damage, _>(|_| {
            std::thread::sleep(Duration::from_millis(100));
            Ok(())
        })
        .unwrap();

        let mut accepted = 0;
        let mut dropped = 0;
        for i in 0..10 {
            match bus.publish_async(Damage {
                entity: ent(i),
                amount: 1,
            }) {
                Ok(()) => accepted += 1,
                Err(EventError::QueueFull) => dropped += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(accepted + dropped, 10);
        // The first events fit (queue capacity plus possibly one in-flight).
        assert!((2..=3).contains(&accepted), "accepted = {}", accepted);

        let stats = bus.get_stats();
        assert_eq!(stats.published, accepted as u64);
        assert_eq!(stats.dropped, dropped as u64);

        bus.stop();
        // Queued events were drained before the workers exited.
        assert_eq!(bus.get_stats().processed, accepted as u64);
    }

    #[test]
    fn start_stop_start_is_idempotent() {
        let bus = bus(Default::default());
        bus.start();
        bus.stop();
        bus.stop();
        bus.start();
        assert!(bus.is_running());

        bus.publish(Damage {
            entity: ent(1),
            amount: 1,
        })
        .unwrap();
        bus.stop();
        assert!(!bus.is_running());
    }

    #[test]
    fn single_worker_preserves_fifo() {
        let bus = bus(EventBusConfig {
            buffer_size: 64,
            num_workers: 1,
            ..Default::default()
        });
        let order = Arc::new(Mutex::new(Vec::new()));
        let sink = order.clone();
        bus.subscribe::<Damage, _>(move |ev| {
            sink.lock().unwrap().push(ev.amount);
            Ok(())
        })
        .unwrap();

        for i in 0..20 {
            bus.publish_async(Damage {
                entity: ent(0),
                amount: i,
            })
            .unwrap();
        }
        bus.stop();

        let order = order.lock().unwrap();
        assert_eq!(*order, (0..20).collect::<Vec<_>>());
    }
}
