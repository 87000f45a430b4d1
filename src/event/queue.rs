//! Bounded event queue backing asynchronous publishing.
//!
//! Two shapes behind one interface: a plain FIFO riding a bounded
//! crossbeam channel, and a priority queue (priority descending, FIFO
//! within a priority) under a mutex/condvar pair. Workers block on `pop`
//! until an event or the stop token arrives; after stop they drain
//! whatever is still queued, best-effort.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender};

use super::{Event, EventPriority, EventTypeId};
use crate::error::EventError;

/// What to do when an async publish finds the queue full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Reject the event with `QueueFull` and count it as dropped.
    #[default]
    DropNewest,
    /// Block the publisher until space frees up.
    Block,
}

/// One enqueued event with its delivery metadata.
pub(crate) struct QueuedEvent {
    pub event: Arc<dyn Event>,
    pub type_id: EventTypeId,
    pub priority: EventPriority,
    pub seq: u64,
    pub enqueued: Instant,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then earlier seq (FIFO).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub(crate) struct PriorityInner {
    heap: Mutex<BinaryHeap<QueuedEvent>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
    stopped: AtomicBool,
}

/// Result of a blocking pop.
pub(crate) enum Pop {
    Event(QueuedEvent),
    Stopped,
}

/// Producer half of the queue; dropped on `stop` so no new events enter.
pub(crate) enum QueueProducer {
    Fifo(Sender<QueuedEvent>),
    Priority(Arc<PriorityInner>),
}

impl QueueProducer {
    pub fn push(&self, item: QueuedEvent, policy: BackpressurePolicy) -> Result<(), EventError> {
        match self {
            QueueProducer::Fifo(tx) => match policy {
                BackpressurePolicy::DropNewest => {
                    tx.try_send(item).map_err(|_| EventError::QueueFull)
                }
                BackpressurePolicy::Block => {
                    tx.send(item).map_err(|_| EventError::EventBusNotStarted)
                }
            },
            QueueProducer::Priority(inner) => {
                let mut heap = inner.heap.lock().expect("event queue poisoned");
                while heap.len() >= inner.capacity {
                    match policy {
                        BackpressurePolicy::DropNewest => return Err(EventError::QueueFull),
                        BackpressurePolicy::Block => {
                            if inner.stopped.load(Ordering::Acquire) {
                                return Err(EventError::EventBusNotStarted);
                            }
                            heap = inner
                                .not_full
                                .wait(heap)
                                .expect("event queue poisoned");
                        }
                    }
                }
                heap.push(item);
                inner.not_empty.notify_one();
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            QueueProducer::Fifo(tx) => tx.len(),
            QueueProducer::Priority(inner) => {
                inner.heap.lock().expect("event queue poisoned").len()
            }
        }
    }
}

/// Consumer half; one clone per worker.
#[derive(Clone)]
pub(crate) enum QueueConsumer {
    Fifo {
        rx: Receiver<QueuedEvent>,
        stop: Receiver<()>,
    },
    Priority(Arc<PriorityInner>),
}

impl QueueConsumer {
    /// Blocks until an event arrives or the stop token fires.
    pub fn pop(&self) -> Pop {
        match self {
            QueueConsumer::Fifo { rx, stop } => {
                crossbeam_channel::select! {
                    recv(rx) -> item => match item {
                        Ok(item) => Pop::Event(item),
                        Err(_) => Pop::Stopped,
                    },
                    recv(stop) -> _ => Pop::Stopped,
                }
            }
            QueueConsumer::Priority(inner) => {
                let mut heap = inner.heap.lock().expect("event queue poisoned");
                loop {
                    if let Some(item) = heap.pop() {
                        inner.not_full.notify_one();
                        return Pop::Event(item);
                    }
                    if inner.stopped.load(Ordering::Acquire) {
                        return Pop::Stopped;
                    }
                    heap = inner.not_empty.wait(heap).expect("event queue poisoned");
                }
            }
        }
    }

    /// Non-blocking pop, used to drain after stop.
    pub fn try_pop(&self) -> Option<QueuedEvent> {
        match self {
            QueueConsumer::Fifo { rx, .. } => rx.try_recv().ok(),
            QueueConsumer::Priority(inner) => {
                inner.heap.lock().expect("event queue poisoned").pop()
            }
        }
    }
}

/// Signals consumers to stop; for FIFO queues this is the sender side of a
/// zero-purpose channel whose disconnect is the token.
pub(crate) struct StopToken {
    fifo_stop: Option<Sender<()>>,
    priority: Option<Arc<PriorityInner>>,
}

impl StopToken {
    /// Fires the token. Safe to call once; consumers drain and exit.
    pub fn fire(self) {
        if let Some(inner) = self.priority {
            inner.stopped.store(true, Ordering::Release);
            inner.not_empty.notify_all();
            inner.not_full.notify_all();
        }
        drop(self.fifo_stop);
    }
}

/// Builds the queue triple for a bus start.
pub(crate) fn build_queue(
    capacity: usize,
    priority: bool,
) -> (QueueProducer, QueueConsumer, StopToken) {
    let capacity = capacity.max(1);
    if priority {
        let inner = Arc::new(PriorityInner {
            heap: Mutex::new(BinaryHeap::with_capacity(capacity)),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            stopped: AtomicBool::new(false),
        });
        (
            QueueProducer::Priority(inner.clone()),
            QueueConsumer::Priority(inner.clone()),
            StopToken {
                fifo_stop: None,
                priority: Some(inner),
            },
        )
    } else {
        let (tx, rx) = bounded(capacity);
        let (stop_tx, stop_rx) = bounded(0);
        (
            QueueProducer::Fifo(tx),
            QueueConsumer::Fifo { rx, stop: stop_rx },
            StopToken {
                fifo_stop: Some(stop_tx),
                priority: None,
            },
        )
    }
}
