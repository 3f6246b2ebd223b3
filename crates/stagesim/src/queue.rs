//! Admission queue and worker pool.
//!
//! Each stage owns one [`Queue`]: a bounded FIFO of events waiting for a
//! worker, plus a fixed-size pool of workers. Waiters are resolved directly
//! when a worker is released, in the same tick, in arrival order:
//!
//! ```text
//! try_enqueue(e) ──> worker free and nobody waiting? ──yes──> lease now
//!                         │no
//!                    waiting.len() >= capacity? ──yes──> QueueFull
//!                         │no
//!                    push_back(e) ... release() hands the worker to the head
//! ```

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

pub use stagesim_config::QueueConfig;

use crate::error::QueueFull;
use crate::event::EventId;

struct Waiter {
    event: EventId,
    assigned: Option<usize>,
    waker: Option<Waker>,
}

struct QueueState {
    /// Event held by each worker; grown lazily up to `max_workers`.
    workers: Vec<Option<EventId>>,
    waiting: VecDeque<Rc<RefCell<Waiter>>>,
    capacity: usize,
    max_workers: usize,
}

impl QueueState {
    fn free_worker(&mut self) -> Option<usize> {
        if let Some(index) = self.workers.iter().position(Option::is_none) {
            return Some(index);
        }
        if self.workers.len() < self.max_workers {
            self.workers.push(None);
            return Some(self.workers.len() - 1);
        }
        None
    }
}

/// Bounded FIFO wait-queue in front of a worker pool.
pub struct Queue {
    state: RefCell<QueueState>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Queue")
            .field("waiting", &state.waiting.len())
            .field("capacity", &state.capacity)
            .field("busy", &state.workers.iter().filter(|w| w.is_some()).count())
            .field("max_workers", &state.max_workers)
            .finish()
    }
}

impl Queue {
    pub fn new(config: &QueueConfig) -> Rc<Self> {
        let (capacity, max_workers) = if config.unbounded {
            (usize::MAX, usize::MAX)
        } else {
            (config.capacity, config.workers)
        };
        Rc::new(Self {
            state: RefCell::new(QueueState {
                workers: Vec::new(),
                waiting: VecDeque::new(),
                capacity,
                max_workers,
            }),
        })
    }

    /// Admits `event`, or refuses it if the wait-queue is at capacity.
    ///
    /// A refusal leaves the queue and the pool untouched.
    pub fn try_enqueue(self: &Rc<Self>, event: EventId) -> Result<Acquire, QueueFull> {
        let mut state = self.state.borrow_mut();

        if state.waiting.is_empty() {
            if let Some(worker) = state.free_worker() {
                state.workers[worker] = Some(event);
                return Ok(Acquire {
                    queue: Rc::clone(self),
                    slot: Slot::Assigned(worker),
                });
            }
        }

        if state.waiting.len() >= state.capacity {
            return Err(QueueFull {
                capacity: state.capacity,
            });
        }

        let waiter = Rc::new(RefCell::new(Waiter {
            event,
            assigned: None,
            waker: None,
        }));
        state.waiting.push_back(Rc::clone(&waiter));
        tracing::trace!(event = %event, waiting = state.waiting.len(), "queued for a worker");

        Ok(Acquire {
            queue: Rc::clone(self),
            slot: Slot::Waiting(waiter),
        })
    }

    /// Whether the next admission would be refused.
    pub fn is_full(&self) -> bool {
        let state = self.state.borrow();
        state.waiting.len() >= state.capacity
    }

    /// Whether an event admitted now would get a worker immediately.
    pub fn can_work(&self) -> bool {
        let state = self.state.borrow();
        state.waiting.is_empty()
            && (state.workers.len() < state.max_workers
                || state.workers.iter().any(Option::is_none))
    }

    /// Events waiting for a worker.
    pub fn len(&self) -> usize {
        self.state.borrow().waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().waiting.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.state.borrow().capacity
    }

    pub fn busy_workers(&self) -> usize {
        self.state
            .borrow()
            .workers
            .iter()
            .filter(|w| w.is_some())
            .count()
    }

    /// Events currently held by workers, by worker index.
    pub fn assignments(&self) -> Vec<Option<EventId>> {
        self.state.borrow().workers.clone()
    }

    /// Frees `worker`, handing it straight to the head waiter if any.
    fn release(&self, worker: usize) {
        let waker = {
            let mut state = self.state.borrow_mut();
            assert!(
                state.workers.get(worker).is_some_and(Option::is_some),
                "released worker {worker} that was not busy"
            );
            state.workers[worker] = None;

            match state.waiting.pop_front() {
                Some(next) => {
                    let mut next = next.borrow_mut();
                    state.workers[worker] = Some(next.event);
                    next.assigned = Some(worker);
                    tracing::trace!(event = %next.event, worker, "worker handed off");
                    next.waker.take()
                }
                None => None,
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn cancel(&self, waiter: &Rc<RefCell<Waiter>>) {
        self.state
            .borrow_mut()
            .waiting
            .retain(|w| !Rc::ptr_eq(w, waiter));
    }
}

// ============================================================================
// Acquire / Lease
// ============================================================================

enum Slot {
    Assigned(usize),
    Waiting(Rc<RefCell<Waiter>>),
    Taken,
}

/// Resolves to a [`WorkerLease`] once this event reaches a free worker.
///
/// Dropping it before completion gives up the place in line (or the
/// worker, if one was already handed over).
pub struct Acquire {
    queue: Rc<Queue>,
    slot: Slot,
}

impl std::fmt::Debug for Acquire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acquire")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl Future for Acquire {
    type Output = WorkerLease;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<WorkerLease> {
        let this = &mut *self;
        let worker = match std::mem::replace(&mut this.slot, Slot::Taken) {
            Slot::Assigned(worker) => worker,
            Slot::Waiting(waiter) => {
                let assigned = waiter.borrow().assigned;
                match assigned {
                    Some(worker) => worker,
                    None => {
                        waiter.borrow_mut().waker = Some(cx.waker().clone());
                        this.slot = Slot::Waiting(waiter);
                        return Poll::Pending;
                    }
                }
            }
            Slot::Taken => panic!("Acquire polled after completion"),
        };
        Poll::Ready(WorkerLease {
            queue: Rc::clone(&this.queue),
            worker,
        })
    }
}

impl Drop for Acquire {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.slot, Slot::Taken) {
            Slot::Assigned(worker) => self.queue.release(worker),
            Slot::Waiting(waiter) => {
                let assigned = waiter.borrow().assigned;
                match assigned {
                    Some(worker) => self.queue.release(worker),
                    None => self.queue.cancel(&waiter),
                }
            }
            Slot::Taken => {}
        }
    }
}

/// A busy worker; released back to the pool on drop.
pub struct WorkerLease {
    queue: Rc<Queue>,
    worker: usize,
}

impl WorkerLease {
    pub fn worker(&self) -> usize {
        self.worker
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.queue.release(self.worker);
    }
}

// ============================================================================
// Tests
// ============================================================================
