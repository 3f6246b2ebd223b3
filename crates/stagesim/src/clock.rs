//! Virtual clock and single-threaded executor.
//!
//! Simulated time advances only when [`VirtualClock::tick`] is called.
//! Every suspended computation in a run is a task on one `LocalPool`; the
//! clock fires due callbacks in registration order and drains the pool after
//! each one, so all continuations a callback unblocks run before the next
//! callback fires.
//!
//! ```text
//! tick(now = T)
//!   ├─> fire callback (T, seq 0) ─> run tasks until stalled
//!   ├─> fire callback (T, seq 1) ─> run tasks until stalled
//!   └─> now = T + 1
//! ```
//!
//! Components never own the executor. They hold a cheap [`Clock`] handle
//! that reads the time, registers callbacks, suspends, and spawns tasks.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures::channel::oneshot;
use futures::executor::{LocalPool, LocalSpawner};
use futures::task::LocalSpawnExt;

use crate::error::SimError;

/// Indivisible unit of virtual time.
pub type Tick = u64;

type Callback = Box<dyn FnOnce()>;

struct Scheduled {
    action: Callback,
    /// Repeating callbacks never count as outstanding work.
    background: bool,
}

// ============================================================================
// Shared State
// ============================================================================

#[derive(Default)]
struct ClockState {
    now: Tick,
    /// Registration counter; breaks ties between callbacks due at one tick.
    seq: u64,
    pending: BTreeMap<(Tick, u64), Scheduled>,
    /// Pending callbacks that are not `background`.
    foreground: usize,
    stopped: bool,
}

/// Why [`VirtualClock::start`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The requested number of ticks executed.
    TickLimit,
    /// [`Clock::stop`] was called.
    Stopped,
    /// Nothing but repeating callbacks is scheduled; no task can ever
    /// make progress again.
    Idle,
}

// ============================================================================
// Clock Handle
// ============================================================================

/// Handle to the virtual timeline, passed to every component.
#[derive(Clone)]
pub struct Clock {
    state: Rc<RefCell<ClockState>>,
    spawner: LocalSpawner,
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Clock")
            .field("now", &state.now)
            .field("pending", &state.pending.len())
            .field("stopped", &state.stopped)
            .finish()
    }
}

impl Clock {
    /// Current tick.
    pub fn now(&self) -> Tick {
        self.state.borrow().now
    }

    /// Registers a one-shot callback at `now + max(1, delay)`.
    pub fn schedule(&self, action: impl FnOnce() + 'static, delay: Tick) {
        self.insert(Box::new(action), delay, false);
    }

    /// Runs `action` every `period` ticks until the clock is stopped with
    /// `clear_pending`.
    ///
    /// Repeating callbacks are background work: they keep firing while the
    /// loop runs but never keep an unbounded [`VirtualClock::start`] alive.
    pub fn schedule_repeating(&self, action: impl FnMut() + 'static, period: Tick) {
        fn arm(clock: Clock, action: Rc<RefCell<dyn FnMut()>>, period: Tick) {
            let next = clock.clone();
            clock.insert(
                Box::new(move || {
                    (action.borrow_mut())();
                    arm(next, action, period);
                }),
                period,
                true,
            );
        }

        arm(self.clone(), Rc::new(RefCell::new(action)), period);
    }

    /// Suspension point that resumes once `ticks` ticks (at least one) have
    /// elapsed. The wake-up is registered immediately, not on first poll.
    pub fn wait(&self, ticks: Tick) -> Sleep {
        let shared = Rc::new(RefCell::new(SleepState::default()));
        let fire = Rc::clone(&shared);
        self.schedule(
            move || {
                let waker = {
                    let mut state = fire.borrow_mut();
                    state.fired = true;
                    state.waker.take()
                };
                if let Some(waker) = waker {
                    waker.wake();
                }
            },
            ticks,
        );
        Sleep { shared }
    }

    /// Spawns a task on the simulation executor.
    ///
    /// The returned handle may be dropped to detach the task.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task = async move {
            // receiver may have been dropped; the task is detached then
            let _ = tx.send(future.await);
        };
        if let Err(err) = self.spawner.spawn_local(task) {
            tracing::error!(error = %err, "failed to spawn simulation task");
        }
        JoinHandle { rx }
    }

    /// Halts [`VirtualClock::start`] after the current tick.
    ///
    /// With `clear_pending`, every unfired callback is discarded; tasks
    /// waiting on them stay suspended.
    pub fn stop(&self, clear_pending: bool) {
        let discarded = {
            let mut state = self.state.borrow_mut();
            state.stopped = true;
            if clear_pending {
                state.foreground = 0;
                std::mem::take(&mut state.pending)
            } else {
                BTreeMap::new()
            }
        };
        if !discarded.is_empty() {
            tracing::debug!(discarded = discarded.len(), "cleared pending callbacks");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state.borrow().stopped
    }

    /// Whether any callback is waiting to fire.
    pub fn has_pending(&self) -> bool {
        !self.state.borrow().pending.is_empty()
    }

    /// Whether any one-shot callback is waiting to fire.
    pub fn has_foreground_pending(&self) -> bool {
        self.state.borrow().foreground > 0
    }

    /// Number of callbacks waiting to fire.
    pub fn pending_len(&self) -> usize {
        self.state.borrow().pending.len()
    }

    fn insert(&self, action: Callback, delay: Tick, background: bool) {
        let mut state = self.state.borrow_mut();
        let target = state.now.saturating_add(delay.max(1));
        let seq = state.seq;
        state.seq += 1;
        if !background {
            state.foreground += 1;
        }
        state
            .pending
            .insert((target, seq), Scheduled { action, background });
    }

    /// Removes the earliest callback due at or before `now`.
    fn take_due(&self) -> Option<Callback> {
        let mut state = self.state.borrow_mut();
        let now = state.now;
        let key = *state.pending.keys().next()?;
        debug_assert!(key.0 >= now, "callback at tick {} left behind at {now}", key.0);
        if key.0 > now {
            return None;
        }
        let scheduled = state.pending.remove(&key)?;
        if !scheduled.background {
            state.foreground -= 1;
        }
        Some(scheduled.action)
    }

    fn advance(&self) {
        let mut state = self.state.borrow_mut();
        let next = state.now.checked_add(1);
        debug_assert!(next.is_some(), "clock overflow");
        state.now = next.unwrap_or(Tick::MAX);
    }
}

// ============================================================================
// Virtual Clock (executor owner)
// ============================================================================

/// Owns the executor and advances simulated time.
pub struct VirtualClock {
    pool: LocalPool,
    clock: Clock,
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualClock {
    /// Creates a clock at tick zero with an empty executor.
    pub fn new() -> Self {
        let pool = LocalPool::new();
        let spawner = pool.spawner();
        Self {
            pool,
            clock: Clock {
                state: Rc::new(RefCell::new(ClockState::default())),
                spawner,
            },
        }
    }

    /// Handle for components.
    pub fn clock(&self) -> Clock {
        self.clock.clone()
    }

    pub fn now(&self) -> Tick {
        self.clock.now()
    }

    /// Advances time by exactly one tick.
    ///
    /// Fires every callback due now in registration order, including ones
    /// registered for this tick while the pass is running, then increments
    /// the tick counter.
    pub fn tick(&mut self) {
        self.pool.run_until_stalled();
        while let Some(callback) = self.clock.take_due() {
            callback();
            self.pool.run_until_stalled();
        }
        self.clock.advance();
    }

    /// Drives the loop until `max_ticks` ticks have executed, the clock is
    /// stopped, or nothing is left to wake.
    ///
    /// Without a tick limit, the loop also returns once only repeating
    /// callbacks remain.
    pub fn start(&mut self, max_ticks: Option<u64>) -> StopReason {
        self.clock.state.borrow_mut().stopped = false;
        self.pool.run_until_stalled();

        let started_at = self.now();
        let mut executed = 0u64;
        let reason = loop {
            if self.clock.is_stopped() {
                break StopReason::Stopped;
            }
            if max_ticks.is_some_and(|max| executed >= max) {
                break StopReason::TickLimit;
            }
            let idle = if max_ticks.is_some() {
                !self.clock.has_pending()
            } else {
                !self.clock.has_foreground_pending()
            };
            if idle {
                break StopReason::Idle;
            }
            self.tick();
            executed += 1;
        };

        tracing::debug!(
            from = started_at,
            to = self.now(),
            reason = ?reason,
            "clock loop returned"
        );
        reason
    }

    /// Runs the timeline until `future` completes and returns its output.
    ///
    /// Returns as soon as the future completes, possibly partway through a
    /// tick: [`now`](Self::now) is then the tick it completed at, and any
    /// callbacks still due at that tick fire first on the next advance.
    ///
    /// Fails with [`SimError::Stalled`] when the future is still pending but
    /// only repeating callbacks (or nothing) remain.
    pub fn run_until<F>(&mut self, future: F) -> Result<F::Output, SimError>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let slot = Rc::new(RefCell::new(None));
        let out = Rc::clone(&slot);
        self.clock.spawner.spawn_local(async move {
            let value = future.await;
            *out.borrow_mut() = Some(value);
        })?;

        loop {
            self.pool.run_until_stalled();
            if let Some(value) = slot.borrow_mut().take() {
                return Ok(value);
            }
            if let Some(callback) = self.clock.take_due() {
                callback();
                continue;
            }
            if !self.clock.has_foreground_pending() {
                let tick = self.now();
                tracing::warn!(tick, "simulation stalled");
                return Err(SimError::Stalled { tick });
            }
            self.clock.advance();
        }
    }
}

// ============================================================================
// Futures
// ============================================================================

#[derive(Default)]
struct SleepState {
    fired: bool,
    waker: Option<Waker>,
}

/// Future returned by [`Clock::wait`].
pub struct Sleep {
    shared: Rc<RefCell<SleepState>>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.shared.borrow_mut();
        if state.fired {
            Poll::Ready(())
        } else {
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

/// Output of a spawned task; `None` if the task was dropped unfinished.
pub struct JoinHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for JoinHandle<T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        Pin::new(&mut self.rx).poll(cx).map(Result::ok)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cell::Cell;

    #[test]
    fn callback_fires_once_at_target() {
        let mut vclock = VirtualClock::new();
        let clock = vclock.clock();
        let fired_at = Rc::new(RefCell::new(Vec::new()));

        let log = Rc::clone(&fired_at);
        let c = clock.clone();
        clock.schedule(move || log.borrow_mut().push(c.now()), 5);

        for _ in 0..10 {
            vclock.tick();
        }

        assert_eq!(*fired_at.borrow(), vec![5]);
        assert!(!clock.has_pending());
    }

    #[test]
    fn zero_delay_means_next_tick() {
        let mut vclock = VirtualClock::new();
        let clock = vclock.clock();
        let fired = Rc::new(Cell::new(None));

        let f = Rc::clone(&fired);
        let c = clock.clone();
        clock.schedule(move || f.set(Some(c.now())), 0);
        vclock.tick();
        assert_eq!(fired.get(), None);
        vclock.tick();
        assert_eq!(fired.get(), Some(1));
    }

    #[test]
    fn same_tick_callbacks_run_in_registration_order() {
        let mut vclock = VirtualClock::new();
        let clock = vclock.clock();
        let order = Rc::new(RefCell::new(Vec::new()));

        for label in ["a", "b", "c"] {
            let o = Rc::clone(&order);
            clock.schedule(move || o.borrow_mut().push(label), 3);
        }
        vclock.start(None);

        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn wait_resumes_after_elapsed_ticks() {
        let mut vclock = VirtualClock::new();
        let clock = vclock.clock();

        let c = clock.clone();
        let resumed = vclock
            .run_until(async move {
                c.wait(150).await;
                c.now()
            })
            .unwrap();

        assert_eq!(resumed, 150);
    }

    #[test]
    fn start_honours_tick_limit() {
        let mut vclock = VirtualClock::new();
        let clock = vclock.clock();
        let count = Rc::new(Cell::new(0));

        let c = Rc::clone(&count);
        clock.schedule_repeating(move || c.set(c.get() + 1), 10);

        assert_eq!(vclock.start(Some(55)), StopReason::TickLimit);
        assert_eq!(vclock.now(), 55);
        assert_eq!(count.get(), 5);
    }

    #[test]
    fn stop_from_callback_halts_loop() {
        let mut vclock = VirtualClock::new();
        let clock = vclock.clock();
        let count = Rc::new(Cell::new(0));

        let c = Rc::clone(&count);
        clock.schedule_repeating(move || c.set(c.get() + 1), 1);
        let stopper = clock.clone();
        clock.schedule(move || stopper.stop(true), 20);

        assert_eq!(vclock.start(None), StopReason::Stopped);
        assert_eq!(vclock.now(), 21);
        assert!(!clock.has_pending());
    }

    #[test]
    fn stop_without_clearing_resumes_on_next_start() {
        let mut vclock = VirtualClock::new();
        let clock = vclock.clock();
        let fired_at = Rc::new(Cell::new(None));

        let f = Rc::clone(&fired_at);
        let c = clock.clone();
        clock.schedule(move || f.set(Some(c.now())), 30);
        let stopper = clock.clone();
        clock.schedule(move || stopper.stop(false), 10);

        assert_eq!(vclock.start(None), StopReason::Stopped);
        assert_eq!(vclock.now(), 11);
        assert_eq!(clock.pending_len(), 1);
        assert_eq!(fired_at.get(), None);

        assert_eq!(vclock.start(None), StopReason::Idle);
        assert_eq!(fired_at.get(), Some(30));
        assert_eq!(vclock.now(), 31);
    }

    #[test]
    fn repeating_callbacks_do_not_keep_loop_alive() {
        let mut vclock = VirtualClock::new();
        let clock = vclock.clock();
        let count = Rc::new(Cell::new(0));

        let c = Rc::clone(&count);
        clock.schedule_repeating(move || c.set(c.get() + 1), 10);
        let sleeper = clock.clone();
        drop(clock.spawn(async move { sleeper.wait(35).await }));

        assert_eq!(vclock.start(None), StopReason::Idle);
        assert_eq!(vclock.now(), 36);
        assert_eq!(count.get(), 3);
        assert!(clock.has_pending());
        assert!(!clock.has_foreground_pending());

        let result = vclock.run_until(futures::future::pending::<()>());
        assert!(matches!(result, Err(SimError::Stalled { tick: 36 })));
    }

    #[test]
    fn start_returns_idle_when_nothing_is_scheduled() {
        let mut vclock = VirtualClock::new();
        assert_eq!(vclock.start(None), StopReason::Idle);
        assert_eq!(vclock.now(), 0);
    }

    #[test]
    fn run_until_reports_stall() {
        let mut vclock = VirtualClock::new();
        let result = vclock.run_until(futures::future::pending::<()>());
        assert!(matches!(result, Err(SimError::Stalled { tick: 0 })));
    }

    #[test]
    fn spawned_task_output_is_joined() {
        let mut vclock = VirtualClock::new();
        let clock = vclock.clock();

        let c = clock.clone();
        let handle = clock.spawn(async move {
            c.wait(7).await;
            42
        });
        let out = vclock.run_until(handle).unwrap();
        assert_eq!(out, Some(42));
        assert_eq!(vclock.now(), 7);
    }

    proptest! {
        #[test]
        fn prop_ticks_advance_by_one(n in 0u64..500) {
            let mut vclock = VirtualClock::new();
            for _ in 0..n {
                vclock.tick();
            }
            prop_assert_eq!(vclock.now(), n);
        }

        #[test]
        fn prop_callbacks_fire_exactly_at_target(delays in prop::collection::vec(1u64..200, 1..30)) {
            let mut vclock = VirtualClock::new();
            let clock = vclock.clock();
            let fired = Rc::new(RefCell::new(Vec::new()));

            for (i, delay) in delays.iter().copied().enumerate() {
                let f = Rc::clone(&fired);
                let c = clock.clone();
                clock.schedule(move || f.borrow_mut().push((i, c.now())), delay);
            }
            vclock.start(None);

            let fired = fired.borrow();
            prop_assert_eq!(fired.len(), delays.len());
            for (i, at) in fired.iter() {
                prop_assert_eq!(*at, delays[*i]);
            }
        }
    }
}
