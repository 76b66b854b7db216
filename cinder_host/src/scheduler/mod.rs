//! Timed event dispatch.
//!
//! One producer appends time-ordered events; one real-time consumer sleeps
//! until each event's instant and emits it on the pin bus. Backpressure is
//! lock retention: once the queue is at capacity the consumer keeps the
//! mutex across successive pops (and the sleeps between them) until it has
//! drained below capacity, so a producer cannot re-race the dispatcher one
//! slot at a time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use cinder_shared::clock::{Clock, TimePoint};
use cinder_shared::event::{Event, PinAction};

use crate::hardware::PinBus;

/// How much slack the consumer has when it runs an idle callback: `Wide`
/// means there is comfortably time for non-trivial service work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleInterval {
    Short,
    Wide,
}

const WIDE_SLACK: Duration = Duration::from_millis(10);

/// Fan-out target for the consumer's spare CPU. Returns true to request
/// another callback before the scheduler goes back to sleep.
pub trait IdleHooks: Send {
    fn on_idle_cpu(&mut self, interval: IdleInterval) -> bool;
}

struct QueueState {
    events: VecDeque<Event>,
    /// Time of the most recently queued event; producers must never go
    /// backwards (unchecked in release).
    last_queued: TimePoint,
}

pub struct Scheduler {
    state: Mutex<QueueState>,
    cond: Condvar,
    clock: Arc<dyn Clock>,
    capacity: usize,
    max_sleep_ns: AtomicI64,
    default_max_sleep: Duration,
    last_handled_ns: AtomicI64,
    queued: AtomicU64,
    dispatched: AtomicU64,
    stop: AtomicBool,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>, capacity: usize, default_max_sleep: Duration) -> Self {
        Scheduler {
            state: Mutex::new(QueueState {
                events: VecDeque::with_capacity(capacity),
                last_queued: TimePoint::ZERO,
            }),
            cond: Condvar::new(),
            clock,
            capacity,
            max_sleep_ns: AtomicI64::new(default_max_sleep.as_nanos() as i64),
            default_max_sleep,
            last_handled_ns: AtomicI64::new(0),
            queued: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            stop: AtomicBool::new(false),
        }
    }

    /// Append an event, blocking at capacity until the consumer has drained
    /// (and, while it retains the lock, through its dispatches).
    pub fn queue(&self, event: Event) {
        let mut state = self.state.lock().unwrap();
        while state.events.len() >= self.capacity && !self.stop.load(Ordering::SeqCst) {
            state = self.cond.wait(state).unwrap();
        }
        debug_assert!(
            state.events.is_empty() || event.time >= state.last_queued,
            "events must be enqueued in non-decreasing time order"
        );
        if state.events.is_empty() {
            // idle-to-active transition: anchor the handled time at the
            // present so stale spacing doesn't burst-emit
            self.last_handled_ns
                .store(self.clock.now().as_nanos(), Ordering::Relaxed);
        }
        state.last_queued = event.time;
        state.events.push_back(event);
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.cond.notify_all();
    }

    /// Non-blocking capacity probe for the planner's idle pump.
    pub fn is_room_in_buffer(&self) -> bool {
        self.state.lock().unwrap().events.len() < self.capacity
    }

    pub fn set_max_sleep(&self, cap: Duration) {
        self.max_sleep_ns
            .store(cap.as_nanos() as i64, Ordering::Relaxed);
    }

    pub fn set_default_max_sleep(&self) {
        self.max_sleep_ns
            .store(self.default_max_sleep.as_nanos() as i64, Ordering::Relaxed);
    }

    fn max_sleep(&self) -> Duration {
        Duration::from_nanos(self.max_sleep_ns.load(Ordering::Relaxed).max(0) as u64)
    }

    /// Time of the last emitted event. Deliberately the event's own time,
    /// not `now()`: a late scheduler must preserve inter-event spacing.
    pub fn last_event_handled_time(&self) -> TimePoint {
        TimePoint::from_nanos(self.last_handled_ns.load(Ordering::Relaxed))
    }

    /// Ask the consumer to exit once the queue is drained.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.cond.notify_all();
    }

    /// Emergency path: drop everything still queued and stop. The event
    /// currently being dispatched finishes or bails; nothing else emits.
    pub fn abort(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.state.lock().unwrap().events.clear();
        self.cond.notify_all();
    }

    /// Block until every queued event has been dispatched, including the
    /// one the consumer may already hold in flight.
    pub fn wait_until_empty(&self) {
        let mut state = self.state.lock().unwrap();
        loop {
            let drained = state.events.is_empty()
                && self.dispatched.load(Ordering::SeqCst) == self.queued.load(Ordering::SeqCst);
            if drained || self.stop.load(Ordering::SeqCst) {
                return;
            }
            let (next, _) = self
                .cond
                .wait_timeout(state, Duration::from_millis(5))
                .unwrap();
            state = next;
        }
    }

    /// The consumer body. Runs on the dedicated dispatch thread until
    /// `stop()` and the queue drains.
    pub fn event_loop(&self, bus: &dyn PinBus, hooks: &mut dyn IdleHooks) {
        let mut retained: Option<MutexGuard<'_, QueueState>> = None;
        loop {
            let mut state = match retained.take() {
                Some(guard) => guard,
                None => self.state.lock().unwrap(),
            };

            // wait for work, servicing idle hooks between timed waits
            let event = loop {
                if let Some(event) = state.events.pop_front() {
                    break event;
                }
                if self.stop.load(Ordering::SeqCst) {
                    return;
                }
                drop(state);
                hooks.on_idle_cpu(IdleInterval::Wide);
                state = self.state.lock().unwrap();
                if state.events.is_empty() && !self.stop.load(Ordering::SeqCst) {
                    let (next, _) = self.cond.wait_timeout(state, self.max_sleep()).unwrap();
                    state = next;
                }
            };

            if state.events.len() + 1 >= self.capacity {
                // the queue was full: hold the lock through this dispatch so
                // the producer cannot re-race the drain one slot at a time
                retained = Some(state);
            } else {
                self.cond.notify_all();
                drop(state);
            }

            self.dispatch(bus, hooks, &event);
        }
    }

    /// Sleep (in capped slices, fanning out idle CPU) until the event is
    /// due, then emit it. Allocation-free.
    fn dispatch(&self, bus: &dyn PinBus, hooks: &mut dyn IdleHooks, event: &Event) {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                // emergency abort: the pending edge is moot, teardown owns
                // the pins from here
                return;
            }
            let now = self.clock.now();
            if now >= event.time {
                break;
            }
            let slack = event.time.saturating_since(now);
            let interval = if slack >= WIDE_SLACK {
                IdleInterval::Wide
            } else {
                IdleInterval::Short
            };
            if hooks.on_idle_cpu(interval) {
                continue; // a hook wants CPU; don't sleep yet
            }
            let now = self.clock.now();
            if now >= event.time {
                break;
            }
            let chunk = now + self.max_sleep();
            let deadline = if chunk < event.time { chunk } else { event.time };
            self.clock.sleep_until(deadline);
        }

        match event.action {
            PinAction::Level(level) => bus.write(event.pin, level),
            PinAction::Pwm { duty, period } => bus.set_pwm(event.pin, duty, period),
            PinAction::Null => {}
        }
        self.last_handled_ns
            .store(event.time.as_nanos(), Ordering::Relaxed);
        self.dispatched.fetch_add(1, Ordering::SeqCst);
    }

    /// Promote the calling thread to the SCHED_FIFO class. Refusal (no
    /// privilege, non-Linux host) is a warning, not an error.
    pub fn init_dispatch_thread(priority: i32) {
        #[cfg(target_os = "linux")]
        {
            let param = libc::sched_param {
                sched_priority: priority,
            };
            let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                tracing::warn!(priority, %err, "could not enter SCHED_FIFO; running best-effort");
            } else {
                tracing::info!(priority, "dispatch thread running SCHED_FIFO");
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = priority;
            tracing::warn!("real-time scheduling unavailable on this platform");
        }
    }
}
