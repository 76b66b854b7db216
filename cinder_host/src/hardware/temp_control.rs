//! Closed-loop heater control: thermistor → low-pass → PID → heater PWM.
//!
//! All sampling runs from the dispatch thread's idle hook; the producer
//! only touches the word-sized setpoint/measurement atomics.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use cinder_shared::clock::TimePoint;
use cinder_shared::control::{LowPassFilter, Pid};
use cinder_shared::event::PinId;

use super::pins::PinBus;
use super::thermistor::Thermistor;

/// "No reading / no setpoint yet" marker, below absolute zero.
pub const DEFAULT_TEMP: f64 = -300.0;

const READ_INTERVAL: Duration = Duration::from_secs(3);
const MAX_READ: Duration = Duration::from_secs(1);
/// A sample older than this reflects a stalled charge curve and is dropped.
#[cfg(not(feature = "instrumented"))]
const LATENCY_THRESHOLD: Duration = Duration::from_millis(40);
/// Instrumented emulation delivers idle callbacks far too slowly for the
/// real bound; relax it so readings still land.
#[cfg(feature = "instrumented")]
const LATENCY_THRESHOLD: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaterKind {
    Hotend,
    HeatedBed,
}

struct TempState {
    thermistor: Box<dyn Thermistor>,
    pid: Pid,
    filter: LowPassFilter,
    reading: bool,
    next_read: TimePoint,
    last_poll: TimePoint,
    last_sample: Option<TimePoint>,
}

pub struct TempControl {
    kind: HeaterKind,
    heater_pin: PinId,
    pwm_period: Duration,
    setpoint_mc: AtomicI32,
    measured_mc: AtomicI32,
    inner: Mutex<TempState>,
}

impl TempControl {
    pub fn new(
        kind: HeaterKind,
        heater_pin: PinId,
        pwm_period: Duration,
        thermistor: Box<dyn Thermistor>,
        pid: Pid,
        filter: LowPassFilter,
    ) -> Self {
        TempControl {
            kind,
            heater_pin,
            pwm_period,
            setpoint_mc: AtomicI32::new((DEFAULT_TEMP * 1000.0) as i32),
            measured_mc: AtomicI32::new((DEFAULT_TEMP * 1000.0) as i32),
            inner: Mutex::new(TempState {
                thermistor,
                pid,
                filter,
                reading: false,
                next_read: TimePoint::ZERO,
                last_poll: TimePoint::ZERO,
                last_sample: None,
            }),
        }
    }

    pub fn kind(&self) -> HeaterKind {
        self.kind
    }

    pub fn heater_pin(&self) -> PinId {
        self.heater_pin
    }

    /// Producer side: set the target temperature, °C.
    pub fn set_target(&self, celsius: f64) {
        self.setpoint_mc
            .store((celsius * 1000.0) as i32, Ordering::Relaxed);
    }

    pub fn target(&self) -> f64 {
        self.setpoint_mc.load(Ordering::Relaxed) as f64 / 1000.0
    }

    /// Producer side: last filtered reading, °C; `DEFAULT_TEMP` until the
    /// first sample lands.
    pub fn measured(&self) -> f64 {
        self.measured_mc.load(Ordering::Relaxed) as f64 / 1000.0
    }

    /// One idle-hook service step. Returns true when the control loop wants
    /// another callback soon (a read is in flight).
    pub fn on_idle_cpu(&self, now: TimePoint, bus: &dyn PinBus) -> bool {
        let mut state = self.inner.lock().unwrap();
        if state.reading {
            self.service_read(&mut state, now, bus)
        } else {
            state.last_poll = now;
            if now >= state.next_read {
                state.next_read = now + READ_INTERVAL;
                state.thermistor.start_read(now);
                state.reading = true;
                true
            } else {
                false
            }
        }
    }

    fn service_read(&self, state: &mut TempState, now: TimePoint, bus: &dyn PinBus) -> bool {
        if !state.thermistor.is_ready(now) {
            let waited = state.thermistor.time_since_start(now);
            state.last_poll = now;
            if waited > MAX_READ {
                tracing::error!(kind = ?self.kind, ?waited, "thermistor read timed out");
                state.reading = false;
                return false;
            }
            return true;
        }

        let stale = now.saturating_since(state.last_poll) > LATENCY_THRESHOLD;
        state.last_poll = now;
        if stale {
            // too much latency since the last poll; the charge curve can't
            // be trusted, so restart the read
            tracing::debug!(kind = ?self.kind, "thermistor sample dropped");
            state.thermistor.start_read(now);
            return true;
        }

        let raw = state.thermistor.value();
        let dt = match state.last_sample {
            Some(prev) => now.saturating_since(prev).as_secs_f64(),
            None => READ_INTERVAL.as_secs_f64(),
        };
        state.last_sample = Some(now);
        state.reading = false;

        let filtered = state.filter.feed(raw, dt);
        self.measured_mc
            .store((filtered * 1000.0) as i32, Ordering::Relaxed);
        let duty = state.pid.update(self.target(), filtered, dt);
        tracing::trace!(kind = ?self.kind, filtered, duty, "heater update");
        bus.set_pwm(self.heater_pin, duty as f32, self.pwm_period);
        false
    }
}
