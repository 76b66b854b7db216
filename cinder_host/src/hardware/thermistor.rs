//! Thermistor read contract.
//!
//! Reads are asynchronous at the hardware level (an RC charge/discharge
//! timed by the platform driver), so the contract is a tiny state machine:
//! start a read, poll until ready, take the value. ADC conversion and the
//! Steinhart-Hart math belong to the platform driver behind this trait.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cinder_shared::clock::TimePoint;

pub trait Thermistor: Send {
    fn start_read(&mut self, now: TimePoint);

    /// True once a started read has a value available.
    fn is_ready(&mut self, now: TimePoint) -> bool;

    /// Time since `start_read`, for the read-timeout check.
    fn time_since_start(&self, now: TimePoint) -> Duration;

    /// Last completed reading, °C.
    fn value(&self) -> f64;
}

/// Shared knob for driving a simulated thermistor from a test while the
/// dispatch thread polls it.
#[derive(Debug, Default)]
pub struct SimProbe {
    millicelsius: AtomicU32,
}

impl SimProbe {
    pub fn new(celsius: f64) -> Arc<Self> {
        let probe = Arc::new(SimProbe::default());
        probe.set(celsius);
        probe
    }

    pub fn set(&self, celsius: f64) {
        self.millicelsius
            .store((celsius * 1000.0) as u32, Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        self.millicelsius.load(Ordering::Relaxed) as f64 / 1000.0
    }
}

/// Simulated thermistor: completes a read after a fixed conversion time and
/// reports the probe temperature plus optional sensor noise.
pub struct SimThermistor {
    probe: Arc<SimProbe>,
    conversion_time: Duration,
    noise: f64,
    started: Option<TimePoint>,
    last_value: f64,
}

impl SimThermistor {
    pub fn new(probe: Arc<SimProbe>, conversion_time: Duration, noise: f64) -> Self {
        SimThermistor {
            probe,
            conversion_time,
            noise,
            started: None,
            last_value: 0.0,
        }
    }
}

impl Thermistor for SimThermistor {
    fn start_read(&mut self, now: TimePoint) {
        self.started = Some(now);
    }

    fn is_ready(&mut self, now: TimePoint) -> bool {
        let Some(started) = self.started else {
            return false;
        };
        if now.saturating_since(started) < self.conversion_time {
            return false;
        }
        let jitter = if self.noise > 0.0 {
            self.noise * (rand::random::<f64>() - 0.5)
        } else {
            0.0
        };
        self.last_value = self.probe.get() + jitter;
        self.started = None;
        true
    }

    fn time_since_start(&self, now: TimePoint) -> Duration {
        match self.started {
            Some(started) => now.saturating_since(started),
            None => Duration::ZERO,
        }
    }

    fn value(&self) -> f64 {
        self.last_value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_completes_after_conversion_time() {
        let probe = SimProbe::new(21.5);
        let mut therm = SimThermistor::new(probe, Duration::from_millis(5), 0.0);
        let t0 = TimePoint::ZERO;
        therm.start_read(t0);
        assert!(!therm.is_ready(t0 + Duration::from_millis(1)));
        assert!(therm.is_ready(t0 + Duration::from_millis(5)));
        assert!((therm.value() - 21.5).abs() < 1e-9);
    }

    #[test]
    fn probe_updates_are_visible_on_next_read() {
        let probe = SimProbe::new(20.0);
        let mut therm = SimThermistor::new(probe.clone(), Duration::ZERO, 0.0);
        therm.start_read(TimePoint::ZERO);
        assert!(therm.is_ready(TimePoint::ZERO));
        probe.set(180.0);
        therm.start_read(TimePoint::ZERO);
        assert!(therm.is_ready(TimePoint::ZERO));
        assert!((therm.value() - 180.0).abs() < 1e-9);
    }

    #[test]
    fn noise_stays_bounded() {
        let probe = SimProbe::new(100.0);
        let mut therm = SimThermistor::new(probe, Duration::ZERO, 2.0);
        for _ in 0..50 {
            therm.start_read(TimePoint::ZERO);
            assert!(therm.is_ready(TimePoint::ZERO));
            assert!((therm.value() - 100.0).abs() <= 1.0);
        }
    }
}
