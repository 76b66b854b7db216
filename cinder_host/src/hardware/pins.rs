//! The contract between the core and the platform's pin drivers.
//!
//! The core never touches registers or sysfs itself; it asks a `PinBus` to
//! realize levels and PWM duties. DMA pulse generation, pin muxing and
//! inversion at the header live behind this trait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cinder_shared::event::{Level, PinId};

pub trait PinBus: Send + Sync {
    fn write(&self, pin: PinId, level: Level);

    /// Latch a PWM target; the backend owns waveform generation.
    fn set_pwm(&self, pin: PinId, duty: f32, period: Duration);

    /// Sampled input level (endstops).
    fn read(&self, pin: PinId) -> Level;
}

/// Backend for machines without a platform driver loaded: every write is a
/// trace line, every input reads low.
#[derive(Debug, Default)]
pub struct NullPins;

impl PinBus for NullPins {
    fn write(&self, pin: PinId, level: Level) {
        tracing::trace!(pin, ?level, "pin write");
    }

    fn set_pwm(&self, pin: PinId, duty: f32, period: Duration) {
        tracing::trace!(pin, duty, ?period, "pin pwm");
    }

    fn read(&self, _pin: PinId) -> Level {
        Level::Low
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PinRecord {
    Write(PinId, Level),
    Pwm(PinId, f32, Duration),
}

/// Test backend: records every output in order and lets tests drive input
/// levels (endstops, simulated switches).
#[derive(Debug, Default)]
pub struct RecordingPins {
    records: Mutex<Vec<PinRecord>>,
    inputs: Mutex<HashMap<PinId, Level>>,
}

impl RecordingPins {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_input(&self, pin: PinId, level: Level) {
        self.inputs.lock().unwrap().insert(pin, level);
    }

    pub fn records(&self) -> Vec<PinRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn last_level(&self, pin: PinId) -> Option<Level> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|r| match r {
                PinRecord::Write(p, level) if *p == pin => Some(*level),
                _ => None,
            })
    }

    pub fn last_pwm(&self, pin: PinId) -> Option<f32> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|r| match r {
                PinRecord::Pwm(p, duty, _) if *p == pin => Some(*duty),
                _ => None,
            })
    }
}

impl PinBus for RecordingPins {
    fn write(&self, pin: PinId, level: Level) {
        self.records.lock().unwrap().push(PinRecord::Write(pin, level));
    }

    fn set_pwm(&self, pin: PinId, duty: f32, period: Duration) {
        self.records
            .lock()
            .unwrap()
            .push(PinRecord::Pwm(pin, duty, period));
    }

    fn read(&self, pin: PinId) -> Level {
        self.inputs
            .lock()
            .unwrap()
            .get(&pin)
            .copied()
            .unwrap_or(Level::Low)
    }
}

/// Scoped cleanup registered at boot: on drop, drives the listed pins to
/// their safe level and zeroes their PWM. Runs on clean exit and on the
/// emergency path before the nonzero process exit.
pub struct SafeTeardown {
    bus: Arc<dyn PinBus>,
    safe_low: Vec<PinId>,
    armed: AtomicBool,
}

impl SafeTeardown {
    pub fn new(bus: Arc<dyn PinBus>, safe_low: Vec<PinId>) -> Self {
        SafeTeardown {
            bus,
            safe_low,
            armed: AtomicBool::new(true),
        }
    }

    /// Run the teardown now instead of at drop.
    pub fn run(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            for &pin in &self.safe_low {
                self.bus.set_pwm(pin, 0.0, Duration::from_millis(100));
                self.bus.write(pin, Level::Low);
            }
            tracing::info!("drove {} output pins to safe levels", self.safe_low.len());
        }
    }
}

impl Drop for SafeTeardown {
    fn drop(&mut self) {
        self.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_pins_keep_order() {
        let pins = RecordingPins::new();
        pins.write(1, Level::High);
        pins.set_pwm(2, 0.5, Duration::from_millis(10));
        pins.write(1, Level::Low);
        assert_eq!(
            pins.records(),
            vec![
                PinRecord::Write(1, Level::High),
                PinRecord::Pwm(2, 0.5, Duration::from_millis(10)),
                PinRecord::Write(1, Level::Low),
            ]
        );
        assert_eq!(pins.last_level(1), Some(Level::Low));
        assert_eq!(pins.last_pwm(2), Some(0.5));
    }

    #[test]
    fn inputs_default_low() {
        let pins = RecordingPins::new();
        assert_eq!(pins.read(9), Level::Low);
        pins.set_input(9, Level::High);
        assert_eq!(pins.read(9), Level::High);
    }

    #[test]
    fn teardown_drives_pins_low_once() {
        let pins = RecordingPins::new();
        {
            let guard = SafeTeardown::new(pins.clone(), vec![4, 5]);
            guard.run();
            // drop fires again but the guard is disarmed
        }
        let lows = pins
            .records()
            .iter()
            .filter(|r| matches!(r, PinRecord::Write(_, Level::Low)))
            .count();
        assert_eq!(lows, 2);
        assert_eq!(pins.last_level(4), Some(Level::Low));
        assert_eq!(pins.last_level(5), Some(Level::Low));
    }
}
