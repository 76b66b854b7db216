//! Step/dir stepper driver (A4988/DRV8825 class) and its optional endstop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cinder_shared::event::{Event, Level, PinId, StepDirection};

use super::pins::PinBus;

/// Endstop switch tied to one mechanical axis. Polled by the producer
/// during homing.
#[derive(Debug, Clone)]
pub struct Endstop {
    pin: PinId,
    inverted: bool,
}

impl Endstop {
    pub fn new(pin: PinId, inverted: bool) -> Self {
        Endstop { pin, inverted }
    }

    pub fn is_triggered(&self, bus: &dyn PinBus) -> bool {
        let level = bus.read(self.pin);
        match (level, self.inverted) {
            (Level::High, false) | (Level::Low, true) => true,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct StepperDriver {
    axis: usize,
    step_pin: PinId,
    dir_pin: PinId,
    enable_pin: PinId,
    /// Step line high time.
    pulse_width: Duration,
    endstop: Option<Endstop>,
    locked: AtomicBool,
}

impl StepperDriver {
    pub fn new(
        axis: usize,
        step_pin: PinId,
        dir_pin: PinId,
        enable_pin: PinId,
        pulse_width: Duration,
        endstop: Option<Endstop>,
    ) -> Self {
        StepperDriver {
            axis,
            step_pin,
            dir_pin,
            enable_pin,
            pulse_width,
            endstop,
            locked: AtomicBool::new(false),
        }
    }

    pub fn axis(&self) -> usize {
        self.axis
    }

    pub fn endstop(&self) -> Option<&Endstop> {
        self.endstop.as_ref()
    }

    pub fn enable_pin(&self) -> PinId {
        self.enable_pin
    }

    /// Energize the coils so the axis holds position.
    pub fn lock(&self, bus: &dyn PinBus) {
        self.locked.store(true, Ordering::Relaxed);
        bus.write(self.enable_pin, Level::High);
    }

    /// Release the coils; the axis moves freely.
    pub fn unlock(&self, bus: &dyn PinBus) {
        self.locked.store(false, Ordering::Relaxed);
        bus.write(self.enable_pin, Level::Low);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Translate one planner step event into the concrete pin edge
    /// sequence: direction setup, then the step pulse high and low. The
    /// driver IC latches direction on the step edge, so the dir write
    /// shares the step timestamp and is queued first.
    pub fn step_events(&self, step: &Event) -> [Event; 3] {
        let direction = step
            .direction()
            .expect("step event must carry a direction level");
        let dir_level: Level = direction.into();
        [
            Event::edge(step.time, self.dir_pin, dir_level),
            Event::edge(step.time, self.step_pin, Level::High),
            Event::edge(step.time + self.pulse_width, self.step_pin, Level::Low),
        ]
    }

    /// Immediate single step, outside the scheduler. Used by maintenance
    /// paths, never by the motion pipeline.
    pub fn step_forward(&self, bus: &dyn PinBus) {
        self.step_once(bus, StepDirection::Forward);
    }

    pub fn step_backward(&self, bus: &dyn PinBus) {
        self.step_once(bus, StepDirection::Backward);
    }

    fn step_once(&self, bus: &dyn PinBus, direction: StepDirection) {
        bus.write(self.dir_pin, direction.into());
        bus.write(self.step_pin, Level::High);
        std::thread::sleep(self.pulse_width);
        bus.write(self.step_pin, Level::Low);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::pins::RecordingPins;
    use cinder_shared::clock::TimePoint;

    fn driver() -> StepperDriver {
        StepperDriver::new(0, 10, 11, 12, Duration::from_micros(2), Some(Endstop::new(13, false)))
    }

    #[test]
    fn step_event_translation_orders_edges() {
        let d = driver();
        let step = Event::step(TimePoint::from_secs_f64(0.5), 0, StepDirection::Forward);
        let out = d.step_events(&step);
        assert_eq!(out[0].pin, 11);
        assert_eq!(out[1].pin, 10);
        assert_eq!(out[2].pin, 10);
        assert_eq!(out[1].action, cinder_shared::event::PinAction::Level(Level::High));
        assert_eq!(out[2].action, cinder_shared::event::PinAction::Level(Level::Low));
        assert!(out[0].time <= out[1].time && out[1].time < out[2].time);
        assert_eq!((out[2].time - out[1].time) as u64, 2_000);
    }

    #[test]
    fn backward_step_sets_dir_low() {
        let d = driver();
        let step = Event::step(TimePoint::ZERO, 0, StepDirection::Backward);
        let out = d.step_events(&step);
        assert_eq!(out[0].action, cinder_shared::event::PinAction::Level(Level::Low));
    }

    #[test]
    fn lock_and_unlock_drive_enable_pin() {
        let pins = RecordingPins::new();
        let d = driver();
        d.lock(pins.as_ref());
        assert!(d.is_locked());
        assert_eq!(pins.last_level(12), Some(Level::High));
        d.unlock(pins.as_ref());
        assert!(!d.is_locked());
        assert_eq!(pins.last_level(12), Some(Level::Low));
    }

    #[test]
    fn endstop_honors_inversion() {
        let pins = RecordingPins::new();
        let normal = Endstop::new(5, false);
        let inverted = Endstop::new(5, true);
        assert!(!normal.is_triggered(pins.as_ref()));
        assert!(inverted.is_triggered(pins.as_ref()));
        pins.set_input(5, Level::High);
        assert!(normal.is_triggered(pins.as_ref()));
        assert!(!inverted.is_triggered(pins.as_ref()));
    }
}
