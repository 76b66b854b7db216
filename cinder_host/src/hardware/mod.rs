//! The machine's device set: steppers, endstops, fans and heater control
//! loops, held in one fixed-at-startup, index-addressable collection.

pub mod fan;
pub mod pins;
pub mod stepper;
pub mod temp_control;
pub mod thermistor;

use std::time::Duration;

use cinder_shared::clock::TimePoint;
use cinder_shared::config::{Config, MachineKind};
use cinder_shared::control::{LowPassFilter, Pid};
use cinder_shared::event::PinId;

pub use fan::FanDriver;
pub use pins::{NullPins, PinBus, PinRecord, RecordingPins, SafeTeardown};
pub use stepper::{Endstop, StepperDriver};
pub use temp_control::{HeaterKind, TempControl, DEFAULT_TEMP};
pub use thermistor::{SimProbe, SimThermistor, Thermistor};

/// One device. The variants differ in shape but expose overlapping
/// capability predicates; keeping them in a tagged union keeps the planner
/// → stepper hot path free of virtual dispatch.
pub enum IoDriver {
    Stepper(StepperDriver),
    Fan(FanDriver),
    TempControl(TempControl),
}

impl IoDriver {
    pub fn is_fan(&self) -> bool {
        matches!(self, IoDriver::Fan(_))
    }

    pub fn is_hotend(&self) -> bool {
        matches!(self, IoDriver::TempControl(t) if t.kind() == HeaterKind::Hotend)
    }

    pub fn is_heated_bed(&self) -> bool {
        matches!(self, IoDriver::TempControl(t) if t.kind() == HeaterKind::HeatedBed)
    }

    pub fn as_stepper(&self) -> Option<&StepperDriver> {
        match self {
            IoDriver::Stepper(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_temp_control(&self) -> Option<&TempControl> {
        match self {
            IoDriver::TempControl(t) => Some(t),
            _ => None,
        }
    }
}

/// Fallback pin map used when a stepper section is absent from the config,
/// matching the reference Kossel wiring: (step, dir) per axis, one shared
/// enable line, endstops on the three towers.
const DEFAULT_STEP_DIR: [(u32, u32); 4] = [(22, 23), (19, 21), (24, 26), (3, 5)];
const DEFAULT_ENABLE: u32 = 16;
const DEFAULT_ENDSTOPS: [u32; 3] = [18, 28, 15];

pub struct IoDrivers {
    drivers: Vec<IoDriver>,
}

impl IoDrivers {
    pub fn new(drivers: Vec<IoDriver>) -> Self {
        IoDrivers { drivers }
    }

    /// Assemble the device set for the configured machine. Thermistors are
    /// simulated unless a platform probe driver replaces them.
    pub fn from_config(config: &Config) -> Self {
        let axis_names = match config.printer.kinematics {
            MachineKind::Cartesian => ["x", "y", "z", "e"],
            MachineKind::Delta => ["a", "b", "c", "e"],
        };
        let pulse_width = Duration::from_micros(config.scheduler.pulse_width_us);
        let mut drivers = Vec::new();

        for (axis, name) in axis_names.iter().enumerate() {
            let (step_pin, dir_pin, enable_pin, endstop) = match config.steppers.get(*name) {
                Some(s) => (
                    s.step_pin,
                    s.dir_pin,
                    s.enable_pin,
                    s.endstop_pin
                        .map(|pin| Endstop::new(pin, s.endstop_inverted)),
                ),
                None => {
                    let (step, dir) = DEFAULT_STEP_DIR[axis];
                    let endstop = DEFAULT_ENDSTOPS
                        .get(axis)
                        .map(|&pin| Endstop::new(pin, false));
                    (step, dir, DEFAULT_ENABLE, endstop)
                }
            };
            drivers.push(IoDriver::Stepper(StepperDriver::new(
                axis, step_pin, dir_pin, enable_pin, pulse_width, endstop,
            )));
        }

        if let Some(fan) = &config.fan {
            drivers.push(IoDriver::Fan(FanDriver::new(
                fan.pin,
                Duration::from_millis(fan.pwm_period_ms),
            )));
        }

        for (kind, heater) in [
            (HeaterKind::Hotend, &config.hotend),
            (HeaterKind::HeatedBed, &config.heater_bed),
        ] {
            if let Some(heater) = heater {
                let probe = SimProbe::new(20.0);
                let thermistor =
                    SimThermistor::new(probe, Duration::from_millis(10), 0.25);
                drivers.push(IoDriver::TempControl(TempControl::new(
                    kind,
                    heater.heater_pin,
                    Duration::from_millis(heater.pwm_period_ms),
                    Box::new(thermistor),
                    Pid::new(heater.pid.kp, heater.pid.ki, heater.pid.kd),
                    LowPassFilter::new(heater.filter_time_s),
                )));
            }
        }

        IoDrivers::new(drivers)
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&IoDriver> {
        self.drivers.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &IoDriver> {
        self.drivers.iter()
    }

    /// The stepper driving mechanical axis `axis`.
    pub fn stepper_for_axis(&self, axis: usize) -> Option<&StepperDriver> {
        self.drivers
            .iter()
            .filter_map(IoDriver::as_stepper)
            .find(|s| s.axis() == axis)
    }

    pub fn endstop_for_axis(&self, axis: usize) -> Option<&Endstop> {
        self.stepper_for_axis(axis).and_then(StepperDriver::endstop)
    }

    pub fn lock_all(&self, bus: &dyn PinBus) {
        for stepper in self.drivers.iter().filter_map(IoDriver::as_stepper) {
            stepper.lock(bus);
        }
    }

    pub fn unlock_all(&self, bus: &dyn PinBus) {
        for stepper in self.drivers.iter().filter_map(IoDriver::as_stepper) {
            stepper.unlock(bus);
        }
    }

    pub fn hotend(&self) -> Option<&TempControl> {
        self.drivers
            .iter()
            .find(|d| d.is_hotend())
            .and_then(IoDriver::as_temp_control)
    }

    pub fn heated_bed(&self) -> Option<&TempControl> {
        self.drivers
            .iter()
            .find(|d| d.is_heated_bed())
            .and_then(IoDriver::as_temp_control)
    }

    /// Latch `rate` onto every fan.
    pub fn set_fan_rate(&self, rate: f32, bus: &dyn PinBus) {
        for driver in &self.drivers {
            if let IoDriver::Fan(fan) = driver {
                fan.set_duty(rate, bus);
            }
        }
    }

    /// Idle-hook fan-out: service every temperature control loop. True when
    /// any loop wants more CPU before the next scheduled event.
    pub fn on_idle_cpu(&self, now: TimePoint, bus: &dyn PinBus) -> bool {
        let mut wants_more = false;
        for driver in &self.drivers {
            if let IoDriver::TempControl(control) = driver {
                wants_more |= control.on_idle_cpu(now, bus);
            }
        }
        wants_more
    }

    /// Outputs the teardown guard must drive to a safe level: heaters,
    /// fans, stepper enables.
    pub fn safe_teardown_pins(&self) -> Vec<PinId> {
        let mut pins = Vec::new();
        for driver in &self.drivers {
            match driver {
                IoDriver::Stepper(s) => pins.push(s.enable_pin()),
                IoDriver::Fan(f) => pins.push(f.pin()),
                IoDriver::TempControl(t) => pins.push(t.heater_pin()),
            }
        }
        pins.sort_unstable();
        pins.dedup();
        pins
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_shared::config::{FanConfig, HeaterConfig, PidGains};

    fn full_config() -> Config {
        let mut config = Config::default();
        config.fan = Some(FanConfig {
            pin: 8,
            pwm_period_ms: 25,
        });
        config.hotend = Some(HeaterConfig {
            heater_pin: 10,
            pwm_period_ms: 100,
            pid: PidGains::default(),
            filter_time_s: 3.0,
        });
        config
    }

    #[test]
    fn builds_kossel_defaults() {
        let drivers = IoDrivers::from_config(&full_config());
        // 4 steppers + fan + hotend
        assert_eq!(drivers.len(), 6);
        assert!(drivers.stepper_for_axis(0).is_some());
        assert!(drivers.stepper_for_axis(3).is_some());
        assert!(drivers.endstop_for_axis(0).is_some());
        assert!(drivers.endstop_for_axis(3).is_none(), "extruder has no endstop");
        assert!(drivers.hotend().is_some());
        assert!(drivers.heated_bed().is_none());
    }

    #[test]
    fn capability_predicates_match_variants() {
        let drivers = IoDrivers::from_config(&full_config());
        let fans = drivers.iter().filter(|d| d.is_fan()).count();
        let hotends = drivers.iter().filter(|d| d.is_hotend()).count();
        assert_eq!(fans, 1);
        assert_eq!(hotends, 1);
    }

    #[test]
    fn lock_all_touches_every_enable_pin() {
        let drivers = IoDrivers::from_config(&full_config());
        let pins = RecordingPins::new();
        drivers.lock_all(pins.as_ref());
        // shared enable line: one pin, four writes
        let writes = pins.records().len();
        assert_eq!(writes, 4);
        assert_eq!(pins.last_level(DEFAULT_ENABLE), Some(cinder_shared::event::Level::High));
    }

    #[test]
    fn teardown_pins_cover_heaters_and_enables() {
        let drivers = IoDrivers::from_config(&full_config());
        let pins = drivers.safe_teardown_pins();
        assert!(pins.contains(&DEFAULT_ENABLE));
        assert!(pins.contains(&8));
        assert!(pins.contains(&10));
    }
}
