//! Part-cooling fan: a PWM output with a per-device period.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use cinder_shared::event::PinId;

use super::pins::PinBus;

#[derive(Debug)]
pub struct FanDriver {
    pin: PinId,
    pwm_period: Duration,
    duty_bits: AtomicU32,
}

impl FanDriver {
    pub fn new(pin: PinId, pwm_period: Duration) -> Self {
        FanDriver {
            pin,
            pwm_period,
            duty_bits: AtomicU32::new(0f32.to_bits()),
        }
    }

    pub fn pin(&self) -> PinId {
        self.pin
    }

    pub fn pwm_period(&self) -> Duration {
        self.pwm_period
    }

    pub fn duty(&self) -> f32 {
        f32::from_bits(self.duty_bits.load(Ordering::Relaxed))
    }

    /// Latch a new duty cycle in [0, 1] onto the fan pin.
    pub fn set_duty(&self, duty: f32, bus: &dyn PinBus) {
        let duty = duty.clamp(0.0, 1.0);
        self.duty_bits.store(duty.to_bits(), Ordering::Relaxed);
        bus.set_pwm(self.pin, duty, self.pwm_period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::pins::RecordingPins;

    #[test]
    fn duty_is_latched_and_clamped() {
        let pins = RecordingPins::new();
        let fan = FanDriver::new(6, Duration::from_millis(25));
        fan.set_duty(0.4, pins.as_ref());
        assert_eq!(fan.duty(), 0.4);
        assert_eq!(pins.last_pwm(6), Some(0.4));
        fan.set_duty(7.0, pins.as_ref());
        assert_eq!(fan.duty(), 1.0);
    }
}
