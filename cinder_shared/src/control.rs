//! Closed-loop control primitives: a clamped PID and a single-pole low-pass
//! filter. Both are allocation-free and safe to run from the dispatch
//! thread's idle hook.

/// PID controller with output and anti-windup clamping. Output is a
/// normalized duty in `[out_min, out_max]`.
#[derive(Debug, Clone)]
pub struct Pid {
    kp: f64,
    ki: f64,
    kd: f64,

    integral: f64,
    prev_measurement: f64,

    out_min: f64,
    out_max: f64,

    first_update: bool,
}

impl Pid {
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            integral: 0.0,
            prev_measurement: 0.0,
            out_min: 0.0,
            out_max: 1.0,
            first_update: true,
        }
    }

    pub fn with_output_limits(mut self, min: f64, max: f64) -> Self {
        self.out_min = min;
        self.out_max = max;
        self
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_measurement = 0.0;
        self.first_update = true;
    }

    /// Feed one sample. `dt` is the time since the previous sample, seconds.
    ///
    /// The derivative acts on the measurement rather than the error, so a
    /// setpoint change does not kick the output.
    pub fn update(&mut self, setpoint: f64, measurement: f64, dt: f64) -> f64 {
        let error = setpoint - measurement;

        let p = self.kp * error;

        self.integral += self.ki * error * dt;
        self.integral = self.integral.clamp(self.out_min, self.out_max);
        let i = self.integral;

        let d = if self.first_update {
            self.first_update = false;
            0.0
        } else if dt > 0.0 {
            self.kd * (self.prev_measurement - measurement) / dt
        } else {
            0.0
        };
        self.prev_measurement = measurement;

        (p + i + d).clamp(self.out_min, self.out_max)
    }

    /// The accumulated integral term; at zero error the output settles here.
    pub fn integral(&self) -> f64 {
        self.integral
    }
}

/// Single-pole IIR low-pass: `y += (x - y) * dt / (rc + dt)`.
#[derive(Debug, Clone)]
pub struct LowPassFilter {
    rc: f64,
    value: Option<f64>,
}

impl LowPassFilter {
    pub fn new(time_constant_s: f64) -> Self {
        Self {
            rc: time_constant_s.max(0.0),
            value: None,
        }
    }

    /// Feed one sample taken `dt` seconds after the previous one. The first
    /// sample passes through unchanged.
    pub fn feed(&mut self, sample: f64, dt: f64) -> f64 {
        let filtered = match self.value {
            None => sample,
            Some(_) if self.rc == 0.0 => sample,
            Some(prev) => prev + (sample - prev) * dt / (self.rc + dt),
        };
        self.value = Some(filtered);
        filtered
    }

    pub fn reset(&mut self) {
        self.value = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_error_output_is_integral_only() {
        let mut pid = Pid::new(0.5, 0.1, 0.05);
        // build up some integral with a constant error
        for _ in 0..10 {
            pid.update(100.0, 90.0, 1.0);
        }
        let integral = pid.integral();
        assert!(integral > 0.0);
        // then hold at the setpoint; D term decays after one sample
        pid.update(100.0, 100.0, 1.0);
        let out = pid.update(100.0, 100.0, 1.0);
        assert!((out - pid.integral()).abs() < 1e-12);
        assert!((pid.integral() - integral).abs() < 1e-12);
    }

    #[test]
    fn output_is_clamped() {
        let mut pid = Pid::new(10.0, 0.0, 0.0);
        assert_eq!(pid.update(100.0, 0.0, 1.0), 1.0);
        assert_eq!(pid.update(0.0, 100.0, 1.0), 0.0);
    }

    #[test]
    fn integral_does_not_wind_up() {
        let mut pid = Pid::new(0.0, 1.0, 0.0);
        for _ in 0..100 {
            pid.update(100.0, 0.0, 1.0);
        }
        // clamped at out_max, so recovery is immediate once error flips
        assert!(pid.integral() <= 1.0);
    }

    #[test]
    fn low_pass_first_sample_passes_through() {
        let mut filter = LowPassFilter::new(3.0);
        assert_eq!(filter.feed(42.0, 1.0), 42.0);
    }

    #[test]
    fn low_pass_smooths_toward_input() {
        let mut filter = LowPassFilter::new(1.0);
        filter.feed(0.0, 1.0);
        let a = filter.feed(10.0, 1.0);
        let b = filter.feed(10.0, 1.0);
        assert!(a > 0.0 && a < 10.0);
        assert!(b > a && b < 10.0);
    }
}
