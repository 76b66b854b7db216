//! Per-mechanical-axis step-time generators.
//!
//! Each stepper answers one question: given a constant cartesian velocity,
//! when does this motor step next, and in which direction? Times are f64
//! seconds from the start of the move; NaN or a non-positive value means
//! "no further step on this path". The planner drains the tuple by always
//! taking the smallest finite positive time.

use cinder_shared::event::StepDirection;

use super::coord_map::{CoordMap, AXIS_E};

/// Exhausted-axis sentinel.
const NO_STEP: f64 = f64::NAN;

/// Root search must advance strictly past the step just taken.
const TIME_EPS: f64 = 1e-9;

fn is_live(time: f64) -> bool {
    time.is_finite() && time > 0.0
}

/// A mechanical axis whose step rate is directly proportional to one
/// cartesian velocity component: X/Y/Z of a cartesian machine, and the
/// extruder on every machine.
#[derive(Debug, Clone)]
pub struct LinearStepper {
    axis: usize,
    steps_per_mm: f64,
    period: f64,
    time: f64,
    direction: StepDirection,
}

impl LinearStepper {
    pub fn new(axis: usize, steps_per_mm: f64) -> Self {
        LinearStepper {
            axis,
            steps_per_mm,
            period: f64::INFINITY,
            time: NO_STEP,
            direction: StepDirection::Forward,
        }
    }

    fn init(&mut self, velocity: f64) {
        self.direction = if velocity >= 0.0 {
            StepDirection::Forward
        } else {
            StepDirection::Backward
        };
        // zero velocity → infinite period → the axis simply never wins
        self.period = 1.0 / (self.steps_per_mm * velocity.abs());
        self.time = self.period;
    }

    fn init_home(&mut self, v_home: f64) {
        self.direction = StepDirection::Backward;
        self.period = 1.0 / (self.steps_per_mm * v_home.abs());
        self.time = self.period;
    }

    fn advance(&mut self) {
        self.time += self.period;
    }
}

/// One tower of a linear delta. The carriage height h for effector
/// (x, y, z) satisfies (x−ax)² + (y−ay)² + (h−z)² = L²; with the effector
/// moving linearly in t, the next step lands at the smaller positive root
/// of the quadratic obtained by pinning h to the neighboring step multiple.
#[derive(Debug, Clone)]
pub struct DeltaStepper {
    axis: usize,
    tower: [f64; 2],
    rod_length2: f64,
    steps_per_mm: f64,

    // per-move trajectory, physical frame
    start: [f64; 3],
    velocity: [f64; 3],
    /// Current carriage height, mm.
    height: f64,
    /// Homing runs an open-ended constant-rate climb instead of the
    /// quadratic; the endstop cancels it.
    home_period: Option<f64>,

    time: f64,
    direction: StepDirection,
}

impl DeltaStepper {
    pub fn new(axis: usize, tower: [f64; 2], rod_length: f64, steps_per_mm: f64) -> Self {
        DeltaStepper {
            axis,
            tower,
            rod_length2: rod_length * rod_length,
            steps_per_mm,
            start: [0.0; 3],
            velocity: [0.0; 3],
            height: 0.0,
            home_period: None,
            time: NO_STEP,
            direction: StepDirection::Forward,
        }
    }

    fn init(&mut self, height: f64, start: [f64; 3], velocity: [f64; 3]) {
        self.start = start;
        self.velocity = velocity;
        self.height = height;
        self.home_period = None;
        self.seek_next(0.0);
    }

    fn init_home(&mut self, v_home: f64) {
        let period = 1.0 / (self.steps_per_mm * v_home.abs());
        self.home_period = Some(period);
        self.direction = StepDirection::Forward;
        self.time = period;
    }

    fn advance(&mut self) {
        if let Some(period) = self.home_period {
            self.time += period;
            return;
        }
        self.height += self.direction.delta() as f64 / self.steps_per_mm;
        self.seek_next(self.time);
    }

    /// Find the earliest time after `after` at which the carriage crosses
    /// the next step multiple in either direction.
    fn seek_next(&mut self, after: f64) {
        let step = 1.0 / self.steps_per_mm;
        let t_up = self.crossing_time(self.height + step, after);
        let t_down = self.crossing_time(self.height - step, after);
        match (is_live(t_up), is_live(t_down)) {
            (true, true) => {
                if t_up <= t_down {
                    self.time = t_up;
                    self.direction = StepDirection::Forward;
                } else {
                    self.time = t_down;
                    self.direction = StepDirection::Backward;
                }
            }
            (true, false) => {
                self.time = t_up;
                self.direction = StepDirection::Forward;
            }
            (false, true) => {
                self.time = t_down;
                self.direction = StepDirection::Backward;
            }
            (false, false) => self.time = NO_STEP,
        }
    }

    /// Smallest root greater than `after` of
    /// (x(t)−ax)² + (y(t)−ay)² + (target−z(t))² = L², or NaN.
    fn crossing_time(&self, target_height: f64, after: f64) -> f64 {
        let dx = self.start[0] - self.tower[0];
        let dy = self.start[1] - self.tower[1];
        let dz = target_height - self.start[2];
        let [vx, vy, vz] = self.velocity;

        let a = vx * vx + vy * vy + vz * vz;
        let b = 2.0 * (dx * vx + dy * vy - dz * vz);
        let c = dx * dx + dy * dy + dz * dz - self.rod_length2;

        if a.abs() < 1e-18 {
            if b.abs() < 1e-18 {
                return NO_STEP;
            }
            let t = -c / b;
            return if t > after + TIME_EPS { t } else { NO_STEP };
        }

        let disc = b * b - 4.0 * a * c;
        if disc < 0.0 {
            return NO_STEP;
        }
        let sq = disc.sqrt();
        let lo = (-b - sq) / (2.0 * a);
        let hi = (-b + sq) / (2.0 * a);
        if lo > after + TIME_EPS {
            lo
        } else if hi > after + TIME_EPS {
            hi
        } else {
            NO_STEP
        }
    }
}

/// The per-axis generator variants, dispatched as a tagged union so the
/// planner's hot path stays inlinable.
#[derive(Debug, Clone)]
pub enum AxisStepper {
    Linear(LinearStepper),
    Delta(DeltaStepper),
}

impl AxisStepper {
    pub fn axis(&self) -> usize {
        match self {
            AxisStepper::Linear(s) => s.axis,
            AxisStepper::Delta(s) => s.axis,
        }
    }

    /// Absolute (move-relative) time of the next step, or the sentinel.
    pub fn time(&self) -> f64 {
        match self {
            AxisStepper::Linear(s) => s.time,
            AxisStepper::Delta(s) => s.time,
        }
    }

    pub fn direction(&self) -> StepDirection {
        match self {
            AxisStepper::Linear(s) => s.direction,
            AxisStepper::Delta(s) => s.direction,
        }
    }

    /// Prepare for a linear move at constant cartesian velocity, starting
    /// from the given mechanical position. `velocity` is the physical-frame
    /// (vx, vy, vz); `ve` is the extruder rate in mm/s.
    pub fn init(
        &mut self,
        mech: &[i32; 4],
        map: &CoordMap,
        start_physical: [f64; 3],
        velocity: [f64; 3],
        ve: f64,
    ) {
        match self {
            AxisStepper::Linear(s) => {
                let v = if s.axis == AXIS_E {
                    ve
                } else {
                    velocity[s.axis]
                };
                let _ = (mech, map);
                s.init(v);
            }
            AxisStepper::Delta(s) => {
                let height = mech[s.axis] as f64 / s.steps_per_mm;
                s.init(height, start_physical, velocity);
            }
        }
    }

    /// Prepare for a homing pass toward the endstop at `v_home`.
    pub fn init_home(&mut self, v_home: f64) {
        match self {
            AxisStepper::Linear(s) => s.init_home(v_home),
            AxisStepper::Delta(s) => s.init_home(v_home),
        }
    }

    /// Compute the step after the current one.
    pub fn advance(&mut self) {
        match self {
            AxisStepper::Linear(s) => s.advance(),
            AxisStepper::Delta(s) => s.advance(),
        }
    }

    /// Force the exhausted sentinel (endstop hit, axis not homing, …).
    pub fn clear(&mut self) {
        match self {
            AxisStepper::Linear(s) => s.time = NO_STEP,
            AxisStepper::Delta(s) => s.time = NO_STEP,
        }
    }
}

/// The stepper with the smallest finite positive time; NaN and non-positive
/// times count as +∞. Ties break to the lower axis index.
pub fn min_time_index(steppers: &[AxisStepper]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, stepper) in steppers.iter().enumerate() {
        let t = stepper.time();
        if !is_live(t) {
            continue;
        }
        match best {
            Some((_, bt)) if bt <= t => {}
            _ => best = Some((i, t)),
        }
    }
    best.map(|(i, _)| i)
}
