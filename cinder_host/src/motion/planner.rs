//! Single-segment motion planner.
//!
//! Owns the axis stepper tuple and the authoritative mechanical position,
//! which advances by exactly one count per emitted step event. Moves run at
//! one constant velocity from zero to zero; homing streams steps until every
//! homing axis is cancelled by its endstop.

use cinder_shared::clock::TimePoint;
use cinder_shared::config::{Config, MachineKind};
use cinder_shared::event::Event;
use std::time::Duration;
use thiserror::Error;

use super::acceleration::AccelProfile;
use super::axis_stepper::{min_time_index, AxisStepper, DeltaStepper, LinearStepper};
use super::coord_map::{CoordMap, AXIS_COUNT, AXIS_E};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlannerError {
    #[error("planner is busy with a previous move")]
    Busy,
    #[error("target is outside the reachable volume")]
    UnreachableTarget,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PlannerState {
    Idle,
    Moving { duration: f64 },
    Homing,
}

/// Distances below this are treated as "no motion on these axes".
const MIN_TRAVEL_MM: f64 = 1e-9;

pub struct MotionPlanner {
    map: CoordMap,
    accel: AccelProfile,
    steppers: Vec<AxisStepper>,
    mech_pos: [i32; 4],
    start_time: TimePoint,
    state: PlannerState,
}

impl MotionPlanner {
    pub fn new(map: CoordMap, accel: AccelProfile) -> Self {
        let steppers = match map.kind() {
            MachineKind::Cartesian => (0..AXIS_COUNT)
                .map(|axis| AxisStepper::Linear(LinearStepper::new(axis, map.steps_per_mm(axis))))
                .collect(),
            MachineKind::Delta => (0..AXIS_COUNT)
                .map(|axis| {
                    if axis == AXIS_E {
                        AxisStepper::Linear(LinearStepper::new(axis, map.steps_per_mm(axis)))
                    } else {
                        AxisStepper::Delta(DeltaStepper::new(
                            axis,
                            map.tower(axis),
                            map.rod_length(),
                            map.steps_per_mm(axis),
                        ))
                    }
                })
                .collect(),
        };
        MotionPlanner {
            map,
            accel,
            steppers,
            mech_pos: [0; 4],
            start_time: TimePoint::ZERO,
            state: PlannerState::Idle,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        MotionPlanner::new(
            CoordMap::from_config(config),
            AccelProfile::Constant {
                max_accel: config.printer.max_accel,
            },
        )
    }

    /// True when the planner can accept another `move_to`/`home_endstops`.
    /// Callers additionally gate on scheduler buffer room.
    pub fn ready_for_next_move(&self) -> bool {
        self.state == PlannerState::Idle
    }

    pub fn is_homing(&self) -> bool {
        self.state == PlannerState::Homing
    }

    pub fn mechanical_position(&self) -> [i32; 4] {
        self.mech_pos
    }

    /// Current host-frame cartesian position derived from the mechanical
    /// truth.
    pub fn cartesian_position(&self) -> (f64, f64, f64, f64) {
        self.map.mechanical_to_cartesian(&self.mech_pos)
    }

    pub fn coord_map(&self) -> &CoordMap {
        &self.map
    }

    /// Axes that participate in a homing pass.
    pub fn homing_axes(&self) -> [bool; 4] {
        self.map.homing_axes()
    }

    /// Plan a linear move to absolute host coordinates (mm), starting at
    /// `start_time`. XYZ runs at `v_xyz` (shaped by the acceleration
    /// profile); the extruder rate is clamped into `[v_e_min, v_e_max]`.
    #[allow(clippy::too_many_arguments)]
    pub fn move_to(
        &mut self,
        start_time: TimePoint,
        x: f64,
        y: f64,
        z: f64,
        e: f64,
        v_xyz: f64,
        v_e_min: f64,
        v_e_max: f64,
    ) -> Result<(), PlannerError> {
        if self.state != PlannerState::Idle {
            return Err(PlannerError::Busy);
        }
        self.map
            .cartesian_to_mechanical(x, y, z, e)
            .ok_or(PlannerError::UnreachableTarget)?;

        let start_phys = self.map.physical_from_mechanical(&self.mech_pos);
        let target_phys = self.map.to_physical([x, y, z]);
        let delta = [
            target_phys[0] - start_phys[0],
            target_phys[1] - start_phys[1],
            target_phys[2] - start_phys[2],
        ];
        let distance = (delta[0] * delta[0] + delta[1] * delta[1] + delta[2] * delta[2]).sqrt();

        let e_start = self.mech_pos[AXIS_E] as f64 / self.map.steps_per_mm(AXIS_E);
        let de = e - e_start;

        let (velocity, ve, duration) = if distance > MIN_TRAVEL_MM {
            let v = self.accel.move_velocity(v_xyz, distance);
            let duration = distance / v;
            let scale = v / distance;
            let velocity = [delta[0] * scale, delta[1] * scale, delta[2] * scale];
            let ve = (de / duration).clamp(v_e_min, v_e_max);
            (velocity, ve, duration)
        } else if de.abs() > MIN_TRAVEL_MM {
            // extrude-only move: bounded by the extruder rate limits
            let ve = if de > 0.0 { v_e_max } else { v_e_min };
            let duration = de / ve;
            ([0.0; 3], ve, duration)
        } else {
            return Ok(()); // nothing to do
        };

        for stepper in &mut self.steppers {
            stepper.init(&self.mech_pos, &self.map, start_phys, velocity, ve);
        }
        self.start_time = start_time;
        self.state = PlannerState::Moving { duration };
        tracing::debug!(
            x, y, z, e, duration,
            "planned move at {:.3} mm/s",
            (velocity[0].powi(2) + velocity[1].powi(2) + velocity[2].powi(2)).sqrt()
        );
        Ok(())
    }

    /// Begin a homing pass on every endstop-equipped axis at `v_home`.
    /// Steps stream until each axis is cancelled via `cancel_axis_home`.
    pub fn home_endstops(&mut self, start_time: TimePoint, v_home: f64) -> Result<(), PlannerError> {
        if self.state != PlannerState::Idle {
            return Err(PlannerError::Busy);
        }
        let mask = self.map.homing_axes();
        for stepper in &mut self.steppers {
            if mask[stepper.axis()] {
                stepper.init_home(v_home);
            } else {
                stepper.clear();
            }
        }
        self.start_time = start_time;
        self.state = PlannerState::Homing;
        tracing::debug!(v_home, "homing to endstops");
        Ok(())
    }

    /// Stop issuing steps on a homing axis; its endstop has triggered.
    pub fn cancel_axis_home(&mut self, axis: usize) {
        if self.state == PlannerState::Homing {
            self.steppers[axis].clear();
        }
    }

    /// The next step event across all axes, or a Null event when the move
    /// is complete (the planner then returns to Idle).
    pub fn next_step(&mut self) -> Event {
        let duration = match self.state {
            PlannerState::Idle => return Event::null(),
            PlannerState::Moving { duration } => Some(duration),
            PlannerState::Homing => None,
        };

        let Some(index) = min_time_index(&self.steppers) else {
            self.finish();
            return Event::null();
        };
        let t = self.steppers[index].time();
        if let Some(duration) = duration {
            if t > duration + duration.abs() * 1e-9 + 1e-9 {
                self.finish();
                return Event::null();
            }
        }

        let direction = self.steppers[index].direction();
        let event = Event::step(
            self.start_time + Duration::from_nanos((t * 1e9) as u64),
            index,
            direction,
        );
        self.mech_pos[index] += direction.delta();
        self.steppers[index].advance();
        event
    }

    fn finish(&mut self) {
        if self.state == PlannerState::Homing {
            self.mech_pos = self.map.home_position(self.mech_pos[AXIS_E]);
        }
        self.state = PlannerState::Idle;
    }
}
