//! Motion pipeline: coordinate transforms, per-axis step generation,
//! velocity shaping and the single-segment planner.

pub mod acceleration;
pub mod axis_stepper;
pub mod coord_map;
pub mod planner;

pub use acceleration::AccelProfile;
pub use axis_stepper::{min_time_index, AxisStepper};
pub use coord_map::{CoordMap, AXIS_COUNT, AXIS_E};
pub use planner::{MotionPlanner, PlannerError};
