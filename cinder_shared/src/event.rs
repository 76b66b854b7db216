//! Timestamped output events dispatched by the scheduler.

use std::cmp::Ordering;
use std::time::Duration;

use crate::clock::TimePoint;

/// Logical output pin number. The mapping to a physical header pin belongs
/// to the platform pin driver.
pub type PinId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn inverted(self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

/// Direction of a single motor step. Rides on an event as a pin level:
/// `Forward` == `High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDirection {
    Backward,
    Forward,
}

impl StepDirection {
    pub fn delta(self) -> i32 {
        match self {
            StepDirection::Forward => 1,
            StepDirection::Backward => -1,
        }
    }
}

impl From<StepDirection> for Level {
    fn from(dir: StepDirection) -> Level {
        match dir {
            StepDirection::Forward => Level::High,
            StepDirection::Backward => Level::Low,
        }
    }
}

impl From<Level> for StepDirection {
    fn from(level: Level) -> StepDirection {
        match level {
            Level::High => StepDirection::Forward,
            Level::Low => StepDirection::Backward,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PinAction {
    Level(Level),
    Pwm { duty: f32, period: Duration },
    /// Sentinel: no more steps in this move.
    Null,
}

/// Immutable (time, pin, action) value. Ordering compares `time` only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    pub time: TimePoint,
    pub pin: PinId,
    pub action: PinAction,
}

impl Event {
    pub fn edge(time: TimePoint, pin: PinId, level: Level) -> Self {
        Event {
            time,
            pin,
            action: PinAction::Level(level),
        }
    }

    pub fn pwm(time: TimePoint, pin: PinId, duty: f32, period: Duration) -> Self {
        Event {
            time,
            pin,
            action: PinAction::Pwm {
                duty: duty.clamp(0.0, 1.0),
                period,
            },
        }
    }

    /// A planner step event: `pin` carries the mechanical axis index and the
    /// level carries the direction.
    pub fn step(time: TimePoint, axis: usize, direction: StepDirection) -> Self {
        Event::edge(time, axis as PinId, direction.into())
    }

    pub fn null() -> Self {
        Event {
            time: TimePoint::ZERO,
            pin: 0,
            action: PinAction::Null,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.action, PinAction::Null)
    }

    pub fn direction(&self) -> Option<StepDirection> {
        match self.action {
            PinAction::Level(level) => Some(level.into()),
            _ => None,
        }
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.time.cmp(&other.time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_event_is_null() {
        assert!(Event::null().is_null());
        assert!(!Event::edge(TimePoint::ZERO, 3, Level::High).is_null());
    }

    #[test]
    fn ordering_is_by_time_only() {
        let a = Event::edge(TimePoint::from_nanos(10), 9, Level::Low);
        let b = Event::pwm(TimePoint::from_nanos(20), 1, 0.5, Duration::from_millis(10));
        assert!(a < b);
    }

    #[test]
    fn pwm_duty_is_clamped() {
        let e = Event::pwm(TimePoint::ZERO, 0, 1.5, Duration::from_millis(1));
        match e.action {
            PinAction::Pwm { duty, .. } => assert_eq!(duty, 1.0),
            _ => panic!("expected pwm action"),
        }
    }

    #[test]
    fn step_event_round_trips_direction() {
        let e = Event::step(TimePoint::ZERO, 2, StepDirection::Backward);
        assert_eq!(e.pin, 2);
        assert_eq!(e.direction(), Some(StepDirection::Backward));
    }
}
