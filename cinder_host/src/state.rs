//! G/M-code interpretation and the producer loop.
//!
//! `State` owns the host-visible position model (primitives, host zero,
//! unit and position modes), the command-source stack, and the motion
//! planner. Its `run` loop is the producer thread: poll the sources,
//! interpret commands, and pump planner steps through the stepper drivers
//! into the scheduler queue.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cinder_shared::clock::{Clock, TimePoint};
use cinder_shared::config::Config;
use cinder_shared::event::Event;

use crate::gcode::source::{CommandSource, SourceId};
use crate::gcode::{Command, Response};
use crate::hardware::{IoDrivers, PinBus, DEFAULT_TEMP};
use crate::motion::{MotionPlanner, PlannerError};
use crate::scheduler::Scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// M0, root-stream EOF: drain and exit 0.
    Clean,
    /// M112 or fatal error: exit nonzero after the safety teardown.
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PositionMode {
    Absolute,
    Relative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitMode {
    Mm,
    Inch,
}

const MM_PER_INCH: f64 = 25.4;

/// How a command resolved.
enum Outcome {
    Reply(Response),
    /// The command's own source was popped; there is nowhere to reply.
    NoReply,
    /// Not ready (planner busy); keep the command pending and retry.
    Defer,
    Exit(ExitAction),
}

struct MotionLimits {
    max_move_rate: f64,
    home_rate: f64,
    max_extrude_rate: f64,
    max_retract_rate: f64,
    home_before_first_move: bool,
}

pub struct State {
    position_mode: PositionMode,
    extruder_pos_mode: PositionMode,
    unit_mode: UnitMode,
    dest: [f64; 4],
    host_zero: [f64; 4],
    dest_move_rate: f64,
    is_homed: bool,
    last_motion_planned: TimePoint,
    limits: MotionLimits,

    planner: MotionPlanner,
    scheduler: Arc<Scheduler>,
    drivers: Arc<IoDrivers>,
    bus: Arc<dyn PinBus>,
    clock: Arc<dyn Clock>,

    root: CommandSource,
    source_stack: Vec<CommandSource>,
    gcode_dir: PathBuf,

    /// Trailing step edges not yet handed to the scheduler. The queue
    /// demands non-decreasing times, and when steps on different axes
    /// coincide the next step's edges start before the previous step's
    /// trailing edge lands, so trailing edges wait here until they are due.
    pending_tails: VecDeque<Event>,
}

impl State {
    pub fn new(
        config: &Config,
        root: CommandSource,
        planner: MotionPlanner,
        scheduler: Arc<Scheduler>,
        drivers: Arc<IoDrivers>,
        bus: Arc<dyn PinBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        State {
            position_mode: PositionMode::Absolute,
            extruder_pos_mode: PositionMode::Absolute,
            unit_mode: UnitMode::Mm,
            dest: [0.0; 4],
            host_zero: [0.0; 4],
            dest_move_rate: config.printer.max_move_rate,
            is_homed: false,
            last_motion_planned: TimePoint::ZERO,
            limits: MotionLimits {
                max_move_rate: config.printer.max_move_rate,
                home_rate: config.printer.home_rate,
                max_extrude_rate: config.printer.max_extrude_rate,
                max_retract_rate: config.printer.max_retract_rate,
                home_before_first_move: config.printer.home_before_first_move,
            },
            planner,
            scheduler,
            drivers,
            bus,
            clock,
            root,
            source_stack: Vec::new(),
            gcode_dir: PathBuf::from("."),
            pending_tails: VecDeque::with_capacity(8),
        }
    }

    pub fn with_gcode_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.gcode_dir = dir.into();
        self
    }

    pub fn is_homed(&self) -> bool {
        self.is_homed
    }

    /// Host-frame destination primitives (x, y, z, e) in mm.
    pub fn dest_position(&self) -> (f64, f64, f64, f64) {
        (self.dest[0], self.dest[1], self.dest[2], self.dest[3])
    }

    pub fn dest_move_rate(&self) -> f64 {
        self.dest_move_rate
    }

    pub fn planner(&self) -> &MotionPlanner {
        &self.planner
    }

    /// The producer thread body: runs until an exit is requested.
    pub fn run(&mut self) -> ExitAction {
        loop {
            match self.poll() {
                Some(ExitAction::Clean) => {
                    self.drain();
                    return ExitAction::Clean;
                }
                Some(ExitAction::Emergency) => return ExitAction::Emergency,
                None => {}
            }
            if !self.pump_motion() {
                // nothing queued and nothing pending; don't spin
                std::thread::sleep(Duration::from_micros(200));
            }
        }
    }

    /// One producer cycle without the pacing sleep. The root source is
    /// polled on every cycle so emergency commands always land, the stack
    /// top whenever a subfile is active.
    pub fn poll(&mut self) -> Option<ExitAction> {
        // finished subfiles pop as if they ended with M99
        while self
            .source_stack
            .last()
            .map(CommandSource::is_exhausted)
            .unwrap_or(false)
        {
            self.source_stack.pop();
        }

        if let Some(exit) = self.tend(TendWhich::Root) {
            return Some(exit);
        }
        if let Some(exit) = self.tend(TendWhich::Top) {
            return Some(exit);
        }

        if self.root.is_exhausted() && self.source_stack.is_empty() {
            tracing::info!("root command stream ended");
            return Some(ExitAction::Clean);
        }
        None
    }

    fn tend(&mut self, which: TendWhich) -> Option<ExitAction> {
        let (id, command) = {
            let source = match which {
                TendWhich::Root => &mut self.root,
                TendWhich::Top => self.source_stack.last_mut()?,
            };
            let command = source.pending()?.clone();
            (source.id(), command)
        };

        match self.execute(&command, id) {
            Outcome::Defer => None,
            Outcome::Reply(response) => {
                tracing::debug!(opcode = %command.opcode, %response, "command handled");
                if let Some(source) = self.source_by_id(id) {
                    source.complete(Some(&response));
                }
                None
            }
            Outcome::NoReply => {
                if let Some(source) = self.source_by_id(id) {
                    source.complete(None);
                }
                None
            }
            Outcome::Exit(action) => Some(action),
        }
    }

    fn source_by_id(&mut self, id: SourceId) -> Option<&mut CommandSource> {
        if self.root.id() == id {
            return Some(&mut self.root);
        }
        self.source_stack.iter_mut().find(|s| s.id() == id)
    }

    /// Plan at most one step and feed its pin edges into the scheduler.
    /// One step per cycle keeps the command sources polled between steps.
    /// Returns true when more planning work is immediately available.
    pub fn pump_motion(&mut self) -> bool {
        if !self.scheduler.is_room_in_buffer() {
            return false; // let the dispatcher drain
        }
        if self.planner.is_homing() {
            self.poll_endstops();
            // don't plan the next homing step until the current one has
            // actually fired; endstop state must stay fresh
            if self.last_motion_planned > self.clock.now() {
                return false;
            }
        }
        let event = self.planner.next_step();
        if event.is_null() {
            self.flush_step_tails(None);
            self.scheduler.set_default_max_sleep();
            return false;
        }
        let axis = event.pin as usize;
        if let Some(driver) = self.drivers.stepper_for_axis(axis) {
            let [dir_edge, pulse_high, pulse_low] = driver.step_events(&event);
            // earlier trailing edges due by this step go first
            self.flush_step_tails(Some(event.time));
            self.scheduler.queue(dir_edge);
            self.scheduler.queue(pulse_high);
            self.defer_step_tail(pulse_low);
        }
        self.last_motion_planned = event.time;
        self.scheduler.is_room_in_buffer()
    }

    /// Queue deferred trailing edges, oldest first. `up_to` bounds the
    /// flush to edges not later than the next step; `None` flushes all
    /// (end of move).
    fn flush_step_tails(&mut self, up_to: Option<TimePoint>) {
        loop {
            let due = match self.pending_tails.front() {
                Some(tail) => up_to.map_or(true, |limit| tail.time <= limit),
                None => false,
            };
            if !due {
                return;
            }
            if let Some(tail) = self.pending_tails.pop_front() {
                if tail.time > self.last_motion_planned {
                    self.last_motion_planned = tail.time;
                }
                self.scheduler.queue(tail);
            }
        }
    }

    /// Hold a trailing edge, keeping the pending list time-sorted.
    fn defer_step_tail(&mut self, tail: Event) {
        let at = self
            .pending_tails
            .iter()
            .rposition(|e| e.time <= tail.time)
            .map_or(0, |i| i + 1);
        self.pending_tails.insert(at, tail);
    }

    fn poll_endstops(&mut self) {
        let mask = self.planner.homing_axes();
        for (axis, homing) in mask.iter().enumerate() {
            if !homing {
                continue;
            }
            match self.drivers.endstop_for_axis(axis) {
                Some(endstop) => {
                    if endstop.is_triggered(self.bus.as_ref()) {
                        self.planner.cancel_axis_home(axis);
                    }
                }
                // an axis with no switch has nothing to seek
                None => self.planner.cancel_axis_home(axis),
            }
        }
    }

    /// Finish all queued motion before a clean exit.
    fn drain(&mut self) {
        while !self.planner.ready_for_next_move() {
            if self.planner.is_homing() {
                self.poll_endstops();
            }
            if !self.pump_motion() {
                std::thread::sleep(Duration::from_micros(200));
            }
        }
        self.scheduler.wait_until_empty();
    }

    // --- unit / mode conversions ---

    fn unit_to_mm(&self, value: f64) -> f64 {
        match self.unit_mode {
            UnitMode::Mm => value,
            UnitMode::Inch => value * MM_PER_INCH,
        }
    }

    /// Convert one host coordinate word to an absolute primitive, mm.
    fn to_primitive(&self, axis: usize, value: f64) -> f64 {
        let mode = if axis == 3 {
            self.extruder_pos_mode
        } else {
            self.position_mode
        };
        let mm = self.unit_to_mm(value);
        match mode {
            PositionMode::Relative => self.dest[axis] + mm,
            PositionMode::Absolute => mm + self.host_zero[axis],
        }
    }

    /// Feed rate arrives in mm/min regardless of unit mode.
    fn feed_to_rate(&self, feed: f64) -> f64 {
        (feed / 60.0).min(self.limits.max_move_rate)
    }

    fn start_homing(&mut self) -> Result<(), PlannerError> {
        // tighten the dispatch sleep so endstop polling stays responsive
        self.scheduler.set_max_sleep(Duration::from_millis(1));
        let start = self.plan_start_time();
        self.planner.home_endstops(start, self.limits.home_rate)?;
        self.is_homed = true;
        Ok(())
    }

    fn plan_start_time(&self) -> TimePoint {
        let now = self.clock.now();
        if self.last_motion_planned > now {
            self.last_motion_planned
        } else {
            now
        }
    }

    // --- command execution ---

    fn execute(&mut self, cmd: &Command, src: SourceId) -> Outcome {
        match cmd.opcode.as_str() {
            "G0" | "G1" => self.exec_move(cmd),
            "G20" => {
                self.unit_mode = UnitMode::Inch;
                Outcome::Reply(Response::Ok)
            }
            "G21" => {
                self.unit_mode = UnitMode::Mm;
                Outcome::Reply(Response::Ok)
            }
            "G28" => {
                if !self.planner.ready_for_next_move() {
                    return Outcome::Defer;
                }
                match self.start_homing() {
                    Ok(()) => Outcome::Reply(Response::Ok),
                    Err(_) => Outcome::Defer,
                }
            }
            "G90" => {
                self.position_mode = PositionMode::Absolute;
                self.extruder_pos_mode = PositionMode::Absolute;
                Outcome::Reply(Response::Ok)
            }
            "G91" => {
                self.position_mode = PositionMode::Relative;
                self.extruder_pos_mode = PositionMode::Relative;
                Outcome::Reply(Response::Ok)
            }
            "G92" => self.exec_set_host_zero(cmd),
            "M0" => {
                tracing::info!("M0: clean shutdown requested");
                Outcome::Exit(ExitAction::Clean)
            }
            "M17" => {
                self.drivers.lock_all(self.bus.as_ref());
                Outcome::Reply(Response::Ok)
            }
            "M18" | "M84" => {
                self.drivers.unlock_all(self.bus.as_ref());
                Outcome::Reply(Response::Ok)
            }
            "M21" => Outcome::Reply(Response::Ok),
            "M32" => self.exec_push_file(cmd),
            "M82" => {
                self.extruder_pos_mode = PositionMode::Absolute;
                Outcome::Reply(Response::Ok)
            }
            "M83" => {
                self.extruder_pos_mode = PositionMode::Relative;
                Outcome::Reply(Response::Ok)
            }
            "M99" => self.exec_pop_source(src),
            "M104" | "M109" => {
                if let (Some(temp), Some(hotend)) = (cmd.get('S'), self.drivers.hotend()) {
                    hotend.set_target(temp);
                }
                Outcome::Reply(Response::Ok)
            }
            "M105" => {
                let hotend = self
                    .drivers
                    .hotend()
                    .map(|t| t.measured())
                    .unwrap_or(DEFAULT_TEMP);
                let bed = self
                    .drivers
                    .heated_bed()
                    .map(|t| t.measured())
                    .unwrap_or(DEFAULT_TEMP);
                Outcome::Reply(Response::OkMsg(format!("T:{hotend:.1} B:{bed:.1}")))
            }
            "M106" => {
                let mut s = cmd.get('S').unwrap_or(1.0);
                if s > 1.0 {
                    // host is thinking in 0-255
                    s /= 256.0;
                }
                self.drivers.set_fan_rate(s as f32, self.bus.as_ref());
                Outcome::Reply(Response::Ok)
            }
            "M107" => {
                self.drivers.set_fan_rate(0.0, self.bus.as_ref());
                Outcome::Reply(Response::Ok)
            }
            "M110" | "M117" => Outcome::Reply(Response::Ok),
            "M112" => {
                tracing::error!("M112: emergency stop");
                Outcome::Exit(ExitAction::Emergency)
            }
            "M140" => {
                if let (Some(temp), Some(bed)) = (cmd.get('S'), self.drivers.heated_bed()) {
                    bed.set_target(temp);
                }
                Outcome::Reply(Response::Ok)
            }
            op if op.starts_with('T') => Outcome::Reply(Response::Ok),
            op => {
                tracing::warn!(opcode = %op, "unknown opcode");
                Outcome::Reply(Response::Error(format!("unknown opcode: {op}")))
            }
        }
    }

    fn exec_move(&mut self, cmd: &Command) -> Outcome {
        if !self.planner.ready_for_next_move() || !self.scheduler.is_room_in_buffer() {
            return Outcome::Defer;
        }
        if !self.is_homed && self.limits.home_before_first_move {
            // home first; the move stays pending and retries once idle
            if self.start_homing().is_err() {
                return Outcome::Defer;
            }
            return Outcome::Defer;
        }

        if let Some(feed) = cmd.get('F') {
            self.dest_move_rate = self.feed_to_rate(feed);
        }
        let target = [
            cmd.get('X')
                .map(|v| self.to_primitive(0, v))
                .unwrap_or(self.dest[0]),
            cmd.get('Y')
                .map(|v| self.to_primitive(1, v))
                .unwrap_or(self.dest[1]),
            cmd.get('Z')
                .map(|v| self.to_primitive(2, v))
                .unwrap_or(self.dest[2]),
            cmd.get('E')
                .map(|v| self.to_primitive(3, v))
                .unwrap_or(self.dest[3]),
        ];

        let start = self.plan_start_time();
        match self.planner.move_to(
            start,
            target[0],
            target[1],
            target[2],
            target[3],
            self.dest_move_rate,
            -self.limits.max_retract_rate,
            self.limits.max_extrude_rate,
        ) {
            Ok(()) => {
                self.dest = target;
                Outcome::Reply(Response::Ok)
            }
            Err(PlannerError::UnreachableTarget) => {
                Outcome::Reply(Response::Error("unreachable target".into()))
            }
            Err(PlannerError::Busy) => Outcome::Defer,
        }
    }

    fn exec_set_host_zero(&mut self, cmd: &Command) -> Outcome {
        let actual = if !cmd.has_any_xyze() {
            [0.0; 4]
        } else {
            let mut actual = [0.0; 4];
            for (axis, letter) in ['X', 'Y', 'Z', 'E'].iter().enumerate() {
                actual[axis] = match cmd.get(*letter) {
                    Some(v) => self.unit_to_mm(v),
                    None => self.dest[axis] - self.host_zero[axis],
                };
            }
            actual
        };
        // choose offsets so the current primitives read as `actual`
        for axis in 0..4 {
            self.host_zero[axis] = self.dest[axis] - actual[axis];
        }
        Outcome::Reply(Response::Ok)
    }

    fn exec_push_file(&mut self, cmd: &Command) -> Outcome {
        let Some(path) = cmd.text.as_deref() else {
            return Outcome::Reply(Response::Error("M32 requires a path".into()));
        };
        let full = self.gcode_dir.join(path);
        match CommandSource::from_file(&full) {
            Ok(source) => {
                tracing::info!(path = %full.display(), "M32: playing subfile");
                self.source_stack.push(source);
                Outcome::Reply(Response::Ok)
            }
            Err(err) => Outcome::Reply(Response::Error(format!(
                "cannot open {}: {err}",
                full.display()
            ))),
        }
    }

    fn exec_pop_source(&mut self, src: SourceId) -> Outcome {
        match self.source_stack.last() {
            // M99 from the root with no subfile running ends the program
            None => Outcome::Exit(ExitAction::Clean),
            Some(top) => {
                // compare identities before popping; afterwards the sender
                // may no longer exist
                let popping_self = top.id() == src;
                self.source_stack.pop();
                if popping_self {
                    Outcome::NoReply
                } else {
                    Outcome::Reply(Response::Ok)
                }
            }
        }
    }
}

#[derive(Clone, Copy)]
enum TendWhich {
    Root,
    Top,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcode::source::ChannelHandle;
    use crate::hardware::RecordingPins;
    use cinder_shared::clock::SimClock;
    use cinder_shared::config::MachineKind;

    struct Rig {
        state: State,
        handle: ChannelHandle,
        clock: Arc<SimClock>,
        pins: Arc<RecordingPins>,
    }

    fn rig() -> Rig {
        let mut config = Config::default();
        config.printer.kinematics = MachineKind::Cartesian;
        config.printer.home_before_first_move = false;
        config.printer.max_accel = 1e9;
        config.geometry.steps_per_m = 1000.0;
        config.geometry.steps_per_m_e = 1000.0;
        config.scheduler.capacity = 1 << 16;
        rig_from(config)
    }

    fn rig_from(config: Config) -> Rig {
        let clock = Arc::new(SimClock::new());
        let pins = RecordingPins::new();
        let scheduler = Arc::new(Scheduler::new(
            clock.clone(),
            config.scheduler.capacity,
            Duration::from_millis(config.scheduler.max_sleep_ms),
        ));
        let drivers = Arc::new(IoDrivers::from_config(&config));
        let planner = MotionPlanner::from_config(&config);
        let (root, handle) = CommandSource::channel();
        let state = State::new(
            &config,
            root,
            planner,
            scheduler,
            drivers,
            pins.clone(),
            clock.clone(),
        );
        Rig {
            state,
            handle,
            clock,
            pins,
        }
    }

    /// Run producer cycles with the sim clock marching, long enough for
    /// every sent line to execute and every planned step to drain.
    fn settle(rig: &mut Rig) {
        for _ in 0..500 {
            assert!(rig.state.poll().is_none(), "unexpected exit");
            rig.state.pump_motion();
            rig.clock.advance(Duration::from_millis(20));
        }
        assert!(rig.state.planner.ready_for_next_move());
    }

    #[test]
    fn absolute_moves_do_not_accumulate() {
        let mut rig = rig();
        rig.handle.send_line("G90");
        rig.handle.send_line("G1 X10 F600");
        rig.handle.send_line("G1 X10 F600");
        settle(&mut rig);
        let (x, ..) = rig.state.dest_position();
        assert_eq!(x, 10.0);
    }

    #[test]
    fn relative_moves_accumulate() {
        let mut rig = rig();
        rig.handle.send_line("G91");
        rig.handle.send_line("G1 X10 F600");
        rig.handle.send_line("G1 X10 F600");
        settle(&mut rig);
        let (x, ..) = rig.state.dest_position();
        assert_eq!(x, 20.0);
    }

    #[test]
    fn feed_rate_is_mm_per_minute() {
        let mut rig = rig();
        rig.handle.send_line("G1 X1 F600");
        settle(&mut rig);
        assert_eq!(rig.state.dest_move_rate(), 10.0);
    }

    #[test]
    fn g92_rezeroes_the_host_frame() {
        let mut rig = rig();
        rig.handle.send_line("G1 X5 F600");
        settle(&mut rig);
        rig.handle.send_line("G92 X0");
        rig.handle.send_line("G1 X5 F600");
        settle(&mut rig);
        // the primitive kept marching: 5 then another 5
        let (x, ..) = rig.state.dest_position();
        assert_eq!(x, 10.0);
        assert_eq!(rig.state.planner.mechanical_position()[0], 10);
    }

    #[test]
    fn bare_g92_zeroes_all_axes() {
        let mut rig = rig();
        rig.handle.send_line("G1 X5 Y3 F600");
        settle(&mut rig);
        rig.handle.send_line("G92");
        rig.handle.send_line("G1 X1 F600");
        settle(&mut rig);
        let (x, y, ..) = rig.state.dest_position();
        assert_eq!(x, 6.0);
        assert_eq!(y, 3.0);
    }

    #[test]
    fn inch_mode_scales_coordinates_not_feed() {
        let mut rig = rig();
        rig.handle.send_line("G20");
        rig.handle.send_line("G1 X1 F60");
        settle(&mut rig);
        let (x, ..) = rig.state.dest_position();
        assert!((x - 25.4).abs() < 1e-9);
        // F60 is 1 mm/s regardless of G20
        assert_eq!(rig.state.dest_move_rate(), 1.0);
    }

    #[test]
    fn m104_and_m140_route_to_the_right_heater() {
        let mut config = Config::default();
        config.printer.kinematics = MachineKind::Cartesian;
        config.printer.home_before_first_move = false;
        config.scheduler.capacity = 64;
        config.hotend = Some(cinder_shared::config::HeaterConfig {
            heater_pin: 10,
            pwm_period_ms: 100,
            pid: cinder_shared::config::PidGains::default(),
            filter_time_s: 0.0,
        });
        config.heater_bed = Some(cinder_shared::config::HeaterConfig {
            heater_pin: 11,
            pwm_period_ms: 100,
            pid: cinder_shared::config::PidGains::default(),
            filter_time_s: 0.0,
        });
        let mut rig = rig_from(config);
        rig.handle.send_line("M104 S210");
        rig.handle.send_line("M140 S60");
        rig.state.poll();
        rig.state.poll();
        let drivers = rig.state.drivers.clone();
        assert_eq!(drivers.hotend().unwrap().target(), 210.0);
        assert_eq!(drivers.heated_bed().unwrap().target(), 60.0);
    }

    #[test]
    fn m105_reports_both_temperatures() {
        let mut rig = rig();
        rig.handle.send_line("M105");
        rig.state.poll();
        let replies = rig.handle.take_replies();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].starts_with("ok T:"), "got {:?}", replies[0]);
        assert!(replies[0].contains(" B:"));
    }

    #[test]
    fn m106_accepts_both_duty_conventions() {
        let mut config = Config::default();
        config.printer.kinematics = MachineKind::Cartesian;
        config.printer.home_before_first_move = false;
        config.scheduler.capacity = 64;
        config.fan = Some(cinder_shared::config::FanConfig {
            pin: 8,
            pwm_period_ms: 25,
        });
        let mut rig = rig_from(config);
        rig.handle.send_line("M106 S128");
        rig.state.poll();
        assert_eq!(rig.pins.last_pwm(8), Some(0.5));
        rig.handle.send_line("M106 S0.25");
        rig.state.poll();
        assert_eq!(rig.pins.last_pwm(8), Some(0.25));
        rig.handle.send_line("M107");
        rig.state.poll();
        assert_eq!(rig.pins.last_pwm(8), Some(0.0));
    }

    #[test]
    fn unknown_opcode_is_an_error_reply() {
        let mut rig = rig();
        rig.handle.send_line("M999");
        rig.state.poll();
        let replies = rig.handle.take_replies();
        assert!(replies[0].starts_with("Error:unknown opcode"));
        // and the interpreter keeps going
        rig.handle.send_line("M105");
        rig.state.poll();
        assert!(!rig.handle.take_replies().is_empty());
    }

    #[test]
    fn m112_requests_emergency_exit() {
        let mut rig = rig();
        rig.handle.send_line("M112");
        assert_eq!(rig.state.poll(), Some(ExitAction::Emergency));
    }

    #[test]
    fn m0_requests_clean_exit() {
        let mut rig = rig();
        rig.handle.send_line("M0");
        assert_eq!(rig.state.poll(), Some(ExitAction::Clean));
    }

    #[test]
    fn m17_locks_and_m18_unlocks() {
        let mut rig = rig();
        rig.handle.send_line("M17");
        rig.state.poll();
        let drivers = rig.state.drivers.clone();
        assert!(drivers.stepper_for_axis(0).unwrap().is_locked());
        rig.handle.send_line("M18");
        rig.state.poll();
        assert!(!drivers.stepper_for_axis(0).unwrap().is_locked());
    }

    #[test]
    fn homing_runs_before_first_move_when_configured() {
        let mut config = Config::default();
        config.printer.kinematics = MachineKind::Cartesian;
        config.printer.home_before_first_move = true;
        config.geometry.steps_per_m = 1000.0;
        config.geometry.steps_per_m_e = 1000.0;
        config.scheduler.capacity = 1 << 16;
        let mut rig = rig_from(config);
        // endstops already at their switches
        for pin in [18, 28, 15] {
            rig.pins.set_input(pin, cinder_shared::event::Level::High);
        }
        rig.handle.send_line("G1 X2 F600");
        settle(&mut rig);
        assert!(rig.state.is_homed());
        let (x, ..) = rig.state.dest_position();
        assert_eq!(x, 2.0);
    }

    #[test]
    fn g28_homes_and_idles() {
        let mut rig = rig();
        for pin in [18, 28, 15] {
            rig.pins.set_input(pin, cinder_shared::event::Level::High);
        }
        rig.handle.send_line("G28");
        settle(&mut rig);
        assert!(rig.state.is_homed());
        assert!(rig.state.planner.ready_for_next_move());
        assert_eq!(rig.state.planner.mechanical_position(), [0, 0, 0, 0]);
    }

    #[test]
    fn coincident_cross_axis_steps_enqueue_in_order() {
        let mut rig = rig();
        // equal X and Y components step both axes at identical times; the
        // scheduler's time-order assertion must hold through the interleave
        rig.handle.send_line("G1 X10 Y10 F600");
        settle(&mut rig);
        let mech = rig.state.planner.mechanical_position();
        assert_eq!(mech[0], 10);
        assert_eq!(mech[1], 10);
        assert!(rig.state.pending_tails.is_empty());
    }

    #[test]
    fn m99_on_root_exits_cleanly() {
        let mut rig = rig();
        rig.handle.send_line("M99");
        assert_eq!(rig.state.poll(), Some(ExitAction::Clean));
    }

    #[test]
    fn root_m99_pops_an_active_subfile_and_gets_a_reply() {
        use std::io::Write;
        let dir = std::env::temp_dir().join("cinder_state_m99");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("long.gcode");
        let mut f = std::fs::File::create(&path).unwrap();
        for _ in 0..200 {
            writeln!(f, "G92 X0").unwrap();
        }
        drop(f);

        let mut rig = rig();
        rig.handle.send_line(format!("M32 {}", path.display()));
        rig.state.poll();
        assert_eq!(rig.state.source_stack.len(), 1);
        // the subfile is mid-stream when the root asks to return
        rig.handle.send_line("M99");
        rig.state.poll();
        assert!(rig.state.source_stack.is_empty());
        let replies = rig.handle.take_replies();
        // one ok for M32, one for the M99 that popped a different source
        assert_eq!(replies, vec!["ok".to_string(), "ok".to_string()]);
    }
}
