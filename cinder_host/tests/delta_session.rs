// End-to-end sessions on the linear delta: homing against endstops and
// tower-coupled z motion.

use std::sync::Arc;
use std::time::Duration;

use cinder_host::gcode::source::{ChannelHandle, CommandSource};
use cinder_host::hardware::{PinBus, PinRecord, RecordingPins};
use cinder_host::{ExitAction, Machine};
use cinder_shared::clock::SimClock;
use cinder_shared::config::{Config, MachineKind, StepperConfig};
use cinder_shared::event::Level;

const TOWER_STEP: [u32; 3] = [200, 210, 220];
const TOWER_DIR: [u32; 3] = [201, 211, 221];
const TOWER_ENDSTOP: [u32; 3] = [202, 212, 222];

fn delta_config() -> Config {
    let mut config = Config::default();
    assert_eq!(config.printer.kinematics, MachineKind::Delta);
    config.printer.max_accel = 1e9;
    config.printer.home_before_first_move = false;
    for (k, name) in ["a", "b", "c"].iter().enumerate() {
        config.steppers.insert(
            (*name).into(),
            StepperConfig {
                step_pin: TOWER_STEP[k],
                dir_pin: TOWER_DIR[k],
                enable_pin: 230,
                endstop_pin: Some(TOWER_ENDSTOP[k]),
                endstop_inverted: false,
            },
        );
    }
    config
}

struct Session {
    machine: Machine,
    handle: ChannelHandle,
    pins: Arc<RecordingPins>,
    dispatch: std::thread::JoinHandle<()>,
}

fn start(config: Config) -> Session {
    let pins = RecordingPins::new();
    let clock = Arc::new(SimClock::new());
    let (root, handle) = CommandSource::channel();
    let machine = Machine::new(&config, pins.clone(), clock, root);
    let dispatch = machine.spawn_dispatch();
    Session {
        machine,
        handle,
        pins,
        dispatch,
    }
}

fn step_count(pins: &RecordingPins, pin: u32) -> i64 {
    pins.records()
        .iter()
        .filter(|r| matches!(r, PinRecord::Write(p, Level::High) if *p == pin))
        .count() as i64
}

#[test]
fn g28_homes_every_tower_to_its_endstop() {
    let session = start(delta_config());
    // carriages reach the switches shortly after homing starts
    let pins = session.pins.clone();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(60));
        for pin in TOWER_ENDSTOP {
            pins.set_input(pin, Level::High);
        }
    });
    session.handle.send_line("G28");
    session.handle.send_line("M0");

    let Session {
        mut machine,
        dispatch,
        pins,
        ..
    } = session;
    let exit = machine.state.run();
    machine.scheduler.stop();
    dispatch.join().unwrap();

    assert_eq!(exit, ExitAction::Clean);
    assert!(machine.state.is_homed());
    for pin in TOWER_ENDSTOP {
        assert_eq!(pins.read(pin), Level::High, "endstop {pin} must report triggered");
    }
    // the mechanical truth snapped to the homed carriage heights
    let home = machine
        .state
        .planner()
        .coord_map()
        .home_position(0);
    assert_eq!(machine.state.planner().mechanical_position(), home);
    // homing ran upward on every tower
    for pin in TOWER_DIR {
        assert_eq!(pins.last_level(pin), Some(Level::High));
    }
}

#[test]
fn z_move_from_home_couples_the_towers() {
    let session = start(delta_config());
    // already at the switches: homing completes instantly
    for pin in TOWER_ENDSTOP {
        session.pins.set_input(pin, Level::High);
    }
    session.handle.send_line("G28");
    // home leaves the effector near z = 276; drop straight down 6 mm
    session.handle.send_line("G1 Z270 F600");
    session.handle.send_line("M0");

    let Session {
        mut machine,
        dispatch,
        pins,
        ..
    } = session;
    let exit = machine.state.run();
    machine.scheduler.stop();
    dispatch.join().unwrap();
    assert_eq!(exit, ExitAction::Clean);

    let counts = [
        step_count(&pins, TOWER_STEP[0]),
        step_count(&pins, TOWER_STEP[1]),
        step_count(&pins, TOWER_STEP[2]),
    ];
    assert!(counts[0] > 0, "towers must have moved");
    // a pure z move drives all towers identically
    assert!((counts[0] - counts[1]).abs() <= 1, "{counts:?}");
    assert!((counts[1] - counts[2]).abs() <= 1, "{counts:?}");
    // downward: every tower's dir line ended low
    for pin in TOWER_DIR {
        assert_eq!(pins.last_level(pin), Some(Level::Low));
    }
}
