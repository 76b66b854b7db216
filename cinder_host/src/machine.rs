//! Wires configuration into a running machine: planner, scheduler, device
//! set, dispatch thread and producer state.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cinder_shared::clock::Clock;
use cinder_shared::config::Config;

use crate::gcode::source::CommandSource;
use crate::hardware::{IoDrivers, PinBus, SafeTeardown};
use crate::motion::MotionPlanner;
use crate::scheduler::{IdleHooks, IdleInterval, Scheduler};
use crate::state::State;

/// Consumer-side idle fan-out: temperature control service.
pub struct DriverIdle {
    drivers: Arc<IoDrivers>,
    bus: Arc<dyn PinBus>,
    clock: Arc<dyn Clock>,
}

impl IdleHooks for DriverIdle {
    fn on_idle_cpu(&mut self, _interval: IdleInterval) -> bool {
        self.drivers
            .on_idle_cpu(self.clock.now(), self.bus.as_ref())
    }
}

pub struct Machine {
    pub scheduler: Arc<Scheduler>,
    pub drivers: Arc<IoDrivers>,
    pub bus: Arc<dyn PinBus>,
    pub clock: Arc<dyn Clock>,
    pub state: State,
    rt_priority: i32,
}

impl Machine {
    pub fn new(
        config: &Config,
        bus: Arc<dyn PinBus>,
        clock: Arc<dyn Clock>,
        root: CommandSource,
    ) -> Machine {
        let scheduler = Arc::new(Scheduler::new(
            clock.clone(),
            config.scheduler.capacity,
            Duration::from_millis(config.scheduler.max_sleep_ms),
        ));
        let drivers = Arc::new(IoDrivers::from_config(config));
        let planner = MotionPlanner::from_config(config);
        let state = State::new(
            config,
            root,
            planner,
            scheduler.clone(),
            drivers.clone(),
            bus.clone(),
            clock.clone(),
        );
        Machine {
            scheduler,
            drivers,
            bus,
            clock,
            state,
            rt_priority: config.scheduler.rt_priority,
        }
    }

    /// The teardown guard for this machine's outputs; register it before
    /// starting any thread.
    pub fn teardown_guard(&self) -> SafeTeardown {
        SafeTeardown::new(self.bus.clone(), self.drivers.safe_teardown_pins())
    }

    /// Start the real-time dispatch thread. It exits once the scheduler is
    /// stopped and drained.
    pub fn spawn_dispatch(&self) -> JoinHandle<()> {
        let scheduler = self.scheduler.clone();
        let bus = self.bus.clone();
        let mut hooks = DriverIdle {
            drivers: self.drivers.clone(),
            bus: self.bus.clone(),
            clock: self.clock.clone(),
        };
        let priority = self.rt_priority;
        std::thread::Builder::new()
            .name("cinder-dispatch".into())
            .spawn(move || {
                Scheduler::init_dispatch_thread(priority);
                scheduler.event_loop(bus.as_ref(), &mut hooks);
            })
            .expect("spawning the dispatch thread cannot fail")
    }
}
