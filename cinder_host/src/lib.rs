// cinder_host: the printer host runtime. G-code comes in on the producer
// thread; precisely timed pin events go out on the real-time dispatch
// thread; heaters close their loops in the dispatcher's idle time.

pub mod gcode;
pub mod hardware;
pub mod machine;
pub mod motion;
pub mod scheduler;
pub mod state;

pub use machine::Machine;
pub use state::{ExitAction, State};
