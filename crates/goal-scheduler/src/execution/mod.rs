//! What runs inside a goal job: the init container prepares the shared
//! volumes, the monitor container follows the goal container and reports.

pub mod init;
pub mod monitor;
pub mod result;
pub mod watch;

pub use init::{run_init, InitContext};
pub use monitor::{run_monitor, MonitorContext};
pub use result::read_result_file;
pub use watch::ContainerExit;
