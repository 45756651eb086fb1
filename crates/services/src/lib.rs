//! Backend process supervision: port allocation, readiness probing, and the
//! start/crash/restart state machine.

pub mod port;
pub mod probe;
pub mod process;
pub mod supervisor;

pub use supervisor::{ServiceSupervisor, SupervisorConfig};
