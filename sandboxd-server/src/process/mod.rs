//! Child process supervision
//!
//! Spawns shell commands in their own process groups, tracks their
//! lifecycle, captures output and kills whole process trees.

mod signal;
mod supervisor;
mod types;

pub use signal::{parse_signal, signal_name};
pub(crate) use signal::signal_process_group;
pub use supervisor::{LogStream, ProcessSupervisor, SupervisorConfig};
pub use types::{
    ExecResult, Process, ProcessLogs, ProcessOptions, ProcessStatus, TIMEOUT_EXIT_CODE,
};
