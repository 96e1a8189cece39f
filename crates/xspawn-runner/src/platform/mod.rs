//! Operating-system collaborators: process creation, exit monitoring and signals.

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use unix::{PlatformOptions, ProcessConfigurator, Signal};

#[cfg(unix)]
pub(crate) use unix::{
    monitor_process_termination, send_signal, spawn, terminate_process_group,
};
