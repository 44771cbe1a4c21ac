//! Internal events flowing into the supervisor's event loop.

pub mod channel;

/// Event published by a child watcher or a timer task. Each event carries the
/// service generation it was produced for; the supervisor drops events whose
/// generation is stale.
#[derive(Debug, PartialEq, Eq)]
pub enum ServiceEvent {
    /// The watched child exited; `code` is the exit code byte of the wait
    /// status (signal deaths report 0).
    Exited {
        name: String,
        generation: u64,
        code: i32,
    },
    /// The `start_wait` grace period elapsed.
    StartWaitElapsed { name: String, generation: u64 },
    /// The `stop_wait` grace period elapsed after a `TERM`.
    StopWaitElapsed { name: String, generation: u64 },
    /// The `restart_delay` elapsed and the service may start again.
    RestartDue { name: String, generation: u64 },
}

impl ServiceEvent {
    pub fn service(&self) -> &str {
        match self {
            ServiceEvent::Exited { name, .. }
            | ServiceEvent::StartWaitElapsed { name, .. }
            | ServiceEvent::StopWaitElapsed { name, .. }
            | ServiceEvent::RestartDue { name, .. } => name,
        }
    }
}
