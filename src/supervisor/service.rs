//! In-memory state for one declared service.

use std::fmt;
use std::time::Instant;

use tokio::task::JoinHandle;

use crate::config::ServiceConfig;

/// Service state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvcState {
    Down,
    Start,
    Up,
    Restart,
    Stop,
    Fail,
    Fatal,
}

impl SvcState {
    pub fn as_str(self) -> &'static str {
        match self {
            SvcState::Down => "down",
            SvcState::Start => "start",
            SvcState::Up => "up",
            SvcState::Restart => "restart",
            SvcState::Stop => "stop",
            SvcState::Fail => "fail",
            SvcState::Fatal => "fatal",
        }
    }
}

impl fmt::Display for SvcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable per-service record, owned solely by the supervisor task.
pub(crate) struct Service {
    pub(crate) cfg: ServiceConfig,
    pub(crate) state: SvcState,
    pub(crate) pid: Option<u32>,
    /// Consecutive start attempts in the current retry burst.
    pub(crate) start_count: u32,
    pub(crate) start_ts: Option<Instant>,
    /// Exit code byte of the last child.
    pub(crate) last_status: Option<i32>,
    /// A natural exit ends in `fatal` instead of a restart.
    pub(crate) once: bool,
    /// Bumped on each spawn; events stamped with an older generation are
    /// stale and dropped.
    pub(crate) generation: u64,
    pub(crate) timer: Option<JoinHandle<()>>,
    pub(crate) watcher: Option<JoinHandle<()>>,
}

impl Service {
    pub(crate) fn new(cfg: ServiceConfig) -> Self {
        Service {
            cfg,
            state: SvcState::Down,
            pid: None,
            start_count: 0,
            start_ts: None,
            last_status: None,
            once: false,
            generation: 0,
            timer: None,
            watcher: None,
        }
    }

    pub(crate) fn child_running(&self) -> bool {
        self.pid.is_some()
    }

    /// Cancels the pending `start_wait` / `stop_wait` / `restart_delay`
    /// timer, if any. Timers are one-shot and mutually exclusive, so a single
    /// slot suffices.
    pub(crate) fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Whether the retry budget forbids another start attempt.
    pub(crate) fn retries_exhausted(&self) -> bool {
        match self.cfg.start_retries {
            0 => true,
            retries if retries > 0 => self.start_count >= retries as u32,
            _ => false,
        }
    }

    /// Status tuple rendered on the control socket: `state pid uptime` while
    /// a child is alive, `state start_count` during a retry burst, bare
    /// `state` otherwise.
    pub(crate) fn status_tuple(&self) -> Vec<String> {
        if let Some(pid) = self.pid {
            let uptime = self.start_ts.map(|ts| ts.elapsed().as_secs()).unwrap_or(0);
            return vec![
                self.state.to_string(),
                pid.to_string(),
                uptime.to_string(),
            ];
        }
        if self.start_count > 0 && self.state != SvcState::Fatal {
            return vec![self.state.to_string(), self.start_count.to_string()];
        }
        vec![self.state.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn service(yaml: &str) -> Service {
        let config = Config::from_yaml(yaml).unwrap();
        let cfg = config.run.values().next().unwrap().clone();
        Service::new(cfg)
    }

    #[test]
    fn fresh_service_is_down() {
        let svc = service("run: {a: a}");
        assert_eq!(svc.state, SvcState::Down);
        assert!(!svc.child_running());
        assert_eq!(svc.status_tuple(), vec!["down"]);
    }

    #[test]
    fn status_tuple_with_live_child() {
        let mut svc = service("run: {a: a}");
        svc.state = SvcState::Up;
        svc.pid = Some(4242);
        svc.start_ts = Some(Instant::now());
        let tuple = svc.status_tuple();
        assert_eq!(tuple[0], "up");
        assert_eq!(tuple[1], "4242");
        assert!(tuple[2].parse::<u64>().unwrap() < 5);
    }

    #[test]
    fn status_tuple_during_retry_burst() {
        let mut svc = service("run: {a: a}");
        svc.state = SvcState::Restart;
        svc.start_count = 2;
        assert_eq!(svc.status_tuple(), vec!["restart", "2"]);
    }

    #[test]
    fn status_tuple_after_fatal_is_bare_state() {
        let mut svc = service("run: {a: a}");
        svc.state = SvcState::Fatal;
        svc.start_count = 3;
        assert_eq!(svc.status_tuple(), vec!["fatal"]);
    }

    #[test]
    fn retry_budget() {
        let mut svc = service("run: {a: {cmd: a, start_retries: 3}}");
        svc.start_count = 2;
        assert!(!svc.retries_exhausted());
        svc.start_count = 3;
        assert!(svc.retries_exhausted());

        let one_shot = service("run: {a: {cmd: a, start_retries: 0}}");
        assert!(one_shot.retries_exhausted());

        let mut unbounded = service("run: {a: {cmd: a, start_retries: -1}}");
        unbounded.start_count = 10_000;
        assert!(!unbounded.retries_exhausted());
    }
}
