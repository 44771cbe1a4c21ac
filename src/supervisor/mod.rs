//! Supervision engine: the service table, the per-service state machine,
//! signal fan-out and the cooperative event loop.
//!
//! All mutable state is owned by the [`Supervisor`] and touched only from
//! [`Supervisor::run`]'s loop. Watchers, timers and sessions run as separate
//! tasks but only ever publish events back into the loop.

mod service;
mod spawn;

pub use service::SvcState;
pub use spawn::SpawnError;

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::config::{Config, GlobalConfig};
use crate::control::{
    dispatch, session, ControlError, ControlListener, ControlRequest, ControlStream, ListenAddr,
    RequestKind,
};
use crate::event::channel::{pub_sub, EventConsumer, EventPublisher};
use crate::event::ServiceEvent;
use service::Service;
use spawn::spawn_child;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error("unable to install signal handler: {0}")]
    Signals(std::io::Error),
    #[error("run may only be called once")]
    AlreadyRan,
}

/// Owns the service table and every other mutable piece of engine state.
pub struct Supervisor {
    services: BTreeMap<String, Service>,
    global: GlobalConfig,
    events: EventPublisher<ServiceEvent>,
    event_rx: Option<EventConsumer<ServiceEvent>>,
    requests: mpsc::Sender<ControlRequest>,
    request_rx: Option<mpsc::Receiver<ControlRequest>>,
    sessions: HashMap<u64, AbortHandle>,
    next_conn: u64,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        let (events, event_rx) = pub_sub();
        let (requests, request_rx) = mpsc::channel(64);
        let services = config
            .run
            .into_iter()
            .map(|(name, cfg)| (name, Service::new(cfg)))
            .collect();
        Supervisor {
            services,
            global: config.global,
            events,
            event_rx: Some(event_rx),
            requests,
            request_rx: Some(request_rx),
            sessions: HashMap::new(),
            next_conn: 0,
        }
    }

    /// Starts every declared service and runs the event loop. Returns once a
    /// `TERM` arrives, or an `INT` arrives with no child alive.
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        let (mut event_rx, mut request_rx) = match (self.event_rx.take(), self.request_rx.take()) {
            (Some(events), Some(requests)) => (events, requests),
            _ => return Err(SupervisorError::AlreadyRan),
        };

        let mut sigterm = signal(SignalKind::terminate()).map_err(SupervisorError::Signals)?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(SupervisorError::Signals)?;
        let mut sighup = signal(SignalKind::hangup()).map_err(SupervisorError::Signals)?;

        let listener = match &self.global.listen {
            Some(addr) => Some(ControlListener::bind(addr).await?),
            None => None,
        };

        let names: Vec<String> = self.services.keys().cloned().collect();
        for name in &names {
            self.start_service(name);
        }

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("TERM received, stopping all services");
                    self.signal_all(Signal::SIGTERM);
                    break;
                }
                _ = sigint.recv() => {
                    // with children alive the operator gets to INT again once
                    // they are gone; only a childless INT terminates the loop
                    if self.signal_all(Signal::SIGINT) == 0 {
                        info!("INT received with no child alive, exiting");
                        break;
                    }
                }
                _ = sighup.recv() => {
                    self.signal_all(Signal::SIGHUP);
                }
                Some(event) = event_rx.recv() => self.handle_event(event),
                Some(request) = request_rx.recv() => self.handle_request(request),
                accepted = accept_on(&listener) => match accepted {
                    Ok(stream) => self.spawn_session(stream),
                    Err(err) => debug!(error = %err, "control accept failed"),
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        for (_, session) in self.sessions.drain() {
            session.abort();
        }
        if let Some(ListenAddr::Unix(path)) = &self.global.listen {
            let _ = std::fs::remove_file(path);
        }
    }

    fn handle_event(&mut self, event: ServiceEvent) {
        match event {
            ServiceEvent::Exited {
                name,
                generation,
                code,
            } => self.on_child_exit(&name, generation, code),
            ServiceEvent::StartWaitElapsed { name, generation } => {
                self.on_start_wait(&name, generation)
            }
            ServiceEvent::StopWaitElapsed { name, generation } => {
                self.on_stop_wait(&name, generation)
            }
            ServiceEvent::RestartDue { name, generation } => self.on_restart_due(&name, generation),
        }
    }

    /// The service, provided the event generation is still current.
    fn current(&mut self, name: &str, generation: u64) -> Option<&mut Service> {
        self.services
            .get_mut(name)
            .filter(|svc| svc.generation == generation)
    }

    fn on_child_exit(&mut self, name: &str, generation: u64, code: i32) {
        let restart = {
            let Some(svc) = self.current(name, generation) else {
                return;
            };
            svc.last_status = Some(code);
            svc.pid = None;
            svc.watcher = None;
            svc.cancel_timer();
            match svc.state {
                SvcState::Stop => {
                    svc.start_count = 0;
                    svc.state = SvcState::Down;
                    info!(service = name, code, "service stopped");
                    false
                }
                SvcState::Start | SvcState::Up if svc.once => {
                    svc.start_count = 0;
                    svc.state = SvcState::Fatal;
                    info!(service = name, code, "one-shot service finished");
                    false
                }
                SvcState::Start => {
                    svc.state = SvcState::Fail;
                    warn!(service = name, code, "service died within start_wait");
                    true
                }
                SvcState::Up => {
                    warn!(service = name, code, "service exited");
                    true
                }
                state => {
                    debug!(service = name, state = %state, code, "stray child exit");
                    false
                }
            }
        };
        if restart {
            self.schedule_restart(name);
        }
    }

    /// Applies the retry budget after a crash or spawn failure: arm the
    /// restart timer, or give up and go fatal.
    fn schedule_restart(&mut self, name: &str) {
        let events = self.events.clone();
        let Some(svc) = self.services.get_mut(name) else {
            return;
        };
        svc.cancel_timer();
        if svc.retries_exhausted() {
            svc.state = SvcState::Fatal;
            warn!(
                service = name,
                start_count = svc.start_count,
                "restart budget exhausted, going fatal"
            );
            return;
        }
        svc.state = SvcState::Restart;
        let delay = svc.cfg.restart_delay;
        let generation = svc.generation;
        let service = name.to_string();
        debug!(service = name, delay_ms = delay.as_millis() as u64, "restart scheduled");
        svc.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.publish(ServiceEvent::RestartDue {
                name: service,
                generation,
            });
        }));
    }

    fn on_restart_due(&mut self, name: &str, generation: u64) {
        let due = self
            .current(name, generation)
            .map(|svc| svc.state == SvcState::Restart)
            .unwrap_or(false);
        if due {
            self.start_service(name);
        }
    }

    fn on_start_wait(&mut self, name: &str, generation: u64) {
        let Some(svc) = self.current(name, generation) else {
            return;
        };
        if svc.state != SvcState::Start {
            return;
        }
        if svc.child_running() {
            svc.start_count = 0;
            svc.state = SvcState::Up;
            info!(service = name, pid = svc.pid, "service up");
        } else {
            // normally unreachable: the exit callback cancels this timer
            svc.state = SvcState::Fail;
        }
    }

    fn on_stop_wait(&mut self, name: &str, generation: u64) {
        let Some(svc) = self.current(name, generation) else {
            return;
        };
        if svc.state != SvcState::Stop {
            return;
        }
        if let Some(pid) = svc.pid {
            warn!(service = name, pid, "stop_wait elapsed, sending KILL");
            let _ = signal_pid(pid, Signal::SIGKILL);
        }
    }

    /// Spawns a child for `name` and arms the `start_wait` check. Returns the
    /// new pid; on spawn failure the restart path has already been scheduled.
    fn start_service(&mut self, name: &str) -> Option<u32> {
        let (cfg, generation) = {
            let svc = self.services.get_mut(name)?;
            svc.cancel_timer();
            svc.generation += 1;
            svc.start_count = svc.start_count.saturating_add(1);
            (svc.cfg.clone(), svc.generation)
        };

        let child = match spawn_child(&cfg, self.global.umask) {
            Ok(child) => child,
            Err(err) => {
                debug!(service = name, error = %err, "spawn failed");
                self.schedule_restart(name);
                return None;
            }
        };
        let Some(pid) = child.id() else {
            debug!(service = name, "child gone before it could be watched");
            self.schedule_restart(name);
            return None;
        };

        let watcher = tokio::spawn(watch_child(
            child,
            name.to_string(),
            generation,
            self.events.clone(),
        ));

        let events = self.events.clone();
        let timer_name = name.to_string();
        let delay = cfg.start_wait;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.publish(ServiceEvent::StartWaitElapsed {
                name: timer_name,
                generation,
            });
        });

        let svc = self.services.get_mut(name)?;
        svc.pid = Some(pid);
        svc.start_ts = Some(Instant::now());
        svc.state = SvcState::Start;
        svc.watcher = Some(watcher);
        svc.timer = Some(timer);
        debug!(
            service = name,
            pid,
            start_count = svc.start_count,
            "service starting"
        );
        Some(pid)
    }

    pub(crate) fn has_service(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// `up` op: start the service unless a child is already running.
    pub(crate) fn op_up(&mut self, name: &str) -> Option<String> {
        self.start_with_once(name, false)
    }

    /// `once` op: like `up`, but a natural exit ends in `fatal`.
    pub(crate) fn op_once(&mut self, name: &str) -> Option<String> {
        self.start_with_once(name, true)
    }

    fn start_with_once(&mut self, name: &str, once: bool) -> Option<String> {
        {
            let svc = self.services.get_mut(name)?;
            if svc.child_running() {
                return None;
            }
            svc.once = once;
        }
        self.start_service(name).map(|pid| pid.to_string())
    }

    /// `down` op: `TERM` the child and arm the `stop_wait` kill.
    pub(crate) fn op_down(&mut self, name: &str) -> Option<String> {
        let events = self.events.clone();
        let svc = self.services.get_mut(name)?;
        let pid = svc.pid?;
        let result = signal_pid(pid, Signal::SIGTERM)
            .ok()
            .map(|_| "1".to_string());
        svc.state = SvcState::Stop;
        svc.cancel_timer();
        if !svc.cfg.stop_wait.is_zero() {
            let delay = svc.cfg.stop_wait;
            let generation = svc.generation;
            let service = name.to_string();
            svc.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events.publish(ServiceEvent::StopWaitElapsed {
                    name: service,
                    generation,
                });
            }));
        }
        info!(service = name, pid, "service stopping");
        result
    }

    /// Signal ops (`pause`, `cont`, `hup`, ...): forward the signal to the
    /// child if one is running.
    pub(crate) fn op_signal(&mut self, name: &str, sig: Signal) -> Option<String> {
        let svc = self.services.get(name)?;
        let pid = svc.pid?;
        match signal_pid(pid, sig) {
            Ok(()) => Some("1".to_string()),
            Err(err) => {
                debug!(service = name, pid, signal = %sig, error = %err, "signal failed");
                None
            }
        }
    }

    pub(crate) fn op_status(&self, name: &str) -> Option<String> {
        self.services
            .get(name)
            .map(|svc| svc.status_tuple().join(" "))
    }

    pub(crate) fn status_lines(&self) -> Vec<String> {
        self.services
            .iter()
            .map(|(name, svc)| format!("{name} {}", svc.status_tuple().join(" ")))
            .collect()
    }

    /// Sends `sig` to every live child; returns how many were signalled.
    fn signal_all(&mut self, sig: Signal) -> usize {
        let mut signalled = 0;
        for (name, svc) in &self.services {
            let Some(pid) = svc.pid else { continue };
            match signal_pid(pid, sig) {
                Ok(()) => signalled += 1,
                Err(err) => debug!(service = %name, pid, error = %err, "signal failed"),
            }
        }
        debug!(signal = %sig, count = signalled, "signal fan-out");
        signalled
    }

    fn handle_request(&mut self, request: ControlRequest) {
        match request.kind {
            RequestKind::Line { line, reply } => {
                let response = dispatch::dispatch(self, &line);
                let _ = reply.send(response);
            }
            RequestKind::Closed => {
                self.sessions.remove(&request.conn);
            }
        }
    }

    fn spawn_session(&mut self, stream: ControlStream) {
        let conn = self.next_conn;
        self.next_conn += 1;
        let requests = self.requests.clone();
        let handle = tokio::spawn(session::serve(stream, conn, requests));
        self.sessions.insert(conn, handle.abort_handle());
        debug!(conn, "control connection accepted");
    }
}

async fn watch_child(
    mut child: tokio::process::Child,
    name: String,
    generation: u64,
    events: EventPublisher<ServiceEvent>,
) {
    let code = match child.wait().await {
        Ok(status) => {
            debug!(service = %name, %status, "child reaped");
            status.code().unwrap_or(0)
        }
        Err(err) => {
            debug!(service = %name, error = %err, "wait on child failed");
            0
        }
    };
    let _ = events.publish(ServiceEvent::Exited {
        name,
        generation,
        code,
    });
}

fn signal_pid(pid: u32, sig: Signal) -> nix::Result<()> {
    kill(Pid::from_raw(pid as i32), sig)
}

async fn accept_on(listener: &Option<ControlListener>) -> std::io::Result<ControlStream> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}
