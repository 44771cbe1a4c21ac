//! Verb dispatch: maps protocol lines onto supervisor operations.

use std::str::FromStr;

use nix::sys::signal::Signal;

use super::SessionReply;
use crate::supervisor::Supervisor;

/// Protocol verbs, case-sensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verb {
    Up,
    Once,
    Down,
    Pause,
    Cont,
    Hup,
    Alarm,
    Int,
    Quit,
    Usr1,
    Usr2,
    Term,
    Kill,
    Status,
}

pub(crate) struct UnknownVerb;

impl FromStr for Verb {
    type Err = UnknownVerb;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Verb::Up),
            "once" => Ok(Verb::Once),
            "down" => Ok(Verb::Down),
            "pause" => Ok(Verb::Pause),
            "cont" => Ok(Verb::Cont),
            "hup" => Ok(Verb::Hup),
            "alarm" => Ok(Verb::Alarm),
            "int" => Ok(Verb::Int),
            "quit" => Ok(Verb::Quit),
            "usr1" => Ok(Verb::Usr1),
            "usr2" => Ok(Verb::Usr2),
            "term" => Ok(Verb::Term),
            "kill" => Ok(Verb::Kill),
            "status" => Ok(Verb::Status),
            _ => Err(UnknownVerb),
        }
    }
}

impl Verb {
    /// The signal forwarded to the child, for plain signal verbs.
    fn signal(self) -> Option<Signal> {
        match self {
            Verb::Pause => Some(Signal::SIGSTOP),
            Verb::Cont => Some(Signal::SIGCONT),
            Verb::Hup => Some(Signal::SIGHUP),
            Verb::Alarm => Some(Signal::SIGALRM),
            Verb::Int => Some(Signal::SIGINT),
            Verb::Quit => Some(Signal::SIGQUIT),
            Verb::Usr1 => Some(Signal::SIGUSR1),
            Verb::Usr2 => Some(Signal::SIGUSR2),
            Verb::Term => Some(Signal::SIGTERM),
            Verb::Kill => Some(Signal::SIGKILL),
            Verb::Up | Verb::Once | Verb::Down | Verb::Status => None,
        }
    }
}

/// Executes one accepted request line against the supervisor.
///
/// Bare `status` reports every service; `quit` and `.` close the connection;
/// `<verb> <svc>` runs the op and echoes the line back with the result,
/// `fail` standing in for a falsy op return. Anything else echoes back with
/// `unknown`.
pub(crate) fn dispatch(sup: &mut Supervisor, line: &str) -> SessionReply {
    match line {
        "quit" | "." => return SessionReply::Close,
        "status" => return SessionReply::Lines(sup.status_lines()),
        _ => {}
    }

    let mut parts = line.splitn(2, ' ');
    let verb = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("");

    let Ok(verb) = verb.parse::<Verb>() else {
        return unknown(line);
    };
    if target.is_empty() || !sup.has_service(target) {
        return unknown(line);
    }

    let result = match verb {
        Verb::Up => sup.op_up(target),
        Verb::Once => sup.op_once(target),
        Verb::Down => sup.op_down(target),
        Verb::Status => sup.op_status(target),
        other => match other.signal() {
            Some(sig) => sup.op_signal(target, sig),
            None => None,
        },
    };
    let rendered = result.unwrap_or_else(|| "fail".to_string());
    SessionReply::Lines(vec![format!("{line} {rendered}")])
}

fn unknown(line: &str) -> SessionReply {
    SessionReply::Lines(vec![format!("{line} unknown")])
}
