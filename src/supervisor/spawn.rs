//! Child spawn procedure: shell execution, credentials and umask.

use std::io;

use nix::sys::stat::{umask, Mode};
use nix::unistd::{Group, User};
use thiserror::Error;
use tokio::process::{Child, Command};

use crate::config::ServiceConfig;

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("unknown user `{0}`")]
    UnknownUser(String),
    #[error("unknown group `{0}`")]
    UnknownGroup(String),
    #[error("credentials lookup failed: {0}")]
    Credentials(#[from] nix::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Spawns one child for `cfg`. The command line goes through `sh -c` so shell
/// syntax works; group is applied before user so the uid change cannot revoke
/// the gid change; the effective umask (service override falling back to the
/// global one) is applied between fork and exec.
pub(crate) fn spawn_child(cfg: &ServiceConfig, global_umask: Option<u32>) -> Result<Child, SpawnError> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&cfg.cmd);

    if let Some(name) = &cfg.group {
        let group =
            Group::from_name(name)?.ok_or_else(|| SpawnError::UnknownGroup(name.clone()))?;
        cmd.gid(group.gid.as_raw());
    }
    if let Some(name) = &cfg.user {
        let user = User::from_name(name)?.ok_or_else(|| SpawnError::UnknownUser(name.clone()))?;
        cmd.uid(user.uid.as_raw());
    }
    if let Some(mask) = cfg.umask.or(global_umask) {
        // between fork and exec: only async-signal-safe calls
        unsafe {
            cmd.pre_exec(move || {
                umask(Mode::from_bits_truncate(mask as nix::libc::mode_t));
                Ok(())
            });
        }
    }

    Ok(cmd.spawn()?)
}
