//! Run-file loading and validation.
//!
//! The run file is YAML with three sections: `run` (the service map), `global`
//! (listen endpoint and umask) and `log`. Shape errors are fatal at load time;
//! per-service timing fields fall back to defaults when missing or out of
//! range.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_yaml::Value;
use thiserror::Error;

use crate::control::ListenAddr;

pub const DEFAULT_START_RETRIES: i32 = 8;
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_START_WAIT: Duration = Duration::from_secs(1);
pub const DEFAULT_STOP_WAIT: Duration = Duration::ZERO;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Commands must be passed as a HASH ref")]
    RunNotAMapping,
    #[error("Missing command list")]
    MissingCommandList,
    #[error("Missing command for '{0}'")]
    MissingCommand(String),
    #[error("invalid service definition for '{name}': {source}")]
    InvalidService {
        name: String,
        source: serde_yaml::Error,
    },
    #[error("invalid umask `{mask}` for '{name}'")]
    InvalidUmask { name: String, mask: String },
    #[error("invalid umask `{0}`")]
    InvalidGlobalUmask(String),
    #[error("invalid listen address `{0}`")]
    InvalidListen(String),
    #[error("unable to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// One declared service: the command line plus its restart policy and
/// credentials. Immutable once the config is built.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub name: String,
    pub cmd: String,
    /// `0` disables restart, a positive value caps consecutive attempts,
    /// a negative value retries forever.
    pub start_retries: i32,
    pub restart_delay: Duration,
    pub start_wait: Duration,
    /// Grace period between `TERM` and `KILL`; zero disables the `KILL`.
    pub stop_wait: Duration,
    pub umask: Option<u32>,
    pub user: Option<String>,
    pub group: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalConfig {
    pub listen: Option<ListenAddr>,
    pub umask: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LogConfig {
    /// Numeric level 1..9 (fatal..trace).
    pub level: Option<u8>,
    pub file: Option<PathBuf>,
    /// chrono format string for log timestamps.
    pub ts_format: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub run: BTreeMap<String, ServiceConfig>,
    pub global: GlobalConfig,
    pub log: LogConfig,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    run: Option<Value>,
    #[serde(default)]
    global: RawGlobal,
    #[serde(default)]
    log: LogConfig,
}

#[derive(Debug, Default, Deserialize)]
struct RawGlobal {
    listen: Option<String>,
    umask: Option<UmaskValue>,
}

#[derive(Debug, Default, Deserialize)]
struct RawService {
    cmd: Option<String>,
    start_retries: Option<i32>,
    restart_delay: Option<f64>,
    start_wait: Option<f64>,
    stop_wait: Option<f64>,
    umask: Option<UmaskValue>,
    user: Option<String>,
    group: Option<String>,
}

/// Umask as written in YAML: a quoted octal string, or a bare scalar whose
/// digits are reinterpreted in base 8 (`022` and `"022"` mean the same mask).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UmaskValue {
    Num(u64),
    Text(String),
}

impl UmaskValue {
    fn to_octal(&self) -> Option<u32> {
        let digits = match self {
            UmaskValue::Num(n) => n.to_string(),
            UmaskValue::Text(s) => s.trim().trim_start_matches("0o").to_string(),
        };
        u32::from_str_radix(&digits, 8).ok().filter(|m| *m <= 0o777)
    }
}

impl std::fmt::Display for UmaskValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UmaskValue::Num(n) => write!(f, "{n}"),
            UmaskValue::Text(s) => f.write_str(s),
        }
    }
}

impl Config {
    /// Parses and validates a run file.
    pub fn from_yaml(input: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_yaml::from_str(input)?;
        if value.is_null() {
            return Err(ConfigError::RunNotAMapping);
        }
        let raw: RawConfig = serde_yaml::from_value(value)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let entries = match raw.run {
            Some(Value::Mapping(m)) => m,
            _ => return Err(ConfigError::RunNotAMapping),
        };
        if entries.is_empty() {
            return Err(ConfigError::MissingCommandList);
        }

        let mut run = BTreeMap::new();
        for (key, value) in entries {
            let name = match key.as_str() {
                Some(name) => name.to_string(),
                None => return Err(ConfigError::RunNotAMapping),
            };
            let service = ServiceConfig::from_value(name.clone(), value)?;
            run.insert(name, service);
        }

        let global = GlobalConfig {
            listen: raw
                .global
                .listen
                .map(|s| s.parse::<ListenAddr>().map_err(ConfigError::InvalidListen))
                .transpose()?,
            umask: raw
                .global
                .umask
                .map(|m| {
                    m.to_octal()
                        .ok_or_else(|| ConfigError::InvalidGlobalUmask(m.to_string()))
                })
                .transpose()?,
        };

        Ok(Config {
            run,
            global,
            log: raw.log,
        })
    }
}

impl ServiceConfig {
    fn from_value(name: String, value: Value) -> Result<Self, ConfigError> {
        let raw = match value {
            // a plain string is promoted to `{ cmd: <string> }`
            Value::String(cmd) if !cmd.is_empty() => RawService {
                cmd: Some(cmd),
                ..RawService::default()
            },
            Value::Mapping(_) => serde_yaml::from_value(value)
                .map_err(|source| ConfigError::InvalidService {
                    name: name.clone(),
                    source,
                })?,
            _ => return Err(ConfigError::MissingCommand(name)),
        };

        let cmd = match raw.cmd {
            Some(cmd) if !cmd.is_empty() => cmd,
            _ => return Err(ConfigError::MissingCommand(name)),
        };
        let umask = raw
            .umask
            .map(|m| {
                m.to_octal().ok_or_else(|| ConfigError::InvalidUmask {
                    name: name.clone(),
                    mask: m.to_string(),
                })
            })
            .transpose()?;

        Ok(ServiceConfig {
            name,
            cmd,
            start_retries: raw.start_retries.unwrap_or(DEFAULT_START_RETRIES),
            restart_delay: positive_secs(raw.restart_delay, DEFAULT_RESTART_DELAY),
            start_wait: positive_secs(raw.start_wait, DEFAULT_START_WAIT),
            stop_wait: non_negative_secs(raw.stop_wait, DEFAULT_STOP_WAIT),
            umask,
            user: raw.user,
            group: raw.group,
        })
    }
}

fn positive_secs(value: Option<f64>, default: Duration) -> Duration {
    match value {
        Some(secs) if secs > 0.0 => Duration::from_secs_f64(secs),
        _ => default,
    }
}

fn non_negative_secs(value: Option<f64>, default: Duration) -> Duration {
    match value {
        Some(secs) if secs >= 0.0 => Duration::from_secs_f64(secs),
        _ => default,
    }
}
