//! Configuration from `WF_*` environment variables.
//!
//! Every setting has a documented default; the environment only overrides.
//! Tests use [`load_with`] with an explicit lookup closure instead of
//! mutating process env.

use std::env;
use std::path::PathBuf;

use crate::error::AppError;

pub const DEFAULT_SCHEDULER_ADDRESS: &str = "tcp://localhost:9912";
pub const DEFAULT_SCHEDULER_LISTEN: &str = "tcp://*:9912";
pub const DEFAULT_AGENT_LISTEN: &str = "tcp://*:9924";
pub const DEFAULT_SCHEDULER_DB_PATH: &str = "/usr/local/etc/webfleet/scheduler.json";
pub const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 30;

/// Fully-resolved process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Scheduler connect address used by client calls.
    pub scheduler_address: String,
    /// Identity used when a sub-command takes no explicit app id.
    pub app_id: String,
    /// Registry JSON file, read at startup and on SIGHUP.
    pub scheduler_db_path: PathBuf,
    /// Scheduler bind endpoint (`tcp://*:port` binds the wildcard address).
    pub scheduler_listen: String,
    /// Agent bind endpoint.
    pub agent_listen: String,
    /// Timeout for agent calls, in seconds. Scheduler calls use a fixed
    /// short timeout independent of this.
    pub agent_timeout_secs: u64,
    /// Services started by `webfleet serve` when none are named.
    pub mode: Vec<String>,
    pub log_level: String,
}

/// Load config from the process environment.
pub fn load() -> Result<Config, AppError> {
    load_with(|key| env::var(key).ok())
}

/// Loader with an explicit env lookup, so tests control every value.
pub fn load_with<F>(get: F) -> Result<Config, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    let or_default = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

    let app_id = match get("WF_APP_ID") {
        Some(id) if !id.is_empty() => id,
        _ => current_username()?,
    };

    let agent_timeout_secs = match get("WF_AGENT_TIMEOUT") {
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|e| AppError::Config(format!("WF_AGENT_TIMEOUT '{raw}': {e}")))?,
        None => DEFAULT_AGENT_TIMEOUT_SECS,
    };

    let mode = get("WF_MODE")
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Ok(Config {
        scheduler_address: or_default("WF_SCHEDULER_ADDRESS", DEFAULT_SCHEDULER_ADDRESS),
        app_id,
        scheduler_db_path: PathBuf::from(or_default(
            "WF_SCHEDULER_DB_PATH",
            DEFAULT_SCHEDULER_DB_PATH,
        )),
        scheduler_listen: or_default("WF_SCHEDULER_LISTEN", DEFAULT_SCHEDULER_LISTEN),
        agent_listen: or_default("WF_AGENT_LISTEN", DEFAULT_AGENT_LISTEN),
        agent_timeout_secs,
        mode,
        log_level: or_default("WF_LOG_LEVEL", "info"),
    })
}

/// Name of the account this process runs as — the default app id.
fn current_username() -> Result<String, AppError> {
    let uid = nix::unistd::getuid();
    let user = nix::unistd::User::from_uid(uid)
        .map_err(|e| AppError::Config(format!("cannot resolve uid {uid}: {e}")))?
        .ok_or_else(|| AppError::Config(format!("no account for uid {uid}")))?;
    Ok(user.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_env_empty() {
        let cfg = load_with(env(&[])).unwrap();
        assert_eq!(cfg.scheduler_address, DEFAULT_SCHEDULER_ADDRESS);
        assert_eq!(cfg.scheduler_listen, DEFAULT_SCHEDULER_LISTEN);
        assert_eq!(cfg.agent_listen, DEFAULT_AGENT_LISTEN);
        assert_eq!(cfg.agent_timeout_secs, DEFAULT_AGENT_TIMEOUT_SECS);
        assert_eq!(cfg.scheduler_db_path, PathBuf::from(DEFAULT_SCHEDULER_DB_PATH));
        assert!(cfg.mode.is_empty());
        assert!(!cfg.app_id.is_empty(), "app id defaults to current username");
    }

    #[test]
    fn env_overrides_apply() {
        let cfg = load_with(env(&[
            ("WF_SCHEDULER_ADDRESS", "tcp://sched.example:9912"),
            ("WF_APP_ID", "alice"),
            ("WF_AGENT_TIMEOUT", "5"),
        ]))
        .unwrap();
        assert_eq!(cfg.scheduler_address, "tcp://sched.example:9912");
        assert_eq!(cfg.app_id, "alice");
        assert_eq!(cfg.agent_timeout_secs, 5);
    }

    #[test]
    fn mode_splits_on_commas() {
        let cfg = load_with(env(&[("WF_MODE", "scheduler, agent")])).unwrap();
        assert_eq!(cfg.mode, vec!["scheduler".to_string(), "agent".to_string()]);
    }

    #[test]
    fn bad_timeout_is_a_config_error() {
        let err = load_with(env(&[("WF_AGENT_TIMEOUT", "soon")])).unwrap_err();
        assert!(err.to_string().contains("WF_AGENT_TIMEOUT"));
    }

    #[test]
    fn empty_app_id_falls_back_to_username() {
        let cfg = load_with(env(&[("WF_APP_ID", "")])).unwrap();
        assert!(!cfg.app_id.is_empty());
    }
}
