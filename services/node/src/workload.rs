//! Per-kind workload specification decoding.
//!
//! The conductor treats the specification as an opaque blob; this is
//! the node boundary where it gets a versioned schema. Only the exec
//! backend is available here — docker specs decode but are rejected at
//! apply time.

use std::collections::BTreeMap;

use serde::Deserialize;
use symphony_proto::DeployKind;
use thiserror::Error;

use crate::cron::{CronSchedule, CronZone};
use crate::repo::RepoConfig;

/// Schema version this node understands.
const SPEC_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("unsupported specification version {0}")]
    UnsupportedVersion(u32),

    #[error("no runtime backend for kind {0:?} on this node")]
    UnsupportedKind(DeployKind),

    #[error("invalid specification: {0}")]
    Invalid(String),
}

/// Restart behavior after a child exits non-zero from RUNNING.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicyType {
    Never,
    OnFailure,
}

/// Restart policy surface. `backoff_seconds` is the base of an
/// exponential backoff; attempts are bounded by `max_restarts` within
/// `restart_window_sec`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RestartPolicy {
    #[serde(rename = "type", default = "default_policy_type")]
    pub policy_type: RestartPolicyType,
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: f64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_window_sec")]
    pub restart_window_sec: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            policy_type: default_policy_type(),
            backoff_seconds: default_backoff_seconds(),
            max_restarts: default_max_restarts(),
            restart_window_sec: default_restart_window_sec(),
        }
    }
}

fn default_policy_type() -> RestartPolicyType {
    RestartPolicyType::OnFailure
}

fn default_backoff_seconds() -> f64 {
    0.5
}

fn default_max_restarts() -> u32 {
    10
}

fn default_restart_window_sec() -> u64 {
    300
}

fn default_version() -> u32 {
    SPEC_VERSION
}

fn default_stop_signal() -> String {
    "SIGTERM".to_string()
}

fn default_stop_grace_ms() -> u64 {
    10_000
}

fn default_log_limit_lines() -> usize {
    crate::logs::DEFAULT_LOG_CAPACITY
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Scheduled full restart, independent of the failure restart policy.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AutoRestartSpec {
    #[serde(default)]
    pub enabled: bool,
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

/// Exec workload specification.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecSpec {
    #[serde(default = "default_version")]
    pub version: u32,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    /// Conda environment the command is activated in.
    #[serde(default)]
    pub conda_env: Option<String>,
    /// Git repository cloned as the working directory.
    #[serde(default)]
    pub git_repo: Option<String>,
    #[serde(default)]
    pub git_ref: Option<String>,
    #[serde(default)]
    pub git_token: Option<String>,
    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_log_limit_lines")]
    pub log_limit_lines: usize,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub auto_restart: Option<AutoRestartSpec>,
}

impl ExecSpec {
    /// The git settings, when a repository workdir is configured.
    pub fn repo_config(&self) -> Option<RepoConfig> {
        let repo = self.git_repo.as_deref()?.trim();
        if repo.is_empty() {
            return None;
        }
        Some(RepoConfig {
            repo: repo.to_string(),
            git_ref: self
                .git_ref
                .as_deref()
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(String::from),
            token: self
                .git_token
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from),
        })
    }

    /// The parsed restart schedule, when enabled.
    pub fn auto_restart_schedule(&self) -> Option<(CronSchedule, CronZone)> {
        let auto = self.auto_restart.as_ref().filter(|a| a.enabled)?;
        let schedule = CronSchedule::parse(&auto.cron).ok()?;
        let zone = CronZone::parse(&auto.timezone).ok()?;
        Some((schedule, zone))
    }
}

/// Decode and validate a specification for `kind`.
pub fn decode(kind: DeployKind, spec: &serde_json::Value) -> Result<ExecSpec, WorkloadError> {
    match kind {
        DeployKind::Docker => Err(WorkloadError::UnsupportedKind(kind)),
        DeployKind::Exec => {
            let spec: ExecSpec = serde_json::from_value(spec.clone())
                .map_err(|e| WorkloadError::Invalid(e.to_string()))?;
            if spec.version != SPEC_VERSION {
                return Err(WorkloadError::UnsupportedVersion(spec.version));
            }
            if spec.command.is_empty() || spec.command.iter().any(|part| part.is_empty()) {
                return Err(WorkloadError::Invalid(
                    "command must be a non-empty list of non-empty strings".to_string(),
                ));
            }
            if signal_number(&spec.stop_signal).is_none() {
                return Err(WorkloadError::Invalid(format!(
                    "unknown stop signal '{}'",
                    spec.stop_signal
                )));
            }
            if let Some(auto) = spec.auto_restart.as_ref().filter(|a| a.enabled) {
                CronSchedule::parse(&auto.cron)
                    .map_err(|e| WorkloadError::Invalid(format!("auto_restart: {e}")))?;
                CronZone::parse(&auto.timezone)
                    .map_err(|e| WorkloadError::Invalid(format!("auto_restart: {e}")))?;
            }
            Ok(spec)
        }
    }
}

/// Map a signal name to its number. Accepts the `SIG`-prefixed and bare
/// forms of the signals a supervisor plausibly sends.
pub fn signal_number(name: &str) -> Option<i32> {
    match name.to_uppercase().as_str() {
        "TERM" | "SIGTERM" => Some(libc::SIGTERM),
        "INT" | "SIGINT" => Some(libc::SIGINT),
        "HUP" | "SIGHUP" => Some(libc::SIGHUP),
        "QUIT" | "SIGQUIT" => Some(libc::SIGQUIT),
        "USR1" | "SIGUSR1" => Some(libc::SIGUSR1),
        "USR2" | "SIGUSR2" => Some(libc::SIGUSR2),
        "KILL" | "SIGKILL" => Some(libc::SIGKILL),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_exec_spec_gets_defaults() {
        let spec = decode(DeployKind::Exec, &json!({"command": ["/bin/true"]})).unwrap();
        assert_eq!(spec.version, 1);
        assert_eq!(spec.stop_signal, "SIGTERM");
        assert_eq!(spec.stop_grace_ms, 10_000);
        assert_eq!(spec.log_limit_lines, crate::logs::DEFAULT_LOG_CAPACITY);
        assert_eq!(spec.restart_policy.policy_type, RestartPolicyType::OnFailure);
        assert!((spec.restart_policy.backoff_seconds - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn full_exec_spec_roundtrips() {
        let spec = decode(
            DeployKind::Exec,
            &json!({
                "version": 1,
                "command": ["python", "serve.py"],
                "env": {"PORT": "9000"},
                "cwd": "/srv/app",
                "stop_signal": "SIGINT",
                "stop_grace_ms": 2000,
                "log_limit_lines": 500,
                "restart_policy": {"type": "never"},
            }),
        )
        .unwrap();
        assert_eq!(spec.command, vec!["python", "serve.py"]);
        assert_eq!(spec.env.get("PORT").map(String::as_str), Some("9000"));
        assert_eq!(spec.restart_policy.policy_type, RestartPolicyType::Never);
    }

    #[test]
    fn rejects_bad_specs() {
        assert!(decode(DeployKind::Exec, &json!({})).is_err());
        assert!(decode(DeployKind::Exec, &json!({"command": []})).is_err());
        assert!(decode(DeployKind::Exec, &json!({"command": ["x"], "version": 2})).is_err());
        assert!(decode(
            DeployKind::Exec,
            &json!({"command": ["x"], "stop_signal": "SIGWAT"})
        )
        .is_err());
        assert!(decode(
            DeployKind::Exec,
            &json!({
                "command": ["x"],
                "auto_restart": {"enabled": true, "cron": "not a cron"},
            })
        )
        .is_err());
        assert!(decode(
            DeployKind::Exec,
            &json!({
                "command": ["x"],
                "auto_restart": {"enabled": true, "cron": "0 3 * * *", "timezone": "Mars/Olympus"},
            })
        )
        .is_err());
    }

    #[test]
    fn conda_and_git_fields_decode() {
        let spec = decode(
            DeployKind::Exec,
            &json!({
                "command": ["python", "serve.py"],
                "conda_env": "ml",
                "git_repo": "https://example.com/org/app.git",
                "git_ref": "main",
                "git_token": "sekrit",
            }),
        )
        .unwrap();
        assert_eq!(spec.conda_env.as_deref(), Some("ml"));

        let repo = spec.repo_config().unwrap();
        assert_eq!(repo.repo, "https://example.com/org/app.git");
        assert_eq!(repo.git_ref.as_deref(), Some("main"));
        assert_eq!(repo.token.as_deref(), Some("sekrit"));
    }

    #[test]
    fn auto_restart_schedule_requires_enabled() {
        let disabled = decode(
            DeployKind::Exec,
            &json!({
                "command": ["x"],
                "auto_restart": {"enabled": false, "cron": "0 3 * * *"},
            }),
        )
        .unwrap();
        assert!(disabled.auto_restart_schedule().is_none());

        let enabled = decode(
            DeployKind::Exec,
            &json!({
                "command": ["x"],
                "auto_restart": {"enabled": true, "cron": "0 3 * * *"},
            }),
        )
        .unwrap();
        assert!(enabled.auto_restart_schedule().is_some());
    }

    #[test]
    fn docker_kind_is_unsupported_here() {
        let err = decode(DeployKind::Docker, &json!({"image": "alpine"})).unwrap_err();
        assert!(matches!(err, WorkloadError::UnsupportedKind(_)));
    }

    #[test]
    fn signal_names_resolve() {
        assert_eq!(signal_number("SIGTERM"), Some(libc::SIGTERM));
        assert_eq!(signal_number("term"), Some(libc::SIGTERM));
        assert_eq!(signal_number("KILL"), Some(libc::SIGKILL));
        assert_eq!(signal_number("SIGWAT"), None);
    }
}
