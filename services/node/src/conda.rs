//! Conda environment provisioning on the node.
//!
//! The conductor pushes the set of required environments; this manager
//! converges the local conda installation toward it: `conda create`,
//! optional custom setup script, pip package install, and full
//! recreation when the spec carries the force-recreate marker. A spec
//! that failed once is not retried until it changes.

use std::collections::HashMap;

use symphony_proto::CondaEnvSpec;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// First line of a `custom_script` that forces recreation of an
/// already-present environment.
pub const FORCE_RECREATE_MARKER: &str = "__SYMPHONY_FORCE_RECREATE__";

struct ManagerState {
    /// Env name → spec key of the last failed attempt.
    failed_specs: HashMap<String, String>,
}

/// Serialized access to the local conda installation.
pub struct CondaEnvManager {
    conda_path: String,
    state: Mutex<ManagerState>,
}

impl CondaEnvManager {
    pub fn new() -> Self {
        let conda_path = std::env::var("CONDA_PATH")
            .ok()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "conda".to_string());
        Self {
            conda_path,
            state: Mutex::new(ManagerState {
                failed_specs: HashMap::new(),
            }),
        }
    }

    /// Names of the environments currently present, sorted and deduped.
    pub async fn list_env_names(&self) -> Vec<String> {
        let Some(output) = run_shell(&self.conda_cmd(&["env", "list", "--json"])).await else {
            return Vec::new();
        };
        let Ok(payload) = serde_json::from_str::<serde_json::Value>(&output) else {
            warn!("failed to parse conda env list output");
            return Vec::new();
        };

        let mut names: Vec<String> = payload
            .get("envs")
            .and_then(|e| e.as_array())
            .map(|paths| {
                paths
                    .iter()
                    .filter_map(|p| p.as_str())
                    .filter_map(|p| p.rsplit('/').next())
                    .filter(|n| !n.is_empty())
                    .map(|n| n.to_string())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names.dedup();
        names
    }

    /// Converge toward the given environment set. Returns the names
    /// present afterwards.
    pub async fn ensure_envs(&self, envs: &[CondaEnvSpec]) -> Vec<String> {
        let mut state = self.state.lock().await;
        let mut current = self.list_env_names().await;

        for env in envs {
            let name = env.name.trim();
            if name.is_empty() {
                continue;
            }
            let python_version = env.python_version.trim();
            if python_version.is_empty() {
                warn!(env = %name, "skipping conda env: missing python_version");
                continue;
            }

            let (force_recreate, custom_script) = parse_custom_script(&env.custom_script);
            let spec_key = spec_key(python_version, &env.packages, &custom_script);

            if current.iter().any(|n| n == name) {
                state.failed_specs.remove(name);
                if !force_recreate {
                    continue;
                }
                info!(env = %name, "force recreating existing conda env");
                if !self.remove_env(name).await {
                    warn!(env = %name, "failed to remove existing conda env");
                    continue;
                }
                current.retain(|n| n != name);
            } else if !force_recreate && state.failed_specs.get(name) == Some(&spec_key) {
                info!(env = %name, "skipping conda env retry; same spec failed previously");
                continue;
            }

            if self
                .create_env(name, python_version, &env.packages, &custom_script)
                .await
            {
                current.push(name.to_string());
                current.sort();
                state.failed_specs.remove(name);
            } else {
                state.failed_specs.insert(name.to_string(), spec_key);
            }
        }

        current
    }

    async fn create_env(
        &self,
        name: &str,
        python_version: &str,
        packages: &[String],
        custom_script: &str,
    ) -> bool {
        info!(env = %name, python = %python_version, "creating conda env");
        let python_arg = format!("python={python_version}");
        let create = self.conda_cmd(&["create", "-y", "-n", name, &python_arg]);
        if run_shell(&create).await.is_none() {
            warn!(env = %name, "conda env creation failed");
            return false;
        }

        if !custom_script.is_empty() {
            info!(env = %name, "running custom script");
            if run_shell(custom_script).await.is_none() {
                warn!(env = %name, "custom script failed");
                self.cleanup_failed_env(name).await;
                return false;
            }
        }

        if !packages.is_empty() {
            info!(env = %name, "upgrading pip");
            let upgrade = self.conda_cmd(&[
                "run", "-n", name, "python", "-m", "pip", "install", "--upgrade", "pip",
            ]);
            if run_shell(&upgrade).await.is_none() {
                warn!(env = %name, "pip upgrade failed");
                self.cleanup_failed_env(name).await;
                return false;
            }

            info!(env = %name, packages = packages.len(), "installing pip packages");
            let mut args = vec!["run", "-n", name, "pip", "install"];
            args.extend(packages.iter().map(String::as_str));
            if run_shell(&self.conda_cmd(&args)).await.is_none() {
                warn!(env = %name, "pip package install failed");
                self.cleanup_failed_env(name).await;
                return false;
            }
        }
        true
    }

    async fn remove_env(&self, name: &str) -> bool {
        info!(env = %name, "removing conda env");
        run_shell(&self.conda_cmd(&["env", "remove", "-y", "-n", name]))
            .await
            .is_some()
    }

    async fn cleanup_failed_env(&self, name: &str) {
        info!(env = %name, "cleaning up partially created conda env");
        if !self.remove_env(name).await {
            warn!(env = %name, "failed to clean up partially created conda env");
        }
    }

    fn conda_cmd(&self, args: &[&str]) -> String {
        std::iter::once(self.conda_path.as_str())
            .chain(args.iter().copied())
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Default for CondaEnvManager {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_custom_script(raw: &str) -> (bool, String) {
    let raw = raw.trim();
    if raw.is_empty() {
        return (false, String::new());
    }
    let mut lines = raw.lines();
    if lines.next().map(str::trim) == Some(FORCE_RECREATE_MARKER) {
        return (true, lines.collect::<Vec<_>>().join("\n").trim().to_string());
    }
    (false, raw.to_string())
}

fn spec_key(python_version: &str, packages: &[String], custom_script: &str) -> String {
    serde_json::json!({
        "python_version": python_version,
        "packages": packages,
        "custom_script": custom_script,
    })
    .to_string()
}

/// POSIX single-quote escaping, after shlex.
pub fn shell_quote(raw: &str) -> String {
    if !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c))
    {
        return raw.to_string();
    }
    format!("'{}'", raw.replace('\'', r#"'"'"'"#))
}

/// Wrap a command so it runs inside a conda environment.
pub fn activation_command(env_name: &str, command: &[String]) -> Vec<String> {
    let quoted_cmd = command
        .iter()
        .map(|part| shell_quote(part))
        .collect::<Vec<_>>()
        .join(" ");
    let script = format!(
        "eval \"$(conda shell.bash hook)\" && conda activate {} && exec {}",
        shell_quote(env_name),
        quoted_cmd
    );
    vec!["bash".to_string(), "-lc".to_string(), script]
}

async fn run_shell(cmd: &str) -> Option<String> {
    let output = match tokio::process::Command::new("bash")
        .arg("-lc")
        .arg(cmd)
        .output()
        .await
    {
        Ok(output) => output,
        Err(e) => {
            warn!(cmd, error = %e, "failed to start command");
            return None;
        }
    };

    if !output.status.success() {
        warn!(
            cmd,
            code = output.status.code().unwrap_or(-1),
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "command failed"
        );
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_passes_safe_words_through() {
        assert_eq!(shell_quote("python3.11"), "python3.11");
        assert_eq!(shell_quote("/usr/bin/env"), "/usr/bin/env");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
    }

    #[test]
    fn activation_wraps_with_exec() {
        let wrapped = activation_command(
            "ml",
            &["python".to_string(), "serve.py".to_string(), "--port 1".to_string()],
        );
        assert_eq!(wrapped[0], "bash");
        assert_eq!(wrapped[1], "-lc");
        assert!(wrapped[2].contains("conda activate ml"));
        assert!(wrapped[2].contains("exec python serve.py '--port 1'"));
    }

    #[test]
    fn force_recreate_marker_is_stripped() {
        let (force, script) =
            parse_custom_script(&format!("{FORCE_RECREATE_MARKER}\npip install x"));
        assert!(force);
        assert_eq!(script, "pip install x");

        let (force, script) = parse_custom_script("pip install y");
        assert!(!force);
        assert_eq!(script, "pip install y");

        let (force, script) = parse_custom_script("");
        assert!(!force);
        assert!(script.is_empty());
    }

    #[test]
    fn spec_keys_distinguish_specs() {
        let a = spec_key("3.11", &["numpy".to_string()], "");
        let b = spec_key("3.11", &["numpy".to_string()], "");
        let c = spec_key("3.12", &["numpy".to_string()], "");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
