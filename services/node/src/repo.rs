//! Git repositories as exec workdirs.
//!
//! An exec specification may name a git repository; the supervisor
//! clones (or refreshes) it under the node's repo directory and runs
//! the child from there. Interactive git prompts are hard-disabled so
//! a missing credential fails fast instead of hanging the start.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("git {op} failed: authentication required for {repo}")]
    AuthRequired { op: &'static str, repo: String },

    #[error("git {op} failed: invalid/unauthorized token for {repo}")]
    BadToken { op: &'static str, repo: String },

    #[error("git {op} failed: {detail}")]
    Git { op: &'static str, detail: String },

    #[error("failed to run git: {0}")]
    Spawn(std::io::Error),

    #[error("preparing repo directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Repository settings extracted from an exec specification.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoConfig {
    pub repo: String,
    pub git_ref: Option<String>,
    pub token: Option<String>,
}

struct GitRunner {
    prefix: Vec<String>,
    env: HashMap<String, String>,
    repo: String,
}

impl GitRunner {
    fn new(config: &RepoConfig) -> Self {
        let mut env = HashMap::new();
        env.insert("GIT_TERMINAL_PROMPT".to_string(), "0".to_string());
        env.insert("GIT_ASKPASS".to_string(), "/bin/false".to_string());
        env.insert("SSH_ASKPASS".to_string(), "/bin/false".to_string());

        let mut prefix = vec!["git".to_string()];
        if let Some(token) = config.token.as_deref() {
            if config.repo.starts_with("http://") || config.repo.starts_with("https://") {
                // An auth header instead of a mutated URL; git over
                // HTTPS expects Basic auth as x-access-token:<token>.
                let basic = BASE64.encode(format!("x-access-token:{token}"));
                prefix.push("-c".to_string());
                prefix.push(format!("http.extraHeader=Authorization: Basic {basic}"));
            }
        }

        Self {
            prefix,
            env,
            repo: config.repo.clone(),
        }
    }

    async fn run(
        &self,
        op: &'static str,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> Result<bool, RepoError> {
        let mut command = tokio::process::Command::new(&self.prefix[0]);
        command.args(&self.prefix[1..]).args(args).envs(&self.env);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let output = command.output().await.map_err(RepoError::Spawn)?;
        if output.status.success() {
            return Ok(true);
        }
        debug!(op, code = output.status.code().unwrap_or(-1), "git command failed");
        Ok(false)
    }

    /// Like `run`, but failure is an error classified by stderr.
    async fn run_checked(
        &self,
        op: &'static str,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> Result<(), RepoError> {
        let mut command = tokio::process::Command::new(&self.prefix[0]);
        command.args(&self.prefix[1..]).args(args).envs(&self.env);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let output = command.output().await.map_err(RepoError::Spawn)?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.trim();
        let detail = if detail.is_empty() {
            "unknown git error".to_string()
        } else {
            detail.to_string()
        };
        Err(classify(op, &self.repo, self.prefix.len() > 1, detail))
    }
}

fn classify(op: &'static str, repo: &str, has_token: bool, detail: String) -> RepoError {
    let lowered = detail.to_lowercase();
    let auth_related = lowered.contains("authentication failed")
        || lowered.contains("could not read username")
        || lowered.contains("terminal prompts disabled")
        || lowered.contains("401")
        || lowered.contains("403");
    if auth_related {
        if has_token {
            return RepoError::BadToken {
                op,
                repo: repo.to_string(),
            };
        }
        return RepoError::AuthRequired {
            op,
            repo: repo.to_string(),
        };
    }
    RepoError::Git { op, detail }
}

/// Clone or refresh the repository for one deployment and return the
/// directory to run the child from.
pub async fn prepare(
    base_dir: &Path,
    deployment_key: &str,
    config: &RepoConfig,
) -> Result<PathBuf, RepoError> {
    let dest = base_dir.join(deployment_key);
    tokio::fs::create_dir_all(base_dir).await?;

    let git = GitRunner::new(config);
    let dest_str = dest.to_string_lossy().to_string();

    if dest.exists() {
        if dest.join(".git").exists() {
            // Refresh the existing checkout to the latest remote state.
            git.run_checked("remote set-url", &["remote", "set-url", "origin", &config.repo], Some(&dest))
                .await?;
            git.run_checked("fetch", &["fetch", "origin", "--prune", "--tags"], Some(&dest))
                .await?;

            match &config.git_ref {
                Some(git_ref) => checkout_ref(&git, &dest, git_ref).await?,
                None => {
                    git.run_checked("reset", &["reset", "--hard", "origin/HEAD"], Some(&dest))
                        .await?;
                }
            }
            git.run_checked("clean", &["clean", "-fd"], Some(&dest)).await?;
            info!(dest = %dest.display(), "git repo refreshed");
            return Ok(dest);
        }
        // Not a checkout we made; start over.
        tokio::fs::remove_dir_all(&dest).await?;
    }

    let mut clone_args = vec!["clone", "--depth", "1"];
    if let Some(git_ref) = &config.git_ref {
        clone_args.push("--branch");
        clone_args.push(git_ref);
    }
    clone_args.push(&config.repo);
    clone_args.push(&dest_str);
    git.run_checked("clone", &clone_args, None).await?;

    if let Some(git_ref) = &config.git_ref {
        checkout_ref(&git, &dest, git_ref).await?;
    }

    info!(dest = %dest.display(), "git repo cloned");
    Ok(dest)
}

/// Prefer a remote branch if one exists; otherwise treat the ref as a
/// tag or commit.
async fn checkout_ref(git: &GitRunner, dest: &Path, git_ref: &str) -> Result<(), RepoError> {
    let remote_ref = format!("refs/remotes/origin/{git_ref}");
    let is_branch = git
        .run("rev-parse", &["rev-parse", "--verify", &remote_ref], Some(dest))
        .await?;

    if is_branch {
        let origin_ref = format!("origin/{git_ref}");
        git.run_checked(
            "checkout",
            &["checkout", "-B", git_ref, &origin_ref],
            Some(dest),
        )
        .await?;
        git.run_checked("reset", &["reset", "--hard", &origin_ref], Some(dest))
            .await?;
        return Ok(());
    }

    git.run_checked("checkout", &["checkout", git_ref], Some(dest))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_becomes_a_basic_auth_header() {
        let git = GitRunner::new(&RepoConfig {
            repo: "https://example.com/org/app.git".to_string(),
            git_ref: None,
            token: Some("sekrit".to_string()),
        });
        assert_eq!(git.prefix[1], "-c");
        let header = &git.prefix[2];
        assert!(header.starts_with("http.extraHeader=Authorization: Basic "));
        let encoded = header.rsplit(' ').next().unwrap();
        assert_eq!(
            BASE64.decode(encoded).unwrap(),
            b"x-access-token:sekrit".to_vec()
        );
    }

    #[test]
    fn token_is_ignored_for_non_http_remotes() {
        let git = GitRunner::new(&RepoConfig {
            repo: "git@example.com:org/app.git".to_string(),
            git_ref: None,
            token: Some("sekrit".to_string()),
        });
        assert_eq!(git.prefix, vec!["git".to_string()]);
    }

    #[test]
    fn auth_failures_are_classified() {
        let err = classify("fetch", "https://x/y.git", false, "terminal prompts disabled".to_string());
        assert!(matches!(err, RepoError::AuthRequired { .. }));

        let err = classify("fetch", "https://x/y.git", true, "HTTP 403 returned".to_string());
        assert!(matches!(err, RepoError::BadToken { .. }));

        let err = classify("fetch", "https://x/y.git", false, "object not found".to_string());
        assert!(matches!(err, RepoError::Git { .. }));
    }

    #[test]
    fn interactive_prompts_are_disabled() {
        let git = GitRunner::new(&RepoConfig {
            repo: "https://example.com/org/app.git".to_string(),
            git_ref: None,
            token: None,
        });
        assert_eq!(git.env.get("GIT_TERMINAL_PROMPT").map(String::as_str), Some("0"));
        assert_eq!(git.env.get("GIT_ASKPASS").map(String::as_str), Some("/bin/false"));
    }
}
