//! Controller configuration
//!
//! Every knob can be set from the command line or the environment. The
//! `build` and `workflow` subcommands each carry their own settings on top of
//! the shared [`CommonConfig`].

use std::net::SocketAddr;
use std::time::Duration;

use clap::Args;

/// Settings shared by both controllers
#[derive(Debug, Clone, Args)]
pub struct CommonConfig {
    /// Namespace holding the activities, workflows and environments
    #[arg(long, short = 'n', env = "KEEL_NAMESPACE", default_value = "jx")]
    pub namespace: String,

    /// Log intended writes instead of performing them
    #[arg(long, env = "KEEL_DRY_RUN")]
    pub dry_run: bool,

    /// Base URL of the git provider REST API
    #[arg(long, env = "KEEL_GIT_API_URL", default_value = "https://api.github.com")]
    pub git_api_url: String,

    #[arg(long, env = "KEEL_GIT_TOKEN", default_value = "", hide_env_values = true)]
    pub git_token: String,

    /// Per-call timeout for git provider requests, in seconds
    #[arg(long, env = "KEEL_GIT_TIMEOUT", default_value = "30", value_parser = parse_seconds)]
    pub git_timeout: Duration,

    /// Address the health endpoint listens on
    #[arg(long, env = "KEEL_HEALTH_ADDR", default_value = "0.0.0.0:8080")]
    pub health_addr: SocketAddr,
}

impl CommonConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.namespace.is_empty() {
            anyhow::bail!("namespace cannot be empty");
        }

        if !self.git_api_url.starts_with("http://") && !self.git_api_url.starts_with("https://") {
            anyhow::bail!("git_api_url must start with http:// or https://");
        }

        if self.git_timeout.is_zero() {
            anyhow::bail!("git_timeout must be greater than 0");
        }

        Ok(())
    }
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            namespace: "jx".to_string(),
            dry_run: false,
            git_api_url: "https://api.github.com".to_string(),
            git_token: String::new(),
            git_timeout: Duration::from_secs(30),
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

/// Settings of the build status controller
#[derive(Debug, Clone, Args)]
pub struct BuildConfig {
    /// Report pipeline status back to the git provider as commit statuses
    #[arg(long, env = "KEEL_GIT_REPORTING")]
    pub git_reporting: bool,

    /// Commit status context used when the activity carries none
    #[arg(long, env = "KEEL_STATUS_CONTEXT", default_value = "keel")]
    pub status_context: String,

    /// Commit status target URL; `{owner}`, `{repository}`, `{branch}`,
    /// `{build}` and `{context}` are substituted
    #[arg(long, env = "KEEL_TARGET_URL_TEMPLATE", default_value = "")]
    pub target_url_template: String,

    /// Pause between attempts to reconcile an activity, in seconds
    #[arg(long, default_value = "20", value_parser = parse_seconds)]
    pub retry_interval: Duration,

    #[arg(long, default_value_t = 3)]
    pub retry_attempts: u32,

    /// Bucket receiving build logs when the team settings name no location
    #[arg(long, env = "KEEL_LOG_BUCKET_URL")]
    pub log_bucket_url: Option<String>,
}

impl BuildConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retry_attempts == 0 {
            anyhow::bail!("retry_attempts must be greater than 0");
        }

        if self.git_reporting && self.status_context.is_empty() {
            anyhow::bail!("status_context cannot be empty when git reporting is enabled");
        }

        if let Some(url) = &self.log_bucket_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("log_bucket_url must start with http:// or https://");
            }
        }

        Ok(())
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            git_reporting: false,
            status_context: "keel".to_string(),
            target_url_template: String::new(),
            retry_interval: Duration::from_secs(20),
            retry_attempts: 3,
            log_bucket_url: None,
        }
    }
}

/// Settings of the promotion workflow controller
#[derive(Debug, Clone, Args)]
pub struct WorkflowConfig {
    /// How often open promotion pull requests are polled, in seconds
    #[arg(long, env = "KEEL_POLL_INTERVAL", default_value = "20", value_parser = parse_seconds)]
    pub poll_interval: Duration,

    /// Branches whose builds are promoted
    #[arg(long, env = "KEEL_RELEASE_BRANCHES", value_delimiter = ',', default_value = "master")]
    pub release_branches: Vec<String>,

    /// Leave green promotion pull requests for a human to merge
    #[arg(long)]
    pub no_merge_pull_request: bool,

    /// Complete a promotion as soon as its pull request merges
    #[arg(long)]
    pub no_wait_for_update_pipeline: bool,

    /// Environment promoted into when no environment is set to auto-promote
    #[arg(long, env = "KEEL_DEFAULT_ENVIRONMENT", default_value = "staging")]
    pub default_environment: String,

    /// Pause between attempts to record an opened promotion, in seconds
    #[arg(long, default_value = "2", value_parser = parse_seconds)]
    pub retry_interval: Duration,

    #[arg(long, default_value_t = 3)]
    pub retry_attempts: u32,

    /// Process the current state once and exit
    #[arg(long)]
    pub no_watch: bool,
}

impl WorkflowConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if self.release_branches.iter().all(|branch| branch.trim().is_empty()) {
            anyhow::bail!("at least one release branch is required");
        }

        if self.default_environment.is_empty() {
            anyhow::bail!("default_environment cannot be empty");
        }

        if self.retry_attempts == 0 {
            anyhow::bail!("retry_attempts must be greater than 0");
        }

        Ok(())
    }

    pub fn is_release_branch(&self, branch: &str) -> bool {
        self.release_branches
            .iter()
            .any(|release| release.trim().eq_ignore_ascii_case(branch))
    }

    pub fn auto_merge(&self) -> bool {
        !self.no_merge_pull_request
    }

    pub fn wait_for_update(&self) -> bool {
        !self.no_wait_for_update_pipeline
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(20),
            release_branches: vec!["master".to_string()],
            no_merge_pull_request: false,
            no_wait_for_update_pipeline: false,
            default_environment: "staging".to_string(),
            retry_interval: Duration::from_secs(2),
            retry_attempts: 3,
            no_watch: false,
        }
    }
}

/// Parses a whole number of seconds
pub fn parse_seconds(value: &str) -> Result<Duration, String> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| format!("invalid number of seconds '{value}': {e}"))
}
