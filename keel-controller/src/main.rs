//! Keel
//!
//! Kubernetes controllers that keep pipeline activities in step with the
//! builds running in the cluster and promote released versions through
//! their environments.
//!
//! Architecture:
//! - Configuration: command line flags with environment fallbacks
//! - Repositories: cluster access behind traits (activities, workflows, runs, logs)
//! - Watch: resource watch streams normalized into events
//! - Services: status reconciliation, git reporting, promotion workflows
//! - Scheduler: single workflow worker plus the promotion poll timer
//!
//! `keel build` runs the build controller, `keel workflow` the promotion
//! controller. Both serve a health endpoint until shut down.

mod api;
mod config;
mod repository;
mod scheduler;
mod service;
#[cfg(test)]
mod testing;
mod watch;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keel_client::{GitHubClient, GitProvider};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{BuildConfig, CommonConfig, WorkflowConfig};
use crate::repository::{KubeStore, ResourceStore};
use crate::scheduler::{ChannelHandler, PollTimer, WorkflowWorker};
use crate::service::{
    BuildEventHandler, BuildStatusReconciler, CompletionEffects, GitStatusReporter,
    PromotionPoller, PullRequestPromoter, WorkflowEngine,
};
use crate::watch::{EventHandler, ResourceWatcher, WatchedKind};

#[derive(Debug, Parser)]
#[command(name = "keel", version, about = "Pipeline activity and promotion controllers")]
struct Cli {
    #[command(flatten)]
    common: CommonConfig,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reconcile activity status from build pods and pipeline runs
    Build(BuildConfig),
    /// Promote released activities through their workflows
    Workflow(WorkflowConfig),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "keel_controller=info,keel_client=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    cli.common.validate()?;
    match &cli.command {
        Command::Build(build) => build.validate()?,
        Command::Workflow(workflow) => workflow.validate()?,
    }

    info!(
        namespace = %cli.common.namespace,
        dry_run = cli.common.dry_run,
        "Starting Keel"
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown requested");
            cancel.cancel();
        }
    });

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let store = KubeStore::new(client, cli.common.namespace.clone());
    let git = git_provider(&cli.common)?;

    let health = spawn_health_server(&cli.common, cancel.clone()).await?;

    let result = match cli.command {
        Command::Build(build) => run_build(&cli.common, build, store, git, cancel.clone()).await,
        Command::Workflow(workflow) => {
            run_workflow(&cli.common, workflow, store, git, cancel.clone()).await
        }
    };

    cancel.cancel();
    if let Err(e) = health.await {
        error!("Health server task failed: {}", e);
    }
    info!("Keel stopped");
    result
}

fn git_provider(common: &CommonConfig) -> Result<Arc<dyn GitProvider>> {
    let http = reqwest::Client::builder()
        .timeout(common.git_timeout)
        .build()
        .context("Failed to build HTTP client")?;
    Ok(Arc::new(GitHubClient::with_client(
        common.git_api_url.clone(),
        common.git_token.clone(),
        http,
    )))
}

async fn spawn_health_server(
    common: &CommonConfig,
    cancel: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let listener = TcpListener::bind(common.health_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", common.health_addr))?;
    info!("Health endpoint listening on {}", common.health_addr);

    Ok(tokio::spawn(async move {
        let shutdown = async move { cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, api::create_router())
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("Health server error: {}", e);
        }
    }))
}

async fn run_build(
    common: &CommonConfig,
    build: BuildConfig,
    store: KubeStore,
    git: Arc<dyn GitProvider>,
    cancel: CancellationToken,
) -> Result<()> {
    let shared = Arc::new(store.clone());
    let completion = CompletionEffects::new(
        shared.clone(),
        shared.clone(),
        git.clone(),
        build.log_bucket_url.clone(),
        common.dry_run,
    );
    let reporter = build.git_reporting.then(|| {
        GitStatusReporter::new(
            git.clone(),
            build.status_context.clone(),
            build.target_url_template.clone(),
        )
    });
    let reconciler = BuildStatusReconciler::new(
        shared.clone(),
        completion,
        reporter,
        build.retry_interval,
        build.retry_attempts,
        common.dry_run,
    );
    let handler: Arc<dyn EventHandler> = Arc::new(BuildEventHandler::new(reconciler, shared));

    info!(
        git_reporting = build.git_reporting,
        context = %build.status_context,
        "Build controller initialized"
    );
    let watcher = ResourceWatcher::new(store, handler, cancel);
    tokio::join!(
        watcher.run(WatchedKind::Pods),
        watcher.run(WatchedKind::PipelineRuns)
    );
    Ok(())
}

async fn run_workflow(
    common: &CommonConfig,
    workflow: WorkflowConfig,
    store: KubeStore,
    git: Arc<dyn GitProvider>,
    cancel: CancellationToken,
) -> Result<()> {
    let shared: Arc<dyn ResourceStore> = Arc::new(store.clone());
    let promoter = Arc::new(PullRequestPromoter::new(shared.clone(), git.clone()));
    let poller = PromotionPoller::new(
        shared.clone(),
        git,
        promoter.clone(),
        workflow.clone(),
        common.dry_run,
    );
    let mut engine =
        WorkflowEngine::new(shared.clone(), promoter, poller, workflow.clone(), common.dry_run);

    info!(
        release_branches = ?workflow.release_branches,
        auto_merge = workflow.auto_merge(),
        wait_for_update = workflow.wait_for_update(),
        "Workflow controller initialized"
    );

    if workflow.no_watch {
        info!("Processing activities once");
        for item in shared
            .list_workflows()
            .await
            .context("Failed to list workflows")?
        {
            engine.on_workflow(item);
        }
        for activity in shared
            .list_activities()
            .await
            .context("Failed to list activities")?
        {
            engine.on_activity(activity).await;
        }
        engine.poll_promotions().await;
        return Ok(());
    }

    let (worker, sender) = WorkflowWorker::new(engine);
    let worker = tokio::spawn(worker.run());

    let timer = PollTimer::new(workflow.poll_interval, sender.clone(), cancel.clone());
    let handler: Arc<dyn EventHandler> = Arc::new(ChannelHandler::new(sender));
    let watcher = ResourceWatcher::new(store, handler, cancel);

    tokio::join!(
        watcher.run(WatchedKind::Workflows),
        watcher.run(WatchedKind::Activities),
        timer.run()
    );
    // Every sender is gone once the watchers and the timer have returned
    drop(watcher);
    worker.await.context("Workflow worker panicked")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_workflow_subcommand() {
        let cli = Cli::try_parse_from([
            "keel",
            "--namespace",
            "cd",
            "workflow",
            "--release-branches",
            "main,release",
            "--no-watch",
        ])
        .unwrap();
        assert_eq!(cli.common.namespace, "cd");
        let Command::Workflow(workflow) = cli.command else {
            panic!("expected the workflow subcommand");
        };
        assert_eq!(workflow.release_branches, vec!["main", "release"]);
        assert!(workflow.no_watch);
    }

    #[test]
    fn test_cli_parses_build_subcommand() {
        let cli = Cli::try_parse_from(["keel", "build", "--retry-attempts", "5"]).unwrap();
        let Command::Build(build) = cli.command else {
            panic!("expected the build subcommand");
        };
        assert_eq!(build.retry_attempts, 5);
        assert_eq!(build.status_context, "keel");
    }
}
