/*
 * 5D Labs Agent Platform - Kubernetes Goal Scheduler
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Goal scheduler service
//!
//! - `serve`: orchestrator with health endpoints and the job cleanup loop
//! - `schedule`: fulfil and schedule one goal from files
//! - `cleanup`: run job cleanup on its own
//! - `run`: entry point inside a goal job (init or monitor, from the environment)

use anyhow::{bail, Context, Result};
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use clap::{Parser, Subcommand};
use goal_scheduler::cache::FileSystemGoalCache;
use goal_scheduler::clients::{GitProjectLoader, GraphClient, TracingProgressLog};
use goal_scheduler::config::SchedulerConfig;
use goal_scheduler::execution::{run_init, run_monitor, InitContext, MonitorContext};
use goal_scheduler::goal::{ContainerRegistration, GoalEvent, ProviderType};
use goal_scheduler::k8s::fulfillment::{INPUT_DIR, PROJECT_DIR, RESULT_FILE};
use goal_scheduler::k8s::job_spec::{GOAL_EVENT_ENV, POD_NAME_ENV};
use goal_scheduler::k8s::lease::CleanupLease;
use goal_scheduler::k8s::{
    fulfill, read_namespace, ContainerGoalDefinition, FulfillmentContext, JobCleaner,
    KubernetesGoalScheduler, ResourceNaming, SchedulerRegistry,
};
use goal_scheduler::mode::{ProcessMode, ISOLATED_GOAL_ENV};
use goal_scheduler::secrets::provider::fetch_records;
use goal_scheduler::secrets::SECRET_ROOT;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

#[derive(Parser)]
#[command(name = "goal-scheduler")]
#[command(about = "Runs delivery goals as isolated Kubernetes jobs")]
#[command(version)]
struct Cli {
    /// Scheduler configuration file
    #[arg(long, env = "GOAL_SCHEDULER_CONFIG", default_value = DEFAULT_CONFIG_PATH, global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator: health endpoints plus the job cleanup loop
    Serve {
        #[arg(long, default_value = "0.0.0.0:8080")]
        listen: String,
    },

    /// Fulfil a container registration for a goal and schedule it as a job
    Schedule {
        /// Goal event (JSON or YAML)
        #[arg(long)]
        goal: PathBuf,

        /// Container registration (JSON or YAML)
        #[arg(long)]
        registration: PathBuf,
    },

    /// Delete stale and zombie goal jobs
    Cleanup {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },

    /// Execute inside a goal job; the role comes from the environment
    Run,
}

#[derive(Clone)]
struct AppState {
    scheduler: Arc<KubernetesGoalScheduler>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        // Goal jobs reuse the scheduler pod's command line
        Commands::Serve { .. } if ProcessMode::from_env().is_isolated() => run_in_job(config).await,
        Commands::Serve { listen } => serve(config, &listen).await,
        Commands::Schedule { goal, registration } => schedule(config, &goal, &registration).await,
        Commands::Cleanup { once } => cleanup(config, once).await,
        Commands::Run => run_in_job(config).await,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,goal_scheduler=debug".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn load_config(path: &Path) -> Result<SchedulerConfig> {
    let mut config = match SchedulerConfig::from_mounted_file(&path.to_string_lossy()) {
        Ok(config) => {
            info!("Loaded scheduler configuration from {}", path.display());
            config
        }
        Err(e) => {
            error!(
                "Failed to load configuration from {}: {}. Using defaults.",
                path.display(),
                e
            );
            SchedulerConfig::default()
        }
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

async fn serve(config: SchedulerConfig, listen: &str) -> Result<()> {
    info!("Starting goal scheduler v{}", env!("CARGO_PKG_VERSION"));
    let client = kube::Client::try_default().await?;
    let namespace = read_namespace().await;
    info!(namespace = %namespace, "Connected to Kubernetes cluster");

    let scheduler = Arc::new(KubernetesGoalScheduler::new(
        client,
        Arc::new(config),
        &namespace,
        ProcessMode::from_env(),
    ));
    let cleanup_handle = scheduler.initialize().await?;

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(TimeoutLayer::new(Duration::from_secs(60)))
        .with_state(AppState { scheduler });

    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!("Goal scheduler HTTP server listening on {}", listen);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = cleanup_handle {
        handle.abort();
    }
    info!("Goal scheduler stopped");
    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "goal-scheduler",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if state.scheduler.template().is_err() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({
        "status": "ready",
        "service": "goal-scheduler",
        "namespace": state.scheduler.namespace(),
        "version": env!("CARGO_PKG_VERSION")
    })))
}

async fn schedule(config: SchedulerConfig, goal_path: &Path, registration_path: &Path) -> Result<()> {
    let mut goal: GoalEvent = read_document(goal_path)?;
    let registration: ContainerRegistration = read_document(registration_path)?;

    let client = kube::Client::try_default().await?;
    let namespace = read_namespace().await;
    let config = Arc::new(config);
    let scheduler = Arc::new(KubernetesGoalScheduler::new(
        client,
        config.clone(),
        &namespace,
        ProcessMode::from_env(),
    ));
    if let Some(handle) = scheduler.initialize().await? {
        // One-shot scheduling leaves cleanup to the service.
        handle.abort();
    }

    let graph = GraphClient::from_config(&config);
    let projects = GitProjectLoader::new(scm_token(&graph, &goal).await);
    let ctx = FulfillmentContext {
        config: &config,
        template_container: scheduler.template_container()?,
        credentials: &graph,
        projects: &projects,
    };
    fulfill(&ContainerGoalDefinition::new(registration), &mut goal, &ctx).await?;

    let mut registry = SchedulerRegistry::new();
    registry.register(scheduler.clone());
    let result = registry.schedule(&goal).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.is_success() {
        bail!(
            "{}",
            result.message.as_deref().unwrap_or("Goal could not be scheduled")
        );
    }
    Ok(())
}

async fn cleanup(config: SchedulerConfig, once: bool) -> Result<()> {
    let client = kube::Client::try_default().await?;
    let namespace = read_namespace().await;
    let holder = std::env::var(POD_NAME_ENV)
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("{}-{}", config.name, std::process::id()));
    let lease = CleanupLease::new(
        client.clone(),
        &namespace,
        &ResourceNaming::cleanup_lease_name(&config.name),
        &holder,
    )
    .with_lease_duration(config.cleanup_interval() * 2);
    let cleaner = JobCleaner::new(client, &namespace, &config.name, config.job_ttl()).with_lease(lease);

    if once {
        let report = cleaner.run_once().await;
        info!(
            stale = report.stale_jobs.len(),
            zombies = report.zombie_jobs.len(),
            failures = report.failures,
            skipped = report.skipped,
            "Cleanup finished"
        );
        return Ok(());
    }

    let handle = cleaner.spawn(config.cleanup_interval());
    shutdown_signal().await;
    handle.abort();
    Ok(())
}

async fn run_in_job(config: SchedulerConfig) -> Result<()> {
    let mode = ProcessMode::from_env();
    if !mode.is_isolated() {
        bail!("`run` executes inside a goal job only; {ISOLATED_GOAL_ENV} is not set");
    }
    let raw = std::env::var(GOAL_EVENT_ENV).with_context(|| format!("{GOAL_EVENT_ENV} is not set"))?;
    let goal: GoalEvent = serde_json::from_str(&raw).context("Invalid goal event")?;
    info!(goal = %goal.unique_name, mode = %mode, "Running goal job container");

    let graph = GraphClient::from_config(&config);
    let cache = FileSystemGoalCache::new(&config.cache.path);
    let project_dir = dir_from_env("ATOMIST_PROJECT_DIR", PROJECT_DIR);

    if mode == ProcessMode::IsolatedInit {
        let projects = GitProjectLoader::new(scm_token(&graph, &goal).await);
        let ctx = InitContext {
            config: &config,
            projects: &projects,
            credentials: &graph,
            cache: &cache,
            updater: &graph,
            project_dir,
            input_dir: dir_from_env("ATOMIST_INPUT_DIR", INPUT_DIR),
            secret_root: PathBuf::from(SECRET_ROOT),
        };
        run_init(&goal, &ctx).await?;
        return Ok(());
    }

    let client = kube::Client::try_default().await?;
    let namespace = read_namespace().await;
    let pod_name = std::env::var(POD_NAME_ENV)
        .or_else(|_| std::env::var("HOSTNAME"))
        .with_context(|| format!("Neither {POD_NAME_ENV} nor HOSTNAME is set"))?;
    let progress = TracingProgressLog::new(&goal.unique_name);
    let ctx = MonitorContext {
        config: &config,
        progress: &progress,
        cache: &cache,
        updater: &graph,
        project_dir,
        result_file: dir_from_env("ATOMIST_RESULT_FILE", RESULT_FILE),
    };
    let result = run_monitor(client, &namespace, &pod_name, &goal, &ctx).await;
    if !result.is_success() {
        bail!(
            "{}",
            result.message.as_deref().unwrap_or("Goal execution failed")
        );
    }
    Ok(())
}

/// Token of the push's SCM provider, used to clone private repositories.
async fn scm_token(graph: &GraphClient, goal: &GoalEvent) -> Option<String> {
    match fetch_records(graph, ProviderType::Scm, &[], goal).await {
        Ok(records) => records
            .iter()
            .find_map(|r| r.secret())
            .map(ToString::to_string),
        Err(e) => {
            warn!("Failed to look up SCM token, cloning anonymously: {}", e);
            None
        }
    }
}

fn dir_from_env(name: &str, default: &str) -> PathBuf {
    PathBuf::from(std::env::var(name).unwrap_or_else(|_| default.to_string()))
}

/// JSON is valid YAML, so one parser covers both.
fn read_document<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
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
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
