//! Scheduling goals as Kubernetes Jobs.

use super::cleanup::JobCleaner;
use super::error::error_message;
use super::job_spec::JobSpecBuilder;
use super::lease::CleanupLease;
use super::naming::ResourceNaming;
use crate::config::{RetryConfig, SchedulerConfig};
use crate::error::{Error, Result};
use crate::goal::{ExecuteGoalResult, GoalEvent};
use crate::mode::ProcessMode;
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Container, Pod};
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Environment variables naming the schedulers allowed to run isolated goals.
pub const SCHEDULER_ALLOW_LIST_ENV: [&str; 2] = ["ATOMIST_GOAL_SCHEDULER", "ATOMIST_GOAL_LAUNCHER"];

/// Stable identifier of a scheduler implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SchedulerKind {
    Kubernetes,
}

impl SchedulerKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SchedulerKind::Kubernetes => "kubernetes",
        }
    }

    /// Allow-list value that isolates every goal with this scheduler.
    #[must_use]
    pub fn all_goals_value(self) -> String {
        format!("{}-all", self.as_str())
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait GoalScheduler: Send + Sync {
    fn kind(&self) -> SchedulerKind;

    fn supports(&self, goal: &GoalEvent) -> bool;

    /// Schedule the goal. Cluster failures come back as a failed result;
    /// only configuration problems are errors.
    async fn schedule(&self, goal: &GoalEvent) -> Result<ExecuteGoalResult>;
}

/// Schedulers by kind, consulted in kind order.
#[derive(Default)]
pub struct SchedulerRegistry {
    schedulers: BTreeMap<SchedulerKind, Arc<dyn GoalScheduler>>,
}

impl SchedulerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scheduler: Arc<dyn GoalScheduler>) {
        let kind = scheduler.kind();
        if self.schedulers.insert(kind, scheduler).is_some() {
            warn!(kind = %kind, "Replaced registered goal scheduler");
        }
    }

    #[must_use]
    pub fn get(&self, kind: SchedulerKind) -> Option<Arc<dyn GoalScheduler>> {
        self.schedulers.get(&kind).cloned()
    }

    /// First scheduler that volunteers for the goal.
    #[must_use]
    pub fn find(&self, goal: &GoalEvent) -> Option<Arc<dyn GoalScheduler>> {
        self.schedulers
            .values()
            .find(|scheduler| scheduler.supports(goal))
            .cloned()
    }

    pub async fn schedule(&self, goal: &GoalEvent) -> Result<ExecuteGoalResult> {
        let scheduler = self.find(goal).ok_or_else(|| {
            Error::ConfigError(format!(
                "No goal scheduler registered for goal {}",
                goal.unique_name
            ))
        })?;
        scheduler.schedule(goal).await
    }
}

/// Allow-list entries from raw environment values. Each value is a JSON
/// array of names or a single name.
#[must_use]
pub fn parse_allow_list(values: &[Option<String>]) -> Vec<String> {
    let mut entries = Vec::new();
    for value in values.iter().flatten() {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match serde_json::from_str::<Vec<String>>(value) {
            Ok(list) => entries.extend(list.into_iter().map(|s| s.trim().to_string())),
            Err(_) => entries.push(value.trim_matches('"').to_string()),
        }
    }
    entries
}

fn allow_list_from_env() -> Vec<String> {
    let values: Vec<Option<String>> = SCHEDULER_ALLOW_LIST_ENV
        .iter()
        .map(|name| std::env::var(name).ok())
        .collect();
    parse_allow_list(&values)
}

/// Whether a scheduler of `kind` should take `goal`.
#[must_use]
pub fn supports_goal(
    kind: SchedulerKind,
    mode: ProcessMode,
    isolate_all: bool,
    allow_list: &[String],
    goal: &GoalEvent,
) -> bool {
    // Goal jobs run this binary too and must never schedule further jobs
    if mode.is_isolated() {
        return false;
    }
    let allowed = allow_list.iter().any(|e| e == kind.as_str());
    let all_goals = allow_list.iter().any(|e| *e == kind.all_goals_value());
    all_goals || isolate_all || (goal.isolated && allowed)
}

/// Exponential delay for `attempt` (1-based), capped and jittered into the
/// upper half of the window.
#[must_use]
pub fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    let capped = retry
        .min_delay_ms
        .saturating_mul(1u64 << exponent)
        .min(retry.max_delay_ms);
    let jittered = if capped > 1 {
        rand::thread_rng().gen_range(capped / 2..=capped)
    } else {
        capped
    };
    Duration::from_millis(jittered)
}

/// Run `op` until it succeeds or the attempts are used up.
pub async fn retry_with_backoff<T, F, Fut>(retry: &RetryConfig, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= retry.attempts => return Err(e),
            Err(e) => {
                let delay = backoff_delay(retry, attempt);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {}ms: {}",
                    what,
                    attempt,
                    retry.attempts,
                    delay.as_millis(),
                    error_message(&e)
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

pub struct KubernetesGoalScheduler {
    client: Client,
    config: Arc<SchedulerConfig>,
    namespace: String,
    mode: ProcessMode,
    allow_list: Vec<String>,
    template: OnceCell<Pod>,
}

impl KubernetesGoalScheduler {
    #[must_use]
    pub fn new(
        client: Client,
        config: Arc<SchedulerConfig>,
        namespace: &str,
        mode: ProcessMode,
    ) -> Self {
        Self {
            client,
            config,
            namespace: namespace.to_string(),
            mode,
            allow_list: allow_list_from_env(),
            template: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn with_allow_list(mut self, allow_list: Vec<String>) -> Self {
        self.allow_list = allow_list;
        self
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Cached template pod.
    pub fn template(&self) -> Result<&Pod> {
        self.template.get().ok_or_else(|| {
            Error::ConfigError("No template pod spec cached, scheduler not initialized".to_string())
        })
    }

    /// First container of the template pod.
    pub fn template_container(&self) -> Result<&Container> {
        self.template()?
            .spec
            .as_ref()
            .and_then(|s| s.containers.first())
            .ok_or_else(|| Error::ConfigError("Template pod has no containers".to_string()))
    }

    /// Cache the template pod and, in the orchestrator, start the cleanup loop.
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn initialize(&self) -> Result<Option<JoinHandle<()>>> {
        let pod = self.load_template_pod().await?;
        let pod_name = pod.metadata.name.clone();
        // A second initialize keeps the first template
        let _ = self.template.set(pod);

        if self.mode.is_isolated() {
            return Ok(None);
        }

        let holder = pod_name.unwrap_or_else(|| format!("{}-{}", self.config.name, std::process::id()));
        let lease = CleanupLease::new(
            self.client.clone(),
            &self.namespace,
            &ResourceNaming::cleanup_lease_name(&self.config.name),
            &holder,
        )
        .with_lease_duration(self.config.cleanup_interval() * 2);
        let cleaner = JobCleaner::new(
            self.client.clone(),
            &self.namespace,
            &self.config.name,
            self.config.job_ttl(),
        )
        .with_lease(lease);
        Ok(Some(cleaner.spawn(self.config.cleanup_interval())))
    }

    async fn load_template_pod(&self) -> Result<Pod> {
        let pod_name = std::env::var("ATOMIST_POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .ok();

        let fetched = match &pod_name {
            Some(name) => {
                let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
                match pods.get(name).await {
                    Ok(pod) => Some(pod),
                    Err(e) => {
                        warn!(pod = %name, "Failed to read own pod: {}", error_message(&e.into()));
                        None
                    }
                }
            }
            None => None,
        };

        match (fetched, &self.config.pod_spec) {
            (Some(pod), _) => {
                info!(pod = ?pod.metadata.name, "Cached template pod");
                Ok(pod)
            }
            (None, Some(fallback)) => {
                info!("Using configured pod spec as job template");
                Ok(fallback.clone())
            }
            (None, None) => Err(Error::ConfigError(format!(
                "Unable to read pod {} and no fallback pod spec configured",
                pod_name.as_deref().unwrap_or("<unknown>")
            ))),
        }
    }

    /// Best-effort removal of an earlier job with the same name.
    async fn delete_existing(&self, jobs: &Api<Job>, name: &str) {
        match jobs.get(name).await {
            Ok(_) => {
                info!(job = %name, "Deleting existing job before rescheduling");
                if let Err(e) = jobs.delete(name, &DeleteParams::foreground()).await {
                    let e = Error::from(e);
                    if !e.is_not_found() {
                        warn!(job = %name, "Failed to delete existing job: {}", error_message(&e));
                    }
                }
            }
            Err(e) => {
                let e = Error::from(e);
                if e.is_not_found() {
                    debug!(job = %name, "No existing job");
                } else {
                    warn!(job = %name, "Failed to read existing job: {}", error_message(&e));
                }
            }
        }
    }
}

#[async_trait]
impl GoalScheduler for KubernetesGoalScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Kubernetes
    }

    fn supports(&self, goal: &GoalEvent) -> bool {
        supports_goal(
            self.kind(),
            self.mode,
            self.config.isolate_all,
            &self.allow_list,
            goal,
        )
    }

    #[instrument(skip_all, fields(goal = %goal.unique_name))]
    async fn schedule(&self, goal: &GoalEvent) -> Result<ExecuteGoalResult> {
        let job = JobSpecBuilder::new(&self.config, &self.namespace).build(self.template()?, goal)?;
        let name = job.metadata.name.clone().ok_or(Error::MissingObjectKey)?;
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.namespace);

        self.delete_existing(&jobs, &name).await;

        let (api, spec) = (&jobs, &job);
        let created = retry_with_backoff(&self.config.job.create_retry, "Job creation", move || async move {
            api.create(&PostParams::default(), spec)
                .await
                .map_err(Error::from)
        })
        .await;

        match created {
            Ok(_) => {
                info!(job = %name, namespace = %self.namespace, "Scheduled goal job");
                Ok(ExecuteGoalResult {
                    message: Some(format!(
                        "Scheduled goal {} as job {}/{}",
                        goal.unique_name, self.namespace, name
                    )),
                    ..ExecuteGoalResult::success()
                })
            }
            Err(e) => {
                let message = format!(
                    "Failed to schedule goal {} as job {}/{}: {}",
                    goal.unique_name,
                    self.namespace,
                    name,
                    error_message(&e)
                );
                warn!("{}", message);
                Ok(ExecuteGoalResult::failure(message))
            }
        }
    }
}
