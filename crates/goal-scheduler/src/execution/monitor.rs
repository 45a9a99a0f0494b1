//! Monitor mode: the first container of a goal job follows the goal
//! container to completion and reports the outcome.

use super::result::read_result_file;
use super::watch::{
    join_completion, stream_logs, wait_for_container, watch_container, ContainerExit,
    POLL_ATTEMPTS, POLL_INTERVAL,
};
use crate::cache::GoalCache;
use crate::clients::{GoalStateUpdater, GoalUpdate, ProgressLog};
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::goal::{CacheEntry, ExecuteGoalResult, GoalData, GoalEvent};
use crate::k8s::error::error_message;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::Client;
use std::path::PathBuf;
use tracing::{error, info, instrument, warn};

pub struct MonitorContext<'a> {
    pub config: &'a SchedulerConfig,
    pub progress: &'a dyn ProgressLog,
    pub cache: &'a dyn GoalCache,
    pub updater: &'a dyn GoalStateUpdater,
    pub project_dir: PathBuf,
    pub result_file: PathBuf,
}

/// Name of the container whose exit decides the goal: the registration's
/// first container, else the first container of the goal's service
/// registration. Service containers keep the registration's order; the
/// monitor itself is only prepended when the job is built.
#[must_use]
pub fn target_container_name(data: &GoalData, service_name: &str) -> Option<String> {
    if let Some(main) = data
        .container
        .as_ref()
        .and_then(|r| r.main_container())
        .filter(|c| !c.name().is_empty())
    {
        return Some(main.name().to_string());
    }
    let service = data
        .k8s_services()
        .find(|(name, _)| name.as_str() == service_name)
        .map(|(_, spec)| spec)?;
    service.container.first().map(|c| c.name.clone())
}

/// Cache entries to store after a run. A failed run keeps the classifiers
/// but drops every pattern so no bad output is stored as real artifacts.
#[must_use]
pub fn output_entries(output: &[CacheEntry], succeeded: bool) -> Vec<CacheEntry> {
    if succeeded {
        output.to_vec()
    } else {
        output.iter().map(CacheEntry::without_pattern).collect()
    }
}

/// Follow the goal container in `pod_name` and report the outcome.
#[instrument(skip_all, fields(goal = %goal.unique_name, pod = %pod_name))]
pub async fn run_monitor(
    client: Client,
    namespace: &str,
    pod_name: &str,
    goal: &GoalEvent,
    ctx: &MonitorContext<'_>,
) -> ExecuteGoalResult {
    let outcome = follow_goal_container(client, namespace, pod_name, goal, ctx).await;
    finish(goal, outcome, ctx).await
}

async fn follow_goal_container(
    client: Client,
    namespace: &str,
    pod_name: &str,
    goal: &GoalEvent,
    ctx: &MonitorContext<'_>,
) -> Result<ContainerExit> {
    let data = goal.goal_data()?;
    let service_name = data
        .container
        .as_ref()
        .and_then(|r| r.name.clone())
        .unwrap_or_else(|| ctx.config.name.clone());
    let container = target_container_name(&data, &service_name).ok_or_else(|| {
        Error::ConfigError(format!(
            "No container registration found for goal {}",
            goal.unique_name
        ))
    })?;

    let pods: Api<Pod> = Api::namespaced(client, namespace);
    wait_for_container(&pods, pod_name, &container, POLL_INTERVAL, POLL_ATTEMPTS).await?;
    info!(container = %container, "Goal container started, following it");

    let timeout = ctx.config.goal_timeout();
    join_completion(
        stream_logs(&pods, pod_name, &container, ctx.progress),
        watch_container(pods.clone(), pod_name, &container),
        timeout,
    )
    .await
}

/// Turn the execution outcome into the goal result, store output and push
/// the final goal state.
pub async fn finish(
    goal: &GoalEvent,
    outcome: Result<ContainerExit>,
    ctx: &MonitorContext<'_>,
) -> ExecuteGoalResult {
    let mut result = match &outcome {
        Ok(exit) => match read_result_file(&ctx.result_file).await {
            Ok(Some(result)) => result,
            Ok(None) => ExecuteGoalResult {
                message: Some(exit.describe()),
                ..ExecuteGoalResult::success()
            },
            Err(e) => ExecuteGoalResult::failure(format!(
                "Goal {} executed but its result could not be read: {}",
                goal.unique_name,
                error_message(&e)
            )),
        },
        Err(e) => ExecuteGoalResult::failure(format!(
            "Goal {} scheduled but execution failed: {}",
            goal.unique_name,
            error_message(e)
        )),
    };

    let output = goal
        .goal_data_or_default()
        .container
        .map(|r| r.output)
        .unwrap_or_default();
    if ctx.config.cache.enabled && !output.is_empty() {
        let entries = output_entries(&output, result.is_success());
        if let Err(e) = ctx.cache.put(goal, &ctx.project_dir, &entries).await {
            warn!("Failed to cache goal output: {}", error_message(&e));
            result.append_failure(&format!(
                "Goal {} executed but caching its output failed: {}",
                goal.unique_name,
                error_message(&e)
            ));
        }
    }

    if result.is_success() {
        info!("Goal {} succeeded", goal.unique_name);
    } else {
        error!(
            "Goal {} failed: {}",
            goal.unique_name,
            result.message.as_deref().unwrap_or_default()
        );
    }

    if let Err(e) = ctx.updater.update(goal, GoalUpdate::from_result(&result)).await {
        warn!("Failed to report goal state: {}", error_message(&e));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goal::{
        ContainerRegistration, GoalContainer, GoalState, K8sServiceSpec, ServiceRegistration,
    };
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingCache {
        puts: Mutex<Vec<Vec<CacheEntry>>>,
        fail: bool,
    }

    #[async_trait]
    impl GoalCache for RecordingCache {
        async fn put(&self, _goal: &GoalEvent, _dir: &Path, entries: &[CacheEntry]) -> Result<()> {
            self.puts.lock().unwrap().push(entries.to_vec());
            if self.fail {
                Err(Error::CacheError("disk full".to_string()))
            } else {
                Ok(())
            }
        }

        async fn restore(&self, _goal: &GoalEvent, _dir: &Path, _entries: &[CacheEntry]) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingUpdater {
        updates: Mutex<Vec<GoalUpdate>>,
    }

    #[async_trait]
    impl GoalStateUpdater for RecordingUpdater {
        async fn update(&self, _goal: &GoalEvent, update: GoalUpdate) -> Result<()> {
            self.updates.lock().unwrap().push(update);
            Ok(())
        }
    }

    struct NullLog;

    #[async_trait]
    impl ProgressLog for NullLog {
        async fn write(&self, _line: &str) -> Result<()> {
            Ok(())
        }

        async fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    fn goal_with_output() -> GoalEvent {
        let data = GoalData {
            container: Some(ContainerRegistration {
                containers: vec![GoalContainer::new("build", "node:20")],
                output: vec![
                    CacheEntry::new("dist", "dist/**"),
                    CacheEntry::new("coverage", "coverage/*.json"),
                ],
                ..Default::default()
            }),
            ..Default::default()
        };
        GoalEvent {
            unique_name: "build".to_string(),
            data: Some(data.to_json_string().unwrap()),
            ..Default::default()
        }
    }

    fn exit(code: i32) -> ContainerExit {
        ContainerExit {
            container: "build".to_string(),
            exit_code: code,
            reason: None,
            message: None,
        }
    }

    struct Harness {
        config: SchedulerConfig,
        cache: RecordingCache,
        updater: RecordingUpdater,
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn new(fail_cache: bool) -> Self {
            Self {
                config: SchedulerConfig::default(),
                cache: RecordingCache {
                    fail: fail_cache,
                    ..Default::default()
                },
                updater: RecordingUpdater::default(),
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn ctx(&self) -> MonitorContext<'_> {
            MonitorContext {
                config: &self.config,
                progress: &NullLog,
                cache: &self.cache,
                updater: &self.updater,
                project_dir: self.dir.path().to_path_buf(),
                result_file: self.dir.path().join("result.json"),
            }
        }
    }

    #[tokio::test]
    async fn success_stores_output_with_patterns() {
        let harness = Harness::new(false);
        let result = finish(&goal_with_output(), Ok(exit(0)), &harness.ctx()).await;
        assert!(result.is_success());

        let puts = harness.cache.puts.lock().unwrap();
        assert_eq!(puts[0][0].pattern.as_deref(), Some("dist/**"));
        let updates = harness.updater.updates.lock().unwrap();
        assert_eq!(updates[0].state, GoalState::Success);
    }

    #[tokio::test]
    async fn failure_strips_every_output_pattern() {
        let harness = Harness::new(false);
        let outcome = Err(Error::ExecutionError(exit(3).describe()));
        let result = finish(&goal_with_output(), outcome, &harness.ctx()).await;
        assert_eq!(result.code, 1);
        assert!(result
            .message
            .as_deref()
            .unwrap()
            .contains("scheduled but execution failed"));

        let puts = harness.cache.puts.lock().unwrap();
        assert_eq!(puts[0].len(), 2);
        assert!(puts[0].iter().all(|e| e.pattern.is_none()));
        assert_eq!(
            harness.updater.updates.lock().unwrap()[0].state,
            GoalState::Failure
        );
    }

    #[tokio::test]
    async fn result_file_replaces_generic_status() {
        let harness = Harness::new(false);
        std::fs::write(
            harness.dir.path().join("result.json"),
            r#"{"code": 0, "description": "Published 1.2.3"}"#,
        )
        .unwrap();
        let result = finish(&goal_with_output(), Ok(exit(0)), &harness.ctx()).await;
        assert_eq!(result.description.as_deref(), Some("Published 1.2.3"));
        assert_eq!(
            harness.updater.updates.lock().unwrap()[0].description.as_deref(),
            Some("Published 1.2.3")
        );
    }

    #[tokio::test]
    async fn cache_failure_is_appended_to_failure() {
        let harness = Harness::new(true);
        let outcome = Err(Error::ExecutionError(exit(1).describe()));
        let result = finish(&goal_with_output(), outcome, &harness.ctx()).await;
        assert_eq!(result.code, 2);
        let message = result.message.unwrap();
        assert!(message.contains("exited with code 1"));
        assert!(message.contains("caching its output failed"));
    }

    #[tokio::test]
    async fn cache_failure_turns_success_into_failure() {
        let harness = Harness::new(true);
        let result = finish(&goal_with_output(), Ok(exit(0)), &harness.ctx()).await;
        assert_eq!(result.code, 1);
        assert_eq!(result.goal_state(), GoalState::Failure);
    }

    #[test]
    fn target_prefers_registration_then_service() {
        let goal = goal_with_output();
        let data = goal.goal_data().unwrap();
        assert_eq!(target_container_name(&data, "sdm").as_deref(), Some("build"));

        let mut data = GoalData::default();
        let service: K8sServiceSpec = serde_json::from_value(serde_json::json!({
            "container": [{"name": "maven"}, {"name": "mysql"}]
        }))
        .unwrap();
        data.services
            .insert("sdm".to_string(), ServiceRegistration::K8sService(service));
        assert_eq!(target_container_name(&data, "sdm").as_deref(), Some("maven"));
        assert_eq!(target_container_name(&data, "other"), None);
    }
}
