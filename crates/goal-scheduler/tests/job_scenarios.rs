//! Fulfilment followed by job synthesis, the path a container goal takes
//! from registration to the Job the scheduler creates.

use async_trait::async_trait;
use goal_scheduler::clients::ProjectLoader;
use goal_scheduler::config::SchedulerConfig;
use goal_scheduler::goal::{ContainerRegistration, GoalContainer, GoalEvent};
use goal_scheduler::k8s::fulfillment::PROJECT_DIR;
use goal_scheduler::k8s::job_spec::{GOAL_EVENT_ENV, LABEL_CREATOR};
use goal_scheduler::k8s::{fulfill, ContainerGoalDefinition, FulfillmentContext, JobSpecBuilder};
use goal_scheduler::mode::ISOLATED_GOAL_INIT_ENV;
use goal_scheduler::secrets::CredentialQuery;
use goal_scheduler::{Error, Result};
use k8s_openapi::api::core::v1::{Container, Pod};
use serde_json::{json, Value};
use std::path::Path;

struct NoCredentials;

#[async_trait]
impl CredentialQuery for NoCredentials {
    async fn query(&self, name: &str, _variables: Value) -> Result<Value> {
        Err(Error::GraphError(format!("unexpected query {name}")))
    }
}

struct NoProjects;

#[async_trait]
impl ProjectLoader for NoProjects {
    async fn clone_project(&self, _goal: &GoalEvent, _target_dir: &Path) -> Result<()> {
        Err(Error::ProjectError("no clone expected".to_string()))
    }
}

fn template_pod() -> Pod {
    serde_json::from_value(json!({
        "metadata": {"name": "sdm-7d9f8-abcde", "labels": {"app": "sdm", "pod-template-hash": "7d9f8"}},
        "spec": {
            "nodeName": "node-3",
            "containers": [{
                "name": "sdm",
                "image": "atomist/sdm:1.2.3",
                "livenessProbe": {"httpGet": {"path": "/health", "port": 2866}},
                "volumeMounts": [{"name": "cache", "mountPath": "/opt/data"}]
            }],
            "volumes": [{"name": "cache", "hostPath": {"path": "/mnt/cache"}}]
        }
    }))
    .unwrap()
}

fn goal() -> GoalEvent {
    GoalEvent {
        unique_name: "build#goals.ts:42".to_string(),
        goal_set_id: "a1b2c3d4e5f6".to_string(),
        sha: "0123456789abcdef".to_string(),
        repo_owner: "atomist".to_string(),
        repo_name: "sdm".to_string(),
        workspace_id: Some("T0123".to_string()),
        isolated: true,
        ..Default::default()
    }
}

fn config() -> SchedulerConfig {
    SchedulerConfig {
        name: "sdm".to_string(),
        ..Default::default()
    }
}

async fn fulfilled_goal(template: &Pod, config: &SchedulerConfig) -> GoalEvent {
    let template_container: &Container = &template.spec.as_ref().unwrap().containers[0];
    let ctx = FulfillmentContext {
        config,
        template_container,
        credentials: &NoCredentials,
        projects: &NoProjects,
    };
    let registration = ContainerRegistration {
        containers: vec![GoalContainer::new("build", "node:20")],
        ..Default::default()
    };
    let mut goal = goal();
    fulfill(&ContainerGoalDefinition::new(registration), &mut goal, &ctx)
        .await
        .unwrap();
    goal
}

#[tokio::test]
async fn container_goal_becomes_a_runnable_job() {
    let template = template_pod();
    let config = config();
    let goal = fulfilled_goal(&template, &config).await;

    let job = JobSpecBuilder::new(&config, "delivery")
        .build(&template, &goal)
        .unwrap();
    let name = job.metadata.name.clone().unwrap();
    assert_eq!(name, "sdm-job-a1b2c3d-build");
    assert_eq!(job.metadata.namespace.as_deref(), Some("delivery"));
    assert_eq!(
        job.metadata.labels.as_ref().unwrap().get(LABEL_CREATOR).map(String::as_str),
        Some("sdm")
    );

    let job_spec = job.spec.unwrap();
    assert_eq!(job_spec.backoff_limit, Some(0));
    let pod = job_spec.template.spec.unwrap();
    assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
    assert!(pod.node_name.is_none());

    let names: Vec<&str> = pod.containers.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec![name.as_str(), "build"]);
    assert!(pod.containers[0].liveness_probe.is_none());
    assert_eq!(pod.containers[1].working_dir.as_deref(), Some(PROJECT_DIR));

    let init = pod.init_containers.unwrap();
    assert_eq!(init.len(), 1);
    let init_env = init[0].env.as_ref().unwrap();
    assert!(init_env.iter().any(|e| e.name == ISOLATED_GOAL_INIT_ENV));
    assert!(init_env.iter().any(|e| e.name == GOAL_EVENT_ENV));

    let volumes = pod.volumes.unwrap();
    let volume_names: Vec<&str> = volumes.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(volume_names, vec!["cache", "project", "input", "output"]);
    let cache_path = volumes[0].host_path.as_ref().unwrap().path.as_str();
    assert_eq!(cache_path, "/mnt/cache/T0123");

    for container in pod.containers.iter().chain(init.iter()) {
        assert!(
            container
                .volume_mounts
                .iter()
                .flatten()
                .any(|m| m.mount_path == PROJECT_DIR),
            "{} is missing the project mount",
            container.name
        );
    }
}

#[tokio::test]
async fn goal_event_in_job_carries_the_registration() {
    let template = template_pod();
    let config = config();
    let goal = fulfilled_goal(&template, &config).await;
    let job = JobSpecBuilder::new(&config, "delivery")
        .build(&template, &goal)
        .unwrap();

    let pod = job.spec.unwrap().template.spec.unwrap();
    let raw = pod.containers[0]
        .env
        .iter()
        .flatten()
        .find(|e| e.name == GOAL_EVENT_ENV)
        .and_then(|e| e.value.clone())
        .unwrap();
    let in_job: GoalEvent = serde_json::from_str(&raw).unwrap();
    let data = in_job.goal_data().unwrap();
    let registration = data.container.as_ref().unwrap();
    assert_eq!(registration.containers[0].name(), "build");
    assert_eq!(data.k8s_services().count(), 1);
}
