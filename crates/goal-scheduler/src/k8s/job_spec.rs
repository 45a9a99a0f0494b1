//! Job spec synthesis.
//!
//! A goal job is a copy of the scheduler's own pod: same image, service
//! account and registry credentials, re-pointed at one goal. Extra
//! containers and volumes arrive through `k8s-service` registrations in the
//! goal data, so this module never needs to know which feature added them.

use super::naming::ResourceNaming;
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::goal::{GoalEvent, K8sServiceSpec};
use crate::mode::{ISOLATED_GOAL_ENV, ISOLATED_GOAL_INIT_ENV};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, EnvVar, EnvVarSource, LocalObjectReference, ObjectFieldSelector,
    PodAffinity, PodAffinityTerm, PodSpec, PodTemplateSpec, Volume, VolumeMount,
    WeightedPodAffinityTerm,
};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement, ObjectMeta};
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const LABEL_CREATOR: &str = "atomist.com/creator";
pub const LABEL_GOAL_SET_ID: &str = "atomist.com/goal-set-id";
pub const LABEL_GOAL_ID: &str = "atomist.com/goal-id";
pub const LABEL_WORKSPACE_ID: &str = "atomist.com/workspace-id";

/// Environment variable carrying the serialized goal event into the job.
pub const GOAL_EVENT_ENV: &str = "ATOMIST_GOAL_EVENT";
pub const POD_NAME_ENV: &str = "ATOMIST_POD_NAME";
pub const POD_NAMESPACE_ENV: &str = "ATOMIST_POD_NAMESPACE";

const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

pub struct JobSpecBuilder<'a> {
    config: &'a SchedulerConfig,
    namespace: &'a str,
}

impl<'a> JobSpecBuilder<'a> {
    #[must_use]
    pub fn new(config: &'a SchedulerConfig, namespace: &'a str) -> Self {
        Self { config, namespace }
    }

    /// Job name for a goal given the template pod.
    pub fn job_name(template: &Pod, goal_event: &GoalEvent) -> Result<String> {
        let container = template_container(template)?;
        Ok(ResourceNaming::job_name(&container.name, goal_event))
    }

    /// Build the job for `goal_event` from the template pod. Pure: no cluster calls.
    pub fn build(&self, template: &Pod, goal_event: &GoalEvent) -> Result<Job> {
        let job_name = Self::job_name(template, goal_event)?;
        let mut pod_spec = template
            .spec
            .clone()
            .ok_or_else(|| Error::ConfigError("Template pod has no spec".to_string()))?;

        pod_spec.restart_policy = Some("Never".to_string());
        // A running pod's node assignment is not a scheduling constraint
        pod_spec.node_name = None;

        let env = goal_environment(&job_name, goal_event, self.config)?;
        if let Some(main) = pod_spec.containers.first_mut() {
            main.name.clone_from(&job_name);
            merge_env(main, &env);
        }
        for container in pod_spec.containers.iter_mut() {
            strip_probes(container);
        }
        if let Some(init_containers) = pod_spec.init_containers.as_mut() {
            for container in init_containers.iter_mut() {
                strip_probes(container);
            }
        }

        self.isolate_cache_volumes(&mut pod_spec, goal_event);
        pod_spec.affinity = Some(goal_set_affinity(
            pod_spec.affinity.take(),
            &goal_event.goal_set_id,
        ));

        let data = goal_event.goal_data_or_default();
        let mut mounts = Vec::new();
        for (name, service) in data.k8s_services() {
            debug!(job = %job_name, service = %name, "Adding k8s service to job");
            splice_service(&mut pod_spec, service, &mut mounts);
        }
        broadcast_volume_mounts(&mut pod_spec, &mounts);

        // Init containers added by the fulfillment callback run this binary too
        if let Some(init_containers) = pod_spec.init_containers.as_mut() {
            for container in init_containers.iter_mut().filter(|c| is_isolated_init(c)) {
                merge_env(container, &env);
            }
        }

        let labels = self.job_labels(goal_event);
        info!(
            job = %job_name,
            namespace = %self.namespace,
            containers = pod_spec.containers.len(),
            init_containers = pod_spec.init_containers.as_ref().map_or(0, Vec::len),
            "Built job spec for goal {}",
            goal_event.unique_name
        );

        Ok(Job {
            metadata: ObjectMeta {
                name: Some(job_name),
                namespace: Some(self.namespace.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                ..Default::default()
            }),
            status: None,
        })
    }

    fn job_labels(&self, goal_event: &GoalEvent) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(
            LABEL_CREATOR.to_string(),
            ResourceNaming::sanitize_label_value(&self.config.name),
        );
        labels.insert(
            LABEL_GOAL_SET_ID.to_string(),
            ResourceNaming::sanitize_label_value(&goal_event.goal_set_id),
        );
        if let Some(id) = &goal_event.id {
            labels.insert(
                LABEL_GOAL_ID.to_string(),
                ResourceNaming::sanitize_label_value(id),
            );
        }
        if let Some(workspace_id) = self.workspace_id(goal_event) {
            labels.insert(
                LABEL_WORKSPACE_ID.to_string(),
                ResourceNaming::sanitize_label_value(workspace_id),
            );
        }
        labels
    }

    fn workspace_id<'g>(&'g self, goal_event: &'g GoalEvent) -> Option<&'g str> {
        goal_event
            .workspace_id
            .as_deref()
            .or(self.config.workspace_id.as_deref())
    }

    /// Suffix the host path of volumes mounted at the cache path with the
    /// workspace id so tenants sharing a node never share a cache.
    fn isolate_cache_volumes(&self, pod_spec: &mut PodSpec, goal_event: &GoalEvent) {
        let Some(workspace_id) = self.workspace_id(goal_event) else {
            return;
        };
        let cache_path = self.config.cache.path.trim_end_matches('/');
        let cache_volumes: Vec<String> = pod_spec
            .containers
            .iter()
            .chain(pod_spec.init_containers.iter().flatten())
            .flat_map(|c| c.volume_mounts.iter().flatten())
            .filter(|m| m.mount_path.trim_end_matches('/') == cache_path)
            .map(|m| m.name.clone())
            .collect();

        for volume in pod_spec.volumes.iter_mut().flatten() {
            if !cache_volumes.contains(&volume.name) {
                continue;
            }
            if let Some(host_path) = volume.host_path.as_mut() {
                let suffixed = format!("{}/{}", host_path.path.trim_end_matches('/'), workspace_id);
                debug!(volume = %volume.name, path = %suffixed, "Isolating cache volume");
                host_path.path = suffixed;
            }
        }
    }
}

fn template_container(template: &Pod) -> Result<&Container> {
    template
        .spec
        .as_ref()
        .and_then(|spec| spec.containers.first())
        .ok_or_else(|| Error::ConfigError("Template pod has no containers".to_string()))
}

/// Environment identifying the goal inside its job.
pub fn goal_environment(
    job_name: &str,
    goal_event: &GoalEvent,
    config: &SchedulerConfig,
) -> Result<Vec<EnvVar>> {
    let mut env = vec![
        env_var("ATOMIST_JOB_NAME", job_name),
        env_var(
            "ATOMIST_REGISTRATION_NAME",
            &ResourceNaming::registration_name(&config.name, goal_event),
        ),
        env_var("ATOMIST_GOAL_SET_ID", &goal_event.goal_set_id),
        env_var("ATOMIST_GOAL_UNIQUE_NAME", &goal_event.unique_name),
        env_var(ISOLATED_GOAL_ENV, "true"),
        env_var(GOAL_EVENT_ENV, &serde_json::to_string(goal_event)?),
        field_env_var(POD_NAME_ENV, "metadata.name"),
        field_env_var(POD_NAMESPACE_ENV, "metadata.namespace"),
    ];
    if let Some(team) = goal_event
        .workspace_id
        .as_deref()
        .or(config.workspace_id.as_deref())
    {
        env.push(env_var("ATOMIST_GOAL_TEAM", team));
    }
    if let Some(id) = &goal_event.id {
        env.push(env_var("ATOMIST_GOAL_ID", id));
    }
    if let Some(correlation_id) = &goal_event.correlation_id {
        env.push(env_var("ATOMIST_CORRELATION_ID", correlation_id));
    }
    Ok(env)
}

#[must_use]
pub fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

fn field_env_var(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: None,
                field_path: field_path.to_string(),
            }),
            ..Default::default()
        }),
    }
}

/// Set each variable, replacing any existing one of the same name.
pub fn merge_env(container: &mut Container, vars: &[EnvVar]) {
    let env = container.env.get_or_insert_with(Vec::new);
    for var in vars {
        match env.iter_mut().find(|e| e.name == var.name) {
            Some(existing) => *existing = var.clone(),
            None => env.push(var.clone()),
        }
    }
}

pub fn strip_probes(container: &mut Container) {
    container.liveness_probe = None;
    container.readiness_probe = None;
}

fn is_isolated_init(container: &Container) -> bool {
    container.env.iter().flatten().any(|e| {
        e.name == ISOLATED_GOAL_INIT_ENV
            && e.value.as_deref().is_some_and(|v| v.eq_ignore_ascii_case("true"))
    })
}

/// Prefer nodes already running pods of the same goal set.
fn goal_set_affinity(existing: Option<Affinity>, goal_set_id: &str) -> Affinity {
    let mut affinity = existing.unwrap_or_default();
    affinity.pod_affinity = Some(PodAffinity {
        preferred_during_scheduling_ignored_during_execution: Some(vec![
            WeightedPodAffinityTerm {
                weight: 100,
                pod_affinity_term: PodAffinityTerm {
                    label_selector: Some(LabelSelector {
                        match_expressions: Some(vec![LabelSelectorRequirement {
                            key: LABEL_GOAL_SET_ID.to_string(),
                            operator: "In".to_string(),
                            values: Some(vec![ResourceNaming::sanitize_label_value(
                                goal_set_id,
                            )]),
                        }]),
                        match_labels: None,
                    }),
                    topology_key: HOSTNAME_TOPOLOGY_KEY.to_string(),
                    ..Default::default()
                },
            },
        ]),
        required_during_scheduling_ignored_during_execution: None,
    });
    affinity
}

fn splice_service(pod_spec: &mut PodSpec, service: &K8sServiceSpec, mounts: &mut Vec<VolumeMount>) {
    pod_spec.containers.extend(service.container.iter().cloned());

    if !service.init_container.is_empty() {
        pod_spec
            .init_containers
            .get_or_insert_with(Vec::new)
            .extend(service.init_container.iter().cloned());
    }

    if !service.volume.is_empty() {
        let volumes = pod_spec.volumes.get_or_insert_with(Vec::new);
        for volume in &service.volume {
            push_volume(volumes, volume);
        }
    }

    if !service.image_pull_secret.is_empty() {
        let secrets = pod_spec.image_pull_secrets.get_or_insert_with(Vec::new);
        for secret in &service.image_pull_secret {
            push_pull_secret(secrets, secret);
        }
    }

    mounts.extend(service.volume_mount.iter().cloned());
}

fn push_volume(volumes: &mut Vec<Volume>, volume: &Volume) {
    if volumes.iter().all(|v| v.name != volume.name) {
        volumes.push(volume.clone());
    }
}

fn push_pull_secret(secrets: &mut Vec<LocalObjectReference>, secret: &LocalObjectReference) {
    if !secrets.contains(secret) {
        secrets.push(secret.clone());
    }
}

/// Mount every service volume mount into every container and init container.
fn broadcast_volume_mounts(pod_spec: &mut PodSpec, mounts: &[VolumeMount]) {
    if mounts.is_empty() {
        return;
    }
    let containers = pod_spec
        .containers
        .iter_mut()
        .chain(pod_spec.init_containers.iter_mut().flatten());
    for container in containers {
        let existing = container.volume_mounts.get_or_insert_with(Vec::new);
        for mount in mounts {
            let duplicate = existing
                .iter()
                .any(|m| m.mount_path == mount.mount_path && m.name == mount.name);
            if !duplicate {
                existing.push(mount.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goal::{GoalData, ServiceRegistration};
    use k8s_openapi::api::core::v1::{HostPathVolumeSource, Probe};
    use serde_json::json;

    fn template_pod() -> Pod {
        serde_json::from_value(json!({
            "metadata": {
                "name": "sdm-7d9f-abc",
                "labels": {"app": "sdm", "pod-template-hash": "7d9f"}
            },
            "spec": {
                "nodeName": "node-1",
                "restartPolicy": "Always",
                "serviceAccountName": "sdm",
                "containers": [{
                    "name": "sdm",
                    "image": "atomist/sdm:1.2.3",
                    "livenessProbe": {"httpGet": {"path": "/health", "port": 2866}},
                    "readinessProbe": {"httpGet": {"path": "/health", "port": 2866}},
                    "env": [{"name": "ATOMIST_GOAL_SET_ID", "value": "stale"}],
                    "volumeMounts": [{"name": "cache", "mountPath": "/opt/data"}]
                }],
                "volumes": [{"name": "cache", "hostPath": {"path": "/mnt/cache", "type": "DirectoryOrCreate"}}]
            }
        }))
        .unwrap()
    }

    fn goal_event() -> GoalEvent {
        GoalEvent {
            id: Some("goal-1".to_string()),
            unique_name: "Build#goals.ts:10".to_string(),
            goal_set_id: "0123456789".to_string(),
            branch: "main".to_string(),
            sha: "cafebabe".to_string(),
            repo_owner: "atomist".to_string(),
            repo_name: "sdm".to_string(),
            provider_id: "github".to_string(),
            workspace_id: Some("T0123".to_string()),
            correlation_id: Some("corr-1".to_string()),
            ..Default::default()
        }
    }

    fn env_value<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
        container
            .env
            .iter()
            .flatten()
            .find(|e| e.name == name)
            .and_then(|e| e.value.as_deref())
    }

    #[test]
    fn builds_batch_job_from_template() {
        let config = SchedulerConfig::default();
        let job = JobSpecBuilder::new(&config, "sdm")
            .build(&template_pod(), &goal_event())
            .unwrap();

        assert_eq!(job.metadata.name.as_deref(), Some("sdm-job-0123456-build"));
        assert_eq!(job.metadata.namespace.as_deref(), Some("sdm"));
        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(0));

        let template = spec.template;
        let labels = template.metadata.unwrap().labels.unwrap();
        assert!(!labels.contains_key("pod-template-hash"));
        assert_eq!(labels.get(LABEL_CREATOR).map(String::as_str), Some("goal-scheduler"));

        let pod = template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert!(pod.node_name.is_none());
        assert_eq!(pod.service_account_name.as_deref(), Some("sdm"));

        let main = &pod.containers[0];
        assert_eq!(main.name, "sdm-job-0123456-build");
        assert!(main.liveness_probe.is_none());
        assert!(main.readiness_probe.is_none());
        assert_eq!(env_value(main, "ATOMIST_GOAL_SET_ID"), Some("0123456789"));
        assert_eq!(env_value(main, "ATOMIST_ISOLATED_GOAL"), Some("true"));
        assert_eq!(env_value(main, "ATOMIST_GOAL_TEAM"), Some("T0123"));
        assert_eq!(env_value(main, "ATOMIST_CORRELATION_ID"), Some("corr-1"));
        assert_eq!(
            main.env
                .iter()
                .flatten()
                .filter(|e| e.name == "ATOMIST_GOAL_SET_ID")
                .count(),
            1
        );

        let event: GoalEvent =
            serde_json::from_str(env_value(main, GOAL_EVENT_ENV).unwrap()).unwrap();
        assert_eq!(event, goal_event());
    }

    #[test]
    fn suffixes_cache_host_path_with_workspace() {
        let config = SchedulerConfig::default();
        let job = JobSpecBuilder::new(&config, "sdm")
            .build(&template_pod(), &goal_event())
            .unwrap();
        let volumes = job.spec.unwrap().template.spec.unwrap().volumes.unwrap();
        assert_eq!(
            volumes[0].host_path,
            Some(HostPathVolumeSource {
                path: "/mnt/cache/T0123".to_string(),
                type_: Some("DirectoryOrCreate".to_string()),
            })
        );
    }

    #[test]
    fn prefers_goal_set_colocation() {
        let config = SchedulerConfig::default();
        let job = JobSpecBuilder::new(&config, "sdm")
            .build(&template_pod(), &goal_event())
            .unwrap();
        let affinity = job.spec.unwrap().template.spec.unwrap().affinity.unwrap();
        let terms = affinity
            .pod_affinity
            .unwrap()
            .preferred_during_scheduling_ignored_during_execution
            .unwrap();
        assert_eq!(terms[0].weight, 100);
        assert_eq!(terms[0].pod_affinity_term.topology_key, "kubernetes.io/hostname");
        let requirement = &terms[0]
            .pod_affinity_term
            .label_selector
            .as_ref()
            .unwrap()
            .match_expressions
            .as_ref()
            .unwrap()[0];
        assert_eq!(requirement.key, LABEL_GOAL_SET_ID);
        assert_eq!(requirement.values, Some(vec!["0123456789".to_string()]));
    }

    #[test]
    fn splices_services_and_broadcasts_mounts() {
        let mut goal = goal_event();
        let mut data = GoalData::default();
        let service: K8sServiceSpec = serde_json::from_value(json!({
            "container": [{"name": "goal", "image": "node:20"}],
            "initContainer": {"name": "prep", "image": "atomist/sdm:1.2.3",
                "env": [{"name": "ATOMIST_ISOLATED_GOAL_INIT", "value": "true"}]},
            "volume": [{"name": "project", "emptyDir": {}}],
            "volumeMount": [{"name": "project", "mountPath": "/atm/home"}],
            "imagePullSecret": [{"name": "registry"}]
        }))
        .unwrap();
        data.services
            .insert("container".to_string(), ServiceRegistration::K8sService(service));
        goal.data = Some(data.to_json_string().unwrap());

        let config = SchedulerConfig::default();
        let pod = JobSpecBuilder::new(&config, "sdm")
            .build(&template_pod(), &goal)
            .unwrap()
            .spec
            .unwrap()
            .template
            .spec
            .unwrap();

        assert_eq!(pod.containers.len(), 2);
        let init = &pod.init_containers.as_ref().unwrap()[0];
        assert_eq!(init.name, "prep");
        assert_eq!(env_value(init, "ATOMIST_GOAL_SET_ID"), Some("0123456789"));

        for container in pod.containers.iter().chain(pod.init_containers.iter().flatten()) {
            assert!(container
                .volume_mounts
                .iter()
                .flatten()
                .any(|m| m.mount_path == "/atm/home"));
        }
        assert_eq!(pod.volumes.unwrap().len(), 2);
        assert_eq!(pod.image_pull_secrets.unwrap()[0].name, "registry");
    }

    #[test]
    fn malformed_data_means_no_services() {
        let mut goal = goal_event();
        goal.data = Some("{broken".to_string());
        let config = SchedulerConfig::default();
        let pod = JobSpecBuilder::new(&config, "sdm")
            .build(&template_pod(), &goal)
            .unwrap()
            .spec
            .unwrap()
            .template
            .spec
            .unwrap();
        assert_eq!(pod.containers.len(), 1);
        assert!(pod.init_containers.is_none());
    }

    #[test]
    fn template_without_containers_is_a_configuration_error() {
        let pod = Pod {
            spec: Some(PodSpec::default()),
            ..Default::default()
        };
        let config = SchedulerConfig::default();
        let err = JobSpecBuilder::new(&config, "sdm")
            .build(&pod, &goal_event())
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn strip_probes_clears_health_checks() {
        let mut container = Container {
            name: "x".to_string(),
            liveness_probe: Some(Probe::default()),
            readiness_probe: Some(Probe::default()),
            ..Default::default()
        };
        strip_probes(&mut container);
        assert!(container.liveness_probe.is_none());
        assert!(container.readiness_probe.is_none());
    }
}
