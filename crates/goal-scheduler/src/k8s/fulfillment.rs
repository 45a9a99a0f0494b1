//! Turning a container registration into the `k8s-service` registration the
//! job spec builder consumes.

use super::job_spec::{env_var, merge_env, strip_probes};
use crate::clients::ProjectLoader;
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::goal::data::ENVELOPE_VERSION;
use crate::goal::{
    ContainerRegistration, GoalContainer, GoalData, GoalEvent, K8sServiceSpec,
    PartialRegistration, ServiceRegistration,
};
use crate::mode::ISOLATED_GOAL_INIT_ENV;
use crate::secrets::resolver::validate_file_mounts;
use crate::secrets::{secret_file_layout, CredentialQuery, SecretFile, SecretResolver};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, EmptyDirVolumeSource, EnvVar, Volume, VolumeMount};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const PROJECT_DIR: &str = "/atm/home";
pub const INPUT_DIR: &str = "/atm/input";
pub const OUTPUT_DIR: &str = "/atm/output";
pub const RESULT_FILE: &str = "/atm/output/result.json";

const PROJECT_VOLUME: &str = "project";
const INPUT_VOLUME: &str = "input";
const OUTPUT_VOLUME: &str = "output";

/// Inspects the checked-out project to finish a registration.
#[async_trait]
pub trait RegistrationCallback: Send + Sync {
    async fn call(
        &self,
        registration: &ContainerRegistration,
        project_dir: &Path,
        goal: &GoalEvent,
    ) -> Result<PartialRegistration>;
}

/// A container goal as declared by the delivery machine. Only the
/// registration is ever persisted into the goal data.
#[derive(Clone, Default)]
pub struct ContainerGoalDefinition {
    pub registration: ContainerRegistration,
    pub callback: Option<Arc<dyn RegistrationCallback>>,
}

impl ContainerGoalDefinition {
    #[must_use]
    pub fn new(registration: ContainerRegistration) -> Self {
        Self {
            registration,
            callback: None,
        }
    }

    #[must_use]
    pub fn with_callback(mut self, callback: Arc<dyn RegistrationCallback>) -> Self {
        self.callback = Some(callback);
        self
    }
}

/// What fulfillment needs from the running scheduler.
pub struct FulfillmentContext<'a> {
    pub config: &'a SchedulerConfig,
    /// First container of the scheduler's own pod.
    pub template_container: &'a Container,
    pub credentials: &'a dyn CredentialQuery,
    pub projects: &'a dyn ProjectLoader,
}

/// Goal containers' view of the shared directories.
#[must_use]
pub fn directory_env() -> Vec<EnvVar> {
    vec![
        env_var("ATOMIST_PROJECT_DIR", PROJECT_DIR),
        env_var("ATOMIST_INPUT_DIR", INPUT_DIR),
        env_var("ATOMIST_OUTPUT_DIR", OUTPUT_DIR),
        env_var("ATOMIST_RESULT_FILE", RESULT_FILE),
    ]
}

/// Prepare `goal` for scheduling: finish the registration, resolve its
/// secrets and merge the registration plus its `k8s-service` form into the
/// goal data.
#[instrument(skip_all, fields(goal = %goal.unique_name))]
pub async fn fulfill(
    definition: &ContainerGoalDefinition,
    goal: &mut GoalEvent,
    ctx: &FulfillmentContext<'_>,
) -> Result<()> {
    let mut registration = definition.registration.clone();
    if let Some(callback) = &definition.callback {
        let partial = run_callback(callback.as_ref(), &registration, goal, ctx.projects).await?;
        registration.apply(partial);
    }

    if registration.containers.is_empty() {
        return Err(Error::ConfigError(format!(
            "No containers defined for goal {}",
            goal.unique_name
        )));
    }
    default_working_dir(&mut registration.containers[0]);

    let mut secrets = registration.all_secrets();
    if let Some(goal_secrets) = goal.parameter_secrets() {
        secrets.extend(&goal_secrets);
    }
    validate_file_mounts(&secrets.file_mounts)?;
    let secret_files = secret_file_layout(&secrets.file_mounts)?;
    let resolver = SecretResolver::new(
        ctx.credentials,
        goal,
        ctx.config.api_key.as_deref(),
        ctx.config.decryption.as_ref(),
    );
    let secret_env = resolver.resolve_env(&secrets.env).await?;

    let mut goal_env = directory_env();
    goal_env.extend(secret_env.iter().cloned());
    let secret_mounts = secret_file_mounts(&secret_files);

    let containers: Vec<Container> = registration
        .containers
        .iter()
        .map(|c| {
            let mut container = c.spec.clone();
            merge_env(&mut container, &goal_env);
            add_mounts(&mut container, &secret_mounts);
            container
        })
        .collect();

    let mut init_containers = vec![prep_container(ctx.template_container, &secret_files)];
    init_containers.extend(registration.init_containers.iter().map(|c| {
        let mut container = c.spec.clone();
        add_mounts(&mut container, &secret_mounts);
        container
    }));
    for container in &mut init_containers {
        merge_env(container, &goal_env);
    }

    let mut volumes = io_volumes();
    volumes.extend(secret_volumes(&secret_files));
    volumes.extend(registration.volumes.iter().cloned());

    let service = K8sServiceSpec {
        container: containers,
        init_container: init_containers,
        volume: volumes,
        volume_mount: io_mounts(),
        image_pull_secret: Vec::new(),
    };

    let name = registration
        .name
        .clone()
        .unwrap_or_else(|| ctx.config.name.clone());
    info!(
        service = %name,
        containers = service.container.len(),
        init_containers = service.init_container.len(),
        secret_files = secret_files.len(),
        "Fulfilled container goal"
    );

    let mut data = GoalData {
        version: Some(ENVELOPE_VERSION),
        container: Some(registration),
        ..Default::default()
    };
    data.services
        .insert(name, ServiceRegistration::K8sService(service));
    goal.merge_data(data)
}

async fn run_callback(
    callback: &dyn RegistrationCallback,
    registration: &ContainerRegistration,
    goal: &GoalEvent,
    projects: &dyn ProjectLoader,
) -> Result<PartialRegistration> {
    let dir = std::env::temp_dir().join(format!("atm-callback-{}", Uuid::new_v4().simple()));
    debug!(dir = %dir.display(), "Cloning project for registration callback");
    let result = async {
        projects.clone_project(goal, &dir).await?;
        callback.call(registration, &dir, goal).await
    }
    .await;
    if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %e, "Failed to remove callback checkout");
        }
    }
    result
}

/// Unset means the project directory; an empty string means the image default.
fn default_working_dir(container: &mut GoalContainer) {
    match container.spec.working_dir.as_deref() {
        None => container.spec.working_dir = Some(PROJECT_DIR.to_string()),
        Some("") => container.spec.working_dir = None,
        Some(_) => {}
    }
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn io_volumes() -> Vec<Volume> {
    vec![
        empty_dir(PROJECT_VOLUME),
        empty_dir(INPUT_VOLUME),
        empty_dir(OUTPUT_VOLUME),
    ]
}

fn io_mounts() -> Vec<VolumeMount> {
    vec![
        mount(PROJECT_VOLUME, PROJECT_DIR),
        mount(INPUT_VOLUME, INPUT_DIR),
        mount(OUTPUT_VOLUME, OUTPUT_DIR),
    ]
}

fn secret_volumes(files: &[SecretFile]) -> Vec<Volume> {
    let mut volumes: Vec<Volume> = Vec::new();
    for file in files {
        if volumes.iter().all(|v| v.name != file.volume) {
            volumes.push(empty_dir(&file.volume));
        }
    }
    volumes
}

/// One read-only subPath mount per secret file.
fn secret_file_mounts(files: &[SecretFile]) -> Vec<VolumeMount> {
    files
        .iter()
        .map(|file| VolumeMount {
            name: file.volume.clone(),
            mount_path: file.mount_path.clone(),
            sub_path: Some(file.file_name.clone()),
            read_only: Some(true),
            ..Default::default()
        })
        .collect()
}

fn add_mounts(container: &mut Container, mounts: &[VolumeMount]) {
    if mounts.is_empty() {
        return;
    }
    let existing = container.volume_mounts.get_or_insert_with(Vec::new);
    for m in mounts {
        if existing.iter().all(|e| e.mount_path != m.mount_path) {
            existing.push(m.clone());
        }
    }
}

/// Copy of the scheduler container that prepares the project and secret
/// files before the goal containers start.
fn prep_container(template: &Container, files: &[SecretFile]) -> Container {
    let mut container = template.clone();
    container.name = format!("atm-init-{}", &Uuid::new_v4().simple().to_string()[..8]);
    strip_probes(&mut container);
    container.startup_probe = None;
    container.lifecycle = None;
    container.ports = None;
    merge_env(&mut container, &[env_var(ISOLATED_GOAL_INIT_ENV, "true")]);

    let mut dirs: Vec<VolumeMount> = Vec::new();
    for file in files {
        if dirs.iter().all(|m| m.name != file.volume) {
            dirs.push(mount(&file.volume, &file.init_dir()));
        }
    }
    add_mounts(&mut container, &dirs);
    container
}
