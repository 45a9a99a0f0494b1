//! Init mode: the preparation container of a goal job checks out the
//! project, restores cached input and writes secret files before any goal
//! container starts.

use crate::cache::GoalCache;
use crate::clients::{GoalStateUpdater, GoalUpdate, ProjectLoader};
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::goal::{ContainerSecrets, GoalEvent, GoalState};
use crate::k8s::error::error_message;
use crate::secrets::{secret_file_layout, CredentialQuery, SecretResolver};
use std::path::PathBuf;
use tracing::{debug, error, info, instrument};

pub struct InitContext<'a> {
    pub config: &'a SchedulerConfig,
    pub projects: &'a dyn ProjectLoader,
    pub credentials: &'a dyn CredentialQuery,
    pub cache: &'a dyn GoalCache,
    pub updater: &'a dyn GoalStateUpdater,
    pub project_dir: PathBuf,
    pub input_dir: PathBuf,
    /// Mount root of the secret volumes in this container.
    pub secret_root: PathBuf,
}

/// Prepare the shared volumes of a goal job. A failure is reported on the
/// goal before it is returned, so the job fails with a visible reason.
#[instrument(skip_all, fields(goal = %goal.unique_name))]
pub async fn run_init(goal: &GoalEvent, ctx: &InitContext<'_>) -> Result<()> {
    match prepare(goal, ctx).await {
        Ok(()) => {
            let update = GoalUpdate::new(GoalState::InProcess, format!("Running {}", goal.goal_name()));
            ctx.updater.update(goal, update).await
        }
        Err(e) => {
            let message = format!(
                "Goal {} failed to prepare its workspace: {}",
                goal.unique_name,
                error_message(&e)
            );
            error!("{}", message);
            if let Err(update_err) = ctx
                .updater
                .update(goal, GoalUpdate::new(GoalState::Failure, message))
                .await
            {
                error!("Failed to report goal failure: {}", error_message(&update_err));
            }
            Err(e)
        }
    }
}

async fn prepare(goal: &GoalEvent, ctx: &InitContext<'_>) -> Result<()> {
    let data = goal.goal_data()?;
    let registration = data.container.unwrap_or_default();

    ctx.projects.clone_project(goal, &ctx.project_dir).await?;
    info!(dir = %ctx.project_dir.display(), sha = %goal.sha, "Checked out project");

    if ctx.config.cache.enabled && !registration.input.is_empty() {
        tokio::fs::create_dir_all(&ctx.input_dir).await?;
        ctx.cache
            .restore(goal, &ctx.input_dir, &registration.input)
            .await?;
    }

    let mut secrets = registration.all_secrets();
    if let Some(goal_secrets) = goal.parameter_secrets() {
        secrets.extend(&goal_secrets);
    }
    write_secret_files(goal, &secrets, ctx).await
}

async fn write_secret_files(
    goal: &GoalEvent,
    secrets: &ContainerSecrets,
    ctx: &InitContext<'_>,
) -> Result<()> {
    if secrets.file_mounts.is_empty() {
        return Ok(());
    }
    let layout = secret_file_layout(&secrets.file_mounts)?;
    let resolver = SecretResolver::new(
        ctx.credentials,
        goal,
        ctx.config.api_key.as_deref(),
        ctx.config.decryption.as_ref(),
    );
    let files = resolver.resolve_files(&secrets.file_mounts).await?;

    for placement in &layout {
        let Some(file) = files.iter().find(|f| f.mount_path == placement.mount_path) else {
            continue;
        };
        let dir = ctx.secret_root.join(&placement.volume);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(&placement.file_name), &file.content).await?;
        debug!(path = %placement.mount_path, volume = %placement.volume, "Wrote secret file");
    }
    info!("Wrote {} secret files", layout.len());
    Ok(())
}
