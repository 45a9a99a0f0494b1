//! Periodic removal of finished or abandoned goal jobs.

use super::job_spec::LABEL_CREATOR;
use super::lease::CleanupLease;
use super::naming::ResourceNaming;
use crate::error::{Error, Result};
use crate::k8s::error::error_message;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams};
use kube::Client;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const JOB_NAME_LABEL: &str = "job-name";

/// What a cleanup pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub stale_jobs: Vec<String>,
    pub zombie_jobs: Vec<String>,
    pub failures: usize,
    /// Set when another replica holds the cleanup lease.
    pub skipped: bool,
}

impl CleanupReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

/// Names of jobs older than `ttl` at `now`. Jobs that never started are kept.
#[must_use]
pub fn stale_jobs(jobs: &[Job], ttl: Duration, now: DateTime<Utc>) -> Vec<String> {
    let Ok(ttl) = chrono::Duration::from_std(ttl) else {
        return Vec::new();
    };
    jobs.iter()
        .filter_map(|job| {
            let name = job.metadata.name.as_ref()?;
            let started = job.status.as_ref()?.start_time.as_ref()?.0;
            (now - started > ttl).then(|| name.clone())
        })
        .collect()
}

/// Jobs whose pod has a terminated first container while other containers
/// keep running. Sidecars of such pods would otherwise run until the TTL.
#[must_use]
pub fn zombie_jobs(pods: &[Pod]) -> Vec<String> {
    let mut jobs = BTreeSet::new();
    for pod in pods {
        if is_zombie(pod) {
            if let Some(job) = pod
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(JOB_NAME_LABEL))
            {
                jobs.insert(job.clone());
            }
        }
    }
    jobs.into_iter().collect()
}

fn is_zombie(pod: &Pod) -> bool {
    let Some(first) = pod.spec.as_ref().and_then(|s| s.containers.first()) else {
        return false;
    };
    let Some(statuses) = pod.status.as_ref().and_then(|s| s.container_statuses.as_ref()) else {
        return false;
    };

    let first_terminated = statuses.iter().any(|s| {
        s.name == first.name && s.state.as_ref().is_some_and(|st| st.terminated.is_some())
    });
    let others_running = statuses.iter().any(|s| {
        s.name != first.name && s.state.as_ref().is_some_and(|st| st.running.is_some())
    });
    first_terminated && others_running
}

#[derive(Clone)]
pub struct JobCleaner {
    client: Client,
    namespace: String,
    creator: String,
    ttl: Duration,
    lease: Option<CleanupLease>,
}

impl JobCleaner {
    #[must_use]
    pub fn new(client: Client, namespace: &str, creator: &str, ttl: Duration) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            creator: creator.to_string(),
            ttl,
            lease: None,
        }
    }

    /// Only delete while holding `lease`.
    #[must_use]
    pub fn with_lease(mut self, lease: CleanupLease) -> Self {
        self.lease = Some(lease);
        self
    }

    fn creator_selector(&self) -> String {
        format!(
            "{LABEL_CREATOR}={}",
            ResourceNaming::sanitize_label_value(&self.creator)
        )
    }

    /// One cleanup pass: stale jobs first, then zombies. Failures are logged
    /// and counted, never returned.
    pub async fn run_once(&self) -> CleanupReport {
        if let Some(lease) = &self.lease {
            match lease.try_lead().await {
                Ok(true) => {}
                Ok(false) => return CleanupReport::skipped(),
                Err(e) => {
                    warn!("Cleanup lease check failed, skipping pass: {}", error_message(&e));
                    return CleanupReport::skipped();
                }
            }
        }

        let mut report = CleanupReport::default();
        let mut deleted = BTreeSet::new();

        match self.list_jobs().await {
            Ok(jobs) => {
                for name in stale_jobs(&jobs, self.ttl, Utc::now()) {
                    info!(job = %name, "Deleting stale goal job");
                    report.failures += self.delete_job_and_pods(&name).await;
                    deleted.insert(name.clone());
                    report.stale_jobs.push(name);
                }
            }
            Err(e) => {
                error!("Failed to list goal jobs: {}", error_message(&e));
                report.failures += 1;
            }
        }

        match self.list_pods().await {
            Ok(pods) => {
                for name in zombie_jobs(&pods) {
                    if !deleted.insert(name.clone()) {
                        continue;
                    }
                    info!(job = %name, "Deleting goal job whose main container has exited");
                    report.failures += self.delete_job_and_pods(&name).await;
                    report.zombie_jobs.push(name);
                }
            }
            Err(e) => {
                error!("Failed to list goal pods: {}", error_message(&e));
                report.failures += 1;
            }
        }

        debug!(
            stale = report.stale_jobs.len(),
            zombies = report.zombie_jobs.len(),
            failures = report.failures,
            "Cleanup pass complete"
        );
        report
    }

    /// Run `run_once` every `interval` on a detached task.
    #[must_use]
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        info!(
            namespace = %self.namespace,
            creator = %self.creator,
            "Starting goal job cleanup every {}s",
            interval.as_secs()
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = jobs
            .list(&ListParams::default().labels(&self.creator_selector()))
            .await?;
        Ok(list.items)
    }

    async fn list_pods(&self) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = pods
            .list(&ListParams::default().labels(&self.creator_selector()))
            .await?;
        Ok(list.items)
    }

    /// Returns the number of failed deletions.
    async fn delete_job_and_pods(&self, name: &str) -> usize {
        let mut failures = 0;
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.namespace);
        if let Err(e) = jobs.delete(name, &DeleteParams::foreground()).await {
            let e = Error::from(e);
            if !e.is_not_found() {
                warn!(job = %name, "Failed to delete job: {}", error_message(&e));
                failures += 1;
            }
        }

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let selector = format!("{JOB_NAME_LABEL}={name}");
        if let Err(e) = pods
            .delete_collection(&DeleteParams::default(), &ListParams::default().labels(&selector))
            .await
        {
            let e = Error::from(e);
            if !e.is_not_found() {
                warn!(job = %name, "Failed to delete job pods: {}", error_message(&e));
                failures += 1;
            }
        }
        failures
    }
}
