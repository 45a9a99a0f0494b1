//! Leader election for the cleanup loop.
//!
//! Every scheduler replica runs the loop; a coordination/v1 Lease decides
//! which one actually deletes. The holder renews on each tick, others take
//! over once the lease has expired.

use crate::error::Result;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease as K8sLease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, PostParams};
use kube::core::ObjectMeta;
use kube::{Client, Error as KubeError};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

const HOLDER_ANNOTATION: &str = "atomist.com/cleanup-holder";

/// Who currently owns a lease, as seen by `holder`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseStatus {
    Ours,
    Expired,
    HeldBy(String),
}

/// Classify an existing lease for `holder` at `now`.
#[must_use]
pub fn lease_status(lease: &K8sLease, holder: &str, now: DateTime<Utc>) -> LeaseStatus {
    let Some(spec) = &lease.spec else {
        return LeaseStatus::Expired;
    };
    let current = spec.holder_identity.as_deref().unwrap_or_default();
    if current == holder {
        return LeaseStatus::Ours;
    }

    let (Some(renew_time), Some(duration_seconds)) = (&spec.renew_time, spec.lease_duration_seconds)
    else {
        return LeaseStatus::Expired;
    };
    let expiration_time = renew_time.0 + chrono::Duration::seconds(i64::from(duration_seconds));
    if expiration_time < now || current.is_empty() {
        LeaseStatus::Expired
    } else {
        LeaseStatus::HeldBy(current.to_string())
    }
}

#[derive(Clone)]
pub struct CleanupLease {
    client: Client,
    namespace: String,
    name: String,
    holder: String,
    lease_duration: Duration,
}

impl CleanupLease {
    #[must_use]
    pub fn new(client: Client, namespace: &str, name: &str, holder: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            name: name.to_string(),
            holder: holder.to_string(),
            lease_duration: Duration::from_secs(1200),
        }
    }

    /// Set the lease duration (default: 20 minutes)
    #[must_use]
    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Acquire or renew the lease. `false` means another replica leads.
    pub async fn try_lead(&self) -> Result<bool> {
        let lease_api: Api<K8sLease> = Api::namespaced(self.client.clone(), &self.namespace);

        match lease_api.create(&PostParams::default(), &self.lease_object(0)).await {
            Ok(_) => {
                info!(lease = %self.name, holder = %self.holder, "Acquired cleanup lease");
                return Ok(true);
            }
            Err(KubeError::Api(err)) if err.code == 409 => {}
            Err(e) => return Err(e.into()),
        }

        let existing = lease_api.get(&self.name).await?;
        let transitions = existing
            .spec
            .as_ref()
            .and_then(|s| s.lease_transitions)
            .unwrap_or(0);
        let next_transitions = match lease_status(&existing, &self.holder, Utc::now()) {
            LeaseStatus::Ours => transitions,
            LeaseStatus::Expired => transitions + 1,
            LeaseStatus::HeldBy(holder) => {
                debug!(lease = %self.name, holder = %holder, "Cleanup lease held by another replica");
                return Ok(false);
            }
        };

        let mut updated = self.lease_object(next_transitions);
        // resourceVersion makes the replace fail if someone else got there first
        updated.metadata.resource_version = existing.metadata.resource_version.clone();
        if next_transitions == transitions {
            if let Some(acquired) = existing.spec.as_ref().and_then(|s| s.acquire_time.clone()) {
                if let Some(spec) = updated.spec.as_mut() {
                    spec.acquire_time = Some(acquired);
                }
            }
        }

        match lease_api
            .replace(&self.name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => {
                if next_transitions != transitions {
                    info!(lease = %self.name, holder = %self.holder, "Took over expired cleanup lease");
                } else {
                    debug!(lease = %self.name, "Renewed cleanup lease");
                }
                Ok(true)
            }
            Err(KubeError::Api(err)) if err.code == 409 => {
                debug!(lease = %self.name, "Lost cleanup lease race");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn lease_object(&self, transitions: i32) -> K8sLease {
        let now = Utc::now();
        let mut annotations = BTreeMap::new();
        annotations.insert(HOLDER_ANNOTATION.to_string(), self.holder.clone());

        K8sLease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.holder.clone()),
                lease_duration_seconds: Some(
                    i32::try_from(self.lease_duration.as_secs()).unwrap_or(i32::MAX),
                ),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(holder: &str, renewed_secs_ago: i64, duration: i32) -> K8sLease {
        let renewed = Utc::now() - chrono::Duration::seconds(renewed_secs_ago);
        K8sLease {
            metadata: ObjectMeta::default(),
            spec: Some(LeaseSpec {
                holder_identity: Some(holder.to_string()),
                lease_duration_seconds: Some(duration),
                renew_time: Some(MicroTime(renewed)),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn own_lease_is_renewable() {
        assert_eq!(
            lease_status(&lease("sdm-a", 5000, 60), "sdm-a", Utc::now()),
            LeaseStatus::Ours
        );
    }

    #[test]
    fn valid_foreign_lease_blocks() {
        assert_eq!(
            lease_status(&lease("sdm-b", 10, 60), "sdm-a", Utc::now()),
            LeaseStatus::HeldBy("sdm-b".to_string())
        );
    }

    #[test]
    fn expired_foreign_lease_can_be_taken() {
        assert_eq!(
            lease_status(&lease("sdm-b", 120, 60), "sdm-a", Utc::now()),
            LeaseStatus::Expired
        );
    }

    #[test]
    fn lease_without_spec_is_expired() {
        let lease = K8sLease::default();
        assert_eq!(lease_status(&lease, "sdm-a", Utc::now()), LeaseStatus::Expired);
    }
}
