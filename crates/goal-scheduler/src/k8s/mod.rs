//! Kubernetes side of goal scheduling: job synthesis, fulfillment,
//! scheduling and cleanup.

pub mod cleanup;
pub mod error;
pub mod fulfillment;
pub mod job_spec;
pub mod lease;
pub mod namespace;
pub mod naming;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use cleanup::{CleanupReport, JobCleaner};
pub use fulfillment::{fulfill, ContainerGoalDefinition, FulfillmentContext, RegistrationCallback};
pub use job_spec::JobSpecBuilder;
pub use namespace::read_namespace;
pub use naming::ResourceNaming;
pub use scheduler::{GoalScheduler, KubernetesGoalScheduler, SchedulerKind, SchedulerRegistry};
