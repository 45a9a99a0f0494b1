//! Goal model: the goal event, its typed data envelope and container registrations.

pub mod data;
pub mod event;
pub mod registration;
pub mod result;

pub use data::{GoalData, K8sServiceSpec, ServiceRegistration};
pub use event::{GoalEvent, GoalState};
pub use registration::{
    CacheEntry, ContainerRegistration, ContainerSecrets, GoalContainer, PartialRegistration,
    ProviderSecret, ProviderType, SecretEnv, SecretFileMount, SecretValue,
};
pub use result::ExecuteGoalResult;
