//! Collaborators outside the cluster: the graph API, git and the goal log.

pub mod graph;
pub mod progress;
pub mod project;

pub use graph::{GoalStateUpdater, GoalUpdate, GraphClient};
pub use progress::{ProgressLog, TracingProgressLog};
pub use project::{GitProjectLoader, ProjectLoader};
