//! Which role this process plays, decided once at startup.

use std::fmt;

pub const ISOLATED_GOAL_ENV: &str = "ATOMIST_ISOLATED_GOAL";
pub const ISOLATED_GOAL_INIT_ENV: &str = "ATOMIST_ISOLATED_GOAL_INIT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMode {
    /// Decides how goals run and schedules isolated ones.
    Orchestrator,
    /// Init container of a goal job: prepares project and secrets.
    IsolatedInit,
    /// First container of a goal job: supervises the goal container.
    IsolatedMonitor,
}

impl ProcessMode {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_flags(
            std::env::var(ISOLATED_GOAL_ENV).ok().as_deref(),
            std::env::var(ISOLATED_GOAL_INIT_ENV).ok().as_deref(),
        )
    }

    /// Init wins over monitor: the init container inherits both markers.
    #[must_use]
    pub fn from_flags(isolated: Option<&str>, init: Option<&str>) -> Self {
        if is_true(init) {
            ProcessMode::IsolatedInit
        } else if is_true(isolated) {
            ProcessMode::IsolatedMonitor
        } else {
            ProcessMode::Orchestrator
        }
    }

    /// True inside a goal job, where scheduling further jobs would recurse.
    #[must_use]
    pub fn is_isolated(self) -> bool {
        !matches!(self, ProcessMode::Orchestrator)
    }
}

impl fmt::Display for ProcessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessMode::Orchestrator => write!(f, "orchestrator"),
            ProcessMode::IsolatedInit => write!(f, "isolated-init"),
            ProcessMode::IsolatedMonitor => write!(f, "isolated-monitor"),
        }
    }
}

fn is_true(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}
