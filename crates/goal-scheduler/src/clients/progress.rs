use crate::error::Result;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::borrow::Cow;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

lazy_static! {
    static ref ANSI_ESCAPE: Regex =
        Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").expect("Invalid ANSI escape pattern");
}

/// Drop terminal color codes from a line of goal output.
#[must_use]
pub fn strip_ansi(line: &str) -> Cow<'_, str> {
    ANSI_ESCAPE.replace_all(line, "")
}

/// Sink for the goal's log output.
#[async_trait]
pub trait ProgressLog: Send + Sync {
    async fn write(&self, line: &str) -> Result<()>;
    async fn flush(&self) -> Result<()>;
}

/// Forwards goal output to the process log, tagged with the goal.
pub struct TracingProgressLog {
    goal: String,
    lines: AtomicUsize,
}

impl TracingProgressLog {
    #[must_use]
    pub fn new(goal: &str) -> Self {
        Self {
            goal: goal.to_string(),
            lines: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn lines_written(&self) -> usize {
        self.lines.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ProgressLog for TracingProgressLog {
    async fn write(&self, line: &str) -> Result<()> {
        self.lines.fetch_add(1, Ordering::Relaxed);
        info!(target: "goal_progress", goal = %self.goal, "{}", strip_ansi(line.trim_end()));
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        info!(
            target: "goal_progress",
            goal = %self.goal,
            "Goal log complete ({} lines)",
            self.lines_written()
        );
        Ok(())
    }
}
