use super::data::GoalData;
use super::registration::ContainerSecrets;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tracing::warn;

/// Goal parameter key carrying goal-wide secret declarations.
pub const SECRETS_PARAMETER_KEY: &str = "@atomist/sdm/secrets";

/// Lifecycle state of a goal as reported back to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GoalState {
    Planned,
    #[default]
    Requested,
    InProcess,
    WaitingForApproval,
    Success,
    Failure,
    Skipped,
    Canceled,
    Stopped,
}

impl fmt::Display for GoalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            GoalState::Planned => "planned",
            GoalState::Requested => "requested",
            GoalState::InProcess => "in_process",
            GoalState::WaitingForApproval => "waiting_for_approval",
            GoalState::Success => "success",
            GoalState::Failure => "failure",
            GoalState::Skipped => "skipped",
            GoalState::Canceled => "canceled",
            GoalState::Stopped => "stopped",
        };
        f.write_str(value)
    }
}

/// One schedulable unit of delivery work.
///
/// `data` and `parameters` are JSON documents serialized as strings, the way
/// they travel through the goal-state API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub unique_name: String,
    pub goal_set_id: String,
    #[serde(default)]
    pub state: GoalState,
    #[serde(default)]
    pub description: Option<String>,
    pub branch: String,
    pub sha: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub provider_id: String,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Goal-level request to run outside the orchestrating process.
    #[serde(default)]
    pub isolated: bool,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub parameters: Option<String>,
}

impl GoalEvent {
    /// Unique name up to the first `#`, lowercased.
    #[must_use]
    pub fn goal_name(&self) -> String {
        self.unique_name
            .split('#')
            .next()
            .unwrap_or_default()
            .to_lowercase()
    }

    /// First seven characters of the goal set id.
    #[must_use]
    pub fn short_goal_set_id(&self) -> &str {
        match self.goal_set_id.char_indices().nth(7) {
            Some((idx, _)) => &self.goal_set_id[..idx],
            None => &self.goal_set_id,
        }
    }

    /// Clone URL of the push, defaulting to GitHub for the owner/name pair.
    #[must_use]
    pub fn clone_url(&self) -> String {
        self.repo_url.clone().unwrap_or_else(|| {
            format!(
                "https://github.com/{}/{}.git",
                self.repo_owner, self.repo_name
            )
        })
    }

    /// Parse `data` into the typed envelope.
    pub fn goal_data(&self) -> Result<GoalData> {
        GoalData::parse(self.data.as_deref())
    }

    /// Parse `data`, degrading malformed documents to an empty envelope.
    #[must_use]
    pub fn goal_data_or_default(&self) -> GoalData {
        match self.goal_data() {
            Ok(data) => data,
            Err(e) => {
                warn!(
                    goal = %self.unique_name,
                    error = %e,
                    "Goal data is not valid JSON, ignoring it"
                );
                GoalData::default()
            }
        }
    }

    /// Merge `other` into the goal data, keeping every key already present.
    pub fn merge_data(&mut self, other: GoalData) -> Result<()> {
        let mut document = match self.data.as_deref().map(str::trim) {
            None | Some("") => Map::new(),
            Some(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(document)) => document,
                Ok(_) => {
                    warn!(goal = %self.unique_name, "Goal data is not a JSON object, replacing it");
                    Map::new()
                }
                Err(e) => {
                    warn!(goal = %self.unique_name, error = %e, "Goal data is not valid JSON, replacing it");
                    Map::new()
                }
            },
        };
        other.merge_into(&mut document)?;
        self.data = Some(serde_json::to_string(&document)?);
        Ok(())
    }

    /// Goal-wide secrets declared under the `@atomist/sdm/secrets` parameter.
    #[must_use]
    pub fn parameter_secrets(&self) -> Option<ContainerSecrets> {
        let raw = self.parameters.as_deref()?;
        let parameters: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(goal = %self.unique_name, error = %e, "Goal parameters are not valid JSON");
                return None;
            }
        };
        let secrets = parameters.get(SECRETS_PARAMETER_KEY)?.clone();
        match serde_json::from_value(secrets) {
            Ok(secrets) => Some(secrets),
            Err(e) => {
                warn!(goal = %self.unique_name, error = %e, "Ignoring malformed goal secrets parameter");
                None
            }
        }
    }
}
