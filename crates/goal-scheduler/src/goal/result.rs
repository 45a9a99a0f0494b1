use super::event::GoalState;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalUrl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub url: String,
}

/// Outcome of scheduling or executing a goal. `code == 0` is success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteGoalResult {
    #[serde(default)]
    pub code: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<GoalState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_urls: Vec<ExternalUrl>,
}

impl ExecuteGoalResult {
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            code: 1,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    /// Goal state this result maps to when reported back.
    #[must_use]
    pub fn goal_state(&self) -> GoalState {
        match self.state {
            Some(state) => state,
            None if self.is_success() => GoalState::Success,
            None => GoalState::Failure,
        }
    }

    /// Record a follow-up failure without losing an earlier one.
    pub fn append_failure(&mut self, message: &str) {
        // A result file may report any code; the sum must stay non-zero.
        self.code = match self.code.saturating_add(1) {
            0 => 1,
            code => code,
        };
        self.message = Some(match self.message.take() {
            Some(existing) if !existing.is_empty() => format!("{existing}. {message}"),
            _ => message.to_string(),
        });
        if self.state == Some(GoalState::Success) {
            self.state = Some(GoalState::Failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_failure_keeps_previous_message() {
        let mut result = ExecuteGoalResult::failure("Container 'a' exited with code 2");
        result.append_failure("Failed to cache output");
        assert_eq!(result.code, 2);
        assert_eq!(
            result.message.as_deref(),
            Some("Container 'a' exited with code 2. Failed to cache output")
        );
    }

    #[test]
    fn append_failure_keeps_extreme_codes_failing() {
        let mut result = ExecuteGoalResult::failure("out of range");
        result.code = i32::MAX;
        result.append_failure("Failed to cache output");
        assert_eq!(result.code, i32::MAX);

        result.code = -1;
        result.append_failure("Failed to cache output");
        assert_eq!(result.code, 1);
        assert_eq!(result.goal_state(), GoalState::Failure);
    }

    #[test]
    fn append_failure_turns_success_into_failure() {
        let mut result = ExecuteGoalResult::success();
        result.append_failure("Failed to cache output");
        assert_eq!(result.code, 1);
        assert_eq!(result.goal_state(), GoalState::Failure);
    }

    #[test]
    fn explicit_state_wins() {
        let result = ExecuteGoalResult {
            state: Some(GoalState::WaitingForApproval),
            ..Default::default()
        };
        assert_eq!(result.goal_state(), GoalState::WaitingForApproval);
    }
}
