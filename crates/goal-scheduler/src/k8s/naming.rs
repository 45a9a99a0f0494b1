use crate::goal::GoalEvent;

const MAX_K8S_NAME_LENGTH: usize = 63;

pub struct ResourceNaming;

impl ResourceNaming {
    /// Deterministic job name for a goal.
    /// Format: {template-container}-job-{goalSetId[:7]}-{goal-name}
    /// Re-scheduling the same goal lands on the same name, which is what
    /// makes scheduling replace rather than duplicate.
    #[must_use]
    pub fn job_name(template_container_name: &str, goal_event: &GoalEvent) -> String {
        let base = format!(
            "{}-job-{}-{}",
            template_container_name,
            goal_event.short_goal_set_id(),
            goal_event.goal_name()
        );
        Self::sanitize_name(&base)
    }

    /// Registration name the isolated process reports under.
    #[must_use]
    pub fn registration_name(scheduler_name: &str, goal_event: &GoalEvent) -> String {
        let base = format!(
            "{}-job-{}-{}",
            scheduler_name,
            goal_event.short_goal_set_id(),
            goal_event.goal_name()
        );
        Self::sanitize_name(&base)
    }

    /// Lease guarding the cleanup loop of one scheduler deployment.
    #[must_use]
    pub fn cleanup_lease_name(creator: &str) -> String {
        const SUFFIX: &str = "-job-cleanup";
        let base = Self::sanitize_name(creator);
        let limit = MAX_K8S_NAME_LENGTH - SUFFIX.len();
        let trimmed = Self::trim_to(&base, limit);
        format!("{trimmed}{SUFFIX}")
    }

    /// Lowercase, map everything outside `[a-z0-9-]` to `-`, collapse runs,
    /// truncate to 63 characters and trim to alphanumeric ends.
    #[must_use]
    pub fn sanitize_name(input: &str) -> String {
        let mut sanitized = String::with_capacity(input.len());
        for c in input.to_lowercase().chars() {
            let mapped = if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '-'
            };
            if mapped == '-' && sanitized.ends_with('-') {
                continue;
            }
            sanitized.push(mapped);
        }
        Self::trim_to(&sanitized, MAX_K8S_NAME_LENGTH)
    }

    /// Label values allow `[A-Za-z0-9._-]`, 63 characters, alphanumeric ends.
    #[must_use]
    pub fn sanitize_label_value(input: &str) -> String {
        if input.is_empty() {
            return String::new();
        }

        let mut sanitized = input.replace([' ', '/', ':', '#', '@'], "-");
        sanitized.retain(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');

        if sanitized.len() > MAX_K8S_NAME_LENGTH {
            sanitized.truncate(MAX_K8S_NAME_LENGTH);
        }

        sanitized
            .trim_matches(|c: char| !c.is_ascii_alphanumeric())
            .to_string()
    }

    fn trim_to(name: &str, limit: usize) -> String {
        let truncated: String = name.chars().take(limit).collect();
        truncated
            .trim_matches(|c: char| !c.is_ascii_alphanumeric())
            .to_string()
    }
}
