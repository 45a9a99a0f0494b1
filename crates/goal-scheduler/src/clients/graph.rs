//! GraphQL client for credential lookups and goal state updates.

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::goal::result::ExternalUrl;
use crate::goal::{ExecuteGoalResult, GoalEvent, GoalState};
use crate::secrets::CredentialQuery;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

const CREDENTIAL_FIELDS: &str = "name url credential { secret owner { login } }";

const UPDATE_GOAL_MUTATION: &str = "mutation UpdateSdmGoalState($id: ID!, $goalSetId: String!, $uniqueName: String!, $state: SdmGoalState!, $description: String, $phase: String, $externalUrls: [SdmExternalUrlInput!]) { updateSdmGoalState(id: $id, goalSetId: $goalSetId, uniqueName: $uniqueName, state: $state, description: $description, phase: $phase, externalUrls: $externalUrls) { id state } }";

/// State change pushed for a goal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoalUpdate {
    pub state: GoalState,
    pub description: Option<String>,
    pub phase: Option<String>,
    pub external_urls: Vec<ExternalUrl>,
}

impl GoalUpdate {
    #[must_use]
    pub fn new(state: GoalState, description: impl Into<String>) -> Self {
        Self {
            state,
            description: Some(description.into()),
            phase: None,
            external_urls: Vec::new(),
        }
    }

    /// Final update for an execution result.
    #[must_use]
    pub fn from_result(result: &ExecuteGoalResult) -> Self {
        Self {
            state: result.goal_state(),
            description: result.description.clone().or_else(|| result.message.clone()),
            phase: result.phase.clone(),
            external_urls: result.external_urls.clone(),
        }
    }
}

/// Reports goal state back to the orchestrator.
#[async_trait]
pub trait GoalStateUpdater: Send + Sync {
    async fn update(&self, goal: &GoalEvent, update: GoalUpdate) -> Result<()>;
}

#[derive(Serialize)]
struct GraphRequest<'a> {
    query: &'a str,
    variables: Value,
}

#[derive(Deserialize)]
struct GraphResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphErrorMessage>,
}

#[derive(Deserialize)]
struct GraphErrorMessage {
    message: String,
}

pub struct GraphClient {
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl GraphClient {
    #[must_use]
    pub fn new(endpoint: String, api_key: Option<String>) -> Self {
        Self {
            endpoint,
            api_key,
            client: reqwest::Client::new(),
        }
    }

    /// Client for the workspace-scoped endpoint of the configured graph URL.
    #[must_use]
    pub fn from_config(config: &SchedulerConfig) -> Self {
        let base = config.graphql_url.trim_end_matches('/');
        let endpoint = match &config.workspace_id {
            Some(workspace_id) => format!("{base}/team/{workspace_id}"),
            None => base.to_string(),
        };
        Self::new(endpoint, config.api_key.clone())
    }

    async fn execute(&self, document: &str, variables: Value) -> Result<Value> {
        let mut request = self.client.post(&self.endpoint).json(&GraphRequest {
            query: document,
            variables,
        });
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::GraphError(format!("Request to {} failed: {e}", self.endpoint)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::GraphError(format!("HTTP {status}: {body}")));
        }

        let body: GraphResponse = response
            .json()
            .await
            .map_err(|e| Error::GraphError(format!("Invalid GraphQL response: {e}")))?;
        if !body.errors.is_empty() {
            let messages: Vec<String> = body.errors.into_iter().map(|e| e.message).collect();
            return Err(Error::GraphError(messages.join("; ")));
        }
        Ok(body.data.unwrap_or(Value::Null))
    }
}

/// GraphQL document for a named credential query.
fn credential_document(name: &str) -> Option<String> {
    let root = match name {
        "DockerRegistryProviderAll" => "DockerRegistryProvider",
        "NpmRegistryProviderAll" => "NpmRegistryProvider",
        "MavenRepositoryProviderAll" => "MavenRepositoryProvider",
        "GenericResourceProviderAll" => "GenericResourceProvider",
        "ScmProviderById" => {
            return Some(format!(
                "query ScmProviderById($id: ID!) {{ SCMProvider(id: $id) {{ {CREDENTIAL_FIELDS} }} }}"
            ))
        }
        _ => return None,
    };
    Some(format!("query {name} {{ {root} {{ {CREDENTIAL_FIELDS} }} }}"))
}

#[async_trait]
impl CredentialQuery for GraphClient {
    async fn query(&self, name: &str, variables: Value) -> Result<Value> {
        let document = credential_document(name)
            .ok_or_else(|| Error::GraphError(format!("Unknown credential query {name}")))?;
        debug!(query = %name, "Running credential query");
        self.execute(&document, variables).await
    }
}

#[async_trait]
impl GoalStateUpdater for GraphClient {
    async fn update(&self, goal: &GoalEvent, update: GoalUpdate) -> Result<()> {
        let Some(id) = &goal.id else {
            warn!(goal = %goal.unique_name, "Goal has no id, skipping state update");
            return Ok(());
        };
        let variables = json!({
            "id": id,
            "goalSetId": goal.goal_set_id,
            "uniqueName": goal.unique_name,
            "state": update.state,
            "description": update.description,
            "phase": update.phase,
            "externalUrls": update.external_urls,
        });
        self.execute(UPDATE_GOAL_MUTATION, variables).await?;
        debug!(goal = %goal.unique_name, state = %update.state, "Updated goal state");
        Ok(())
    }
}
