//! Credential provider lookups through the graph API.

use crate::error::Result;
use crate::goal::{GoalEvent, ProviderType};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

/// Runs a named credential query with variables and returns the `data` document.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialQuery: Send + Sync {
    async fn query(&self, name: &str, variables: Value) -> Result<Value>;
}

/// Owner of a credential, exposed as `<NAME>_USER`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CredentialOwner {
    #[serde(default)]
    pub login: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Credential {
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub owner: Option<CredentialOwner>,
}

/// One provider record as returned by the provider queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRecord {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub credential: Option<Credential>,
}

impl ProviderRecord {
    #[must_use]
    pub fn secret(&self) -> Option<&str> {
        self.credential.as_ref()?.secret.as_deref()
    }

    #[must_use]
    pub fn login(&self) -> Option<&str> {
        self.credential.as_ref()?.owner.as_ref()?.login.as_deref()
    }
}

/// Query used to list records of a provider type.
#[must_use]
pub fn query_name(provider_type: ProviderType) -> Option<&'static str> {
    match provider_type {
        ProviderType::Docker => Some("DockerRegistryProviderAll"),
        ProviderType::Npm => Some("NpmRegistryProviderAll"),
        ProviderType::Maven2 => Some("MavenRepositoryProviderAll"),
        ProviderType::Generic => Some("GenericResourceProviderAll"),
        ProviderType::Scm => Some("ScmProviderById"),
        ProviderType::Atomist => None,
    }
}

/// Fetch the records of one provider type, keeping only those named in
/// `names` when it is non-empty.
pub async fn fetch_records(
    client: &dyn CredentialQuery,
    provider_type: ProviderType,
    names: &[String],
    goal: &GoalEvent,
) -> Result<Vec<ProviderRecord>> {
    let Some(name) = query_name(provider_type) else {
        return Ok(Vec::new());
    };
    let variables = match provider_type {
        ProviderType::Scm => json!({ "id": goal.provider_id }),
        _ => json!({}),
    };
    let data = client.query(name, variables).await?;
    let records = records_from(&data, name)?;
    Ok(records
        .into_iter()
        .filter(|record| {
            names.is_empty()
                || record
                    .name
                    .as_ref()
                    .is_some_and(|n| names.iter().any(|wanted| wanted == n))
        })
        .collect())
}

/// The first list in the response document holds the records. A response
/// without one means the provider has no records.
fn records_from(data: &Value, query: &str) -> Result<Vec<ProviderRecord>> {
    let Some(list) = data
        .as_object()
        .and_then(|fields| fields.values().find(|v| v.is_array()))
    else {
        debug!(query, "Provider query returned no records");
        return Ok(Vec::new());
    };
    Ok(serde_json::from_value(list.clone())?)
}
