//! Container registrations: the declarative description of what an isolated
//! goal runs, which artifacts it consumes and produces, and which secrets it
//! needs.

use k8s_openapi::api::core::v1::{Container, Volume};
use serde::{Deserialize, Serialize};

/// A goal container: a Kubernetes container plus declarative secrets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoalContainer {
    #[serde(flatten)]
    pub spec: Container,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<ContainerSecrets>,
}

impl GoalContainer {
    #[must_use]
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            spec: Container {
                name: name.to_string(),
                image: Some(image.to_string()),
                ..Default::default()
            },
            secrets: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }
}

/// Named artifact glob restored before or persisted after execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub classifier: String,
    /// Glob relative to the project root. Absent on entries recorded for a
    /// failed run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl CacheEntry {
    #[must_use]
    pub fn new(classifier: &str, pattern: &str) -> Self {
        Self {
            classifier: classifier.to_string(),
            pattern: Some(pattern.to_string()),
        }
    }

    #[must_use]
    pub fn without_pattern(&self) -> Self {
        Self {
            classifier: self.classifier.clone(),
            pattern: None,
        }
    }
}

/// Credential provider categories a secret can be sourced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Docker,
    Npm,
    Maven2,
    Scm,
    Atomist,
    Generic,
}

impl ProviderType {
    /// Providers that can only bind to an environment variable.
    #[must_use]
    pub fn requires_env_name(self) -> bool {
        matches!(self, ProviderType::Maven2 | ProviderType::Generic)
    }

    /// Providers whose records carry an identity worth exposing as `<NAME>_USER`.
    #[must_use]
    pub fn has_user(self) -> bool {
        !matches!(self, ProviderType::Atomist)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSecret {
    #[serde(rename = "type")]
    pub provider_type: ProviderType,

    /// Restrict matching provider records to these names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
}

/// Where a secret value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SecretValue {
    Provider(ProviderSecret),
    /// Base64 ciphertext decrypted with the configured private key.
    Encrypted(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretEnv {
    pub name: String,
    pub value: SecretValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretFileMount {
    pub mount_path: String,
    pub value: SecretValue,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSecrets {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<SecretEnv>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_mounts: Vec<SecretFileMount>,
}

impl ContainerSecrets {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.env.is_empty() && self.file_mounts.is_empty()
    }

    pub fn extend(&mut self, other: &ContainerSecrets) {
        self.env.extend(other.env.iter().cloned());
        self.file_mounts.extend(other.file_mounts.iter().cloned());
    }
}

/// Everything an isolated goal needs to run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRegistration {
    /// Name used to key the service registration in the goal data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// `containers[0]` decides goal success; the rest are sidecars.
    #[serde(default)]
    pub containers: Vec<GoalContainer>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<GoalContainer>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input: Vec<CacheEntry>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<CacheEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<ContainerSecrets>,
}

impl ContainerRegistration {
    #[must_use]
    pub fn main_container(&self) -> Option<&GoalContainer> {
        self.containers.first()
    }

    /// Shallow merge: every field the partial sets replaces ours.
    pub fn apply(&mut self, partial: PartialRegistration) {
        if let Some(name) = partial.name {
            self.name = Some(name);
        }
        if let Some(containers) = partial.containers {
            self.containers = containers;
        }
        if let Some(volumes) = partial.volumes {
            self.volumes = volumes;
        }
        if let Some(init_containers) = partial.init_containers {
            self.init_containers = init_containers;
        }
        if let Some(input) = partial.input {
            self.input = input;
        }
        if let Some(output) = partial.output {
            self.output = output;
        }
        if let Some(secrets) = partial.secrets {
            self.secrets = Some(secrets);
        }
    }

    /// All declared secrets: registration-level plus every container's.
    #[must_use]
    pub fn all_secrets(&self) -> ContainerSecrets {
        let mut secrets = self.secrets.clone().unwrap_or_default();
        for container in self.containers.iter().chain(self.init_containers.iter()) {
            if let Some(container_secrets) = &container.secrets {
                secrets.extend(container_secrets);
            }
        }
        secrets
    }
}

/// Result of a registration callback, shallow-merged over the static registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialRegistration {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub containers: Option<Vec<GoalContainer>>,
    #[serde(default)]
    pub volumes: Option<Vec<Volume>>,
    #[serde(default)]
    pub init_containers: Option<Vec<GoalContainer>>,
    #[serde(default)]
    pub input: Option<Vec<CacheEntry>>,
    #[serde(default)]
    pub output: Option<Vec<CacheEntry>>,
    #[serde(default)]
    pub secrets: Option<ContainerSecrets>,
}
