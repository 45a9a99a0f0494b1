use super::decrypt::decrypt_secret;
use super::provider::{fetch_records, CredentialQuery, ProviderRecord};
use crate::config::DecryptionConfig;
use crate::error::{Error, Result};
use crate::goal::{
    GoalEvent, ProviderSecret, ProviderType, SecretEnv, SecretFileMount, SecretValue,
};
use crate::k8s::job_spec::env_var;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::EnvVar;
use serde_json::{json, Map, Value};
use tracing::{debug, instrument};

/// Resolved content for one secret file mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFile {
    pub mount_path: String,
    pub content: String,
}

/// Turns declarative secrets into environment variables and file contents.
pub struct SecretResolver<'a> {
    client: &'a dyn CredentialQuery,
    goal: &'a GoalEvent,
    api_key: Option<&'a str>,
    decryption: Option<&'a DecryptionConfig>,
}

impl<'a> SecretResolver<'a> {
    #[must_use]
    pub fn new(
        client: &'a dyn CredentialQuery,
        goal: &'a GoalEvent,
        api_key: Option<&'a str>,
        decryption: Option<&'a DecryptionConfig>,
    ) -> Self {
        Self {
            client,
            goal,
            api_key,
            decryption,
        }
    }

    #[instrument(skip_all, fields(goal = %self.goal.unique_name))]
    pub async fn resolve_env(&self, secrets: &[SecretEnv]) -> Result<Vec<EnvVar>> {
        let mut env = Vec::new();
        for secret in secrets {
            match &secret.value {
                SecretValue::Encrypted(ciphertext) => {
                    let value = decrypt_secret(ciphertext, self.decryption)?;
                    env.push(env_var(&secret.name, &value));
                }
                SecretValue::Provider(provider) => {
                    env.extend(self.provider_env(&secret.name, provider).await?);
                }
            }
        }
        debug!("Resolved {} secret environment variables", env.len());
        Ok(env)
    }

    #[instrument(skip_all, fields(goal = %self.goal.unique_name))]
    pub async fn resolve_files(&self, mounts: &[SecretFileMount]) -> Result<Vec<ResolvedFile>> {
        validate_file_mounts(mounts)?;
        let mut files = Vec::new();
        for mount in mounts {
            let content = match &mount.value {
                SecretValue::Encrypted(ciphertext) => decrypt_secret(ciphertext, self.decryption)?,
                SecretValue::Provider(provider) => self.provider_file(provider).await?,
            };
            files.push(ResolvedFile {
                mount_path: mount.mount_path.clone(),
                content,
            });
        }
        Ok(files)
    }

    async fn provider_env(&self, name: &str, provider: &ProviderSecret) -> Result<Vec<EnvVar>> {
        if provider.provider_type == ProviderType::Atomist {
            return Ok(vec![env_var(name, self.atomist_api_key()?)]);
        }

        let records = self.records(provider).await?;
        let record = match records.as_slice() {
            [] => {
                debug!(env = %name, "No {:?} provider matched", provider.provider_type);
                return Ok(Vec::new());
            }
            [record] => record,
            _ => {
                return Err(Error::AmbiguousSecret(format!(
                    "{} {:?} providers match secret {name}, expected one",
                    records.len(),
                    provider.provider_type
                )))
            }
        };

        let mut env = Vec::new();
        if let Some(secret) = record.secret() {
            env.push(env_var(name, secret));
        }
        if provider.provider_type.has_user() {
            if let Some(login) = record.login() {
                env.push(env_var(&format!("{name}_USER"), login));
            }
        }
        Ok(env)
    }

    async fn provider_file(&self, provider: &ProviderSecret) -> Result<String> {
        match provider.provider_type {
            ProviderType::Atomist => Ok(self.atomist_api_key()?.to_string()),
            ProviderType::Docker => Ok(docker_config(&self.records(provider).await?)),
            ProviderType::Npm => Ok(npmrc(&self.records(provider).await?)),
            ProviderType::Scm => {
                let records = self.records(provider).await?;
                let token = records.iter().find_map(ProviderRecord::secret);
                Ok(token.unwrap_or_default().to_string())
            }
            ProviderType::Maven2 | ProviderType::Generic => Err(unnamed_provider(provider)),
        }
    }

    async fn records(&self, provider: &ProviderSecret) -> Result<Vec<ProviderRecord>> {
        fetch_records(
            self.client,
            provider.provider_type,
            &provider.names,
            self.goal,
        )
        .await
    }

    fn atomist_api_key(&self) -> Result<&str> {
        self.api_key.ok_or_else(|| {
            Error::SecretError("Atomist API key secret requested but none is configured".to_string())
        })
    }
}

/// Reject file mounts for providers that can only bind to a variable.
pub fn validate_file_mounts(mounts: &[SecretFileMount]) -> Result<()> {
    for mount in mounts {
        if let SecretValue::Provider(provider) = &mount.value {
            if provider.provider_type.requires_env_name() {
                return Err(unnamed_provider(provider));
            }
        }
    }
    Ok(())
}

fn unnamed_provider(provider: &ProviderSecret) -> Error {
    Error::SecretError(format!(
        "{:?} provider secrets need an environment variable name",
        provider.provider_type
    ))
}

/// Docker `config.json` with one `auths` entry per registry.
fn docker_config(records: &[ProviderRecord]) -> String {
    let mut auths = Map::new();
    for record in records {
        let (Some(url), Some(secret)) = (record.url.as_deref(), record.secret()) else {
            continue;
        };
        let user = record.login().unwrap_or_default();
        auths.insert(
            url.to_string(),
            json!({ "auth": STANDARD.encode(format!("{user}:{secret}")) }),
        );
    }
    json!({ "auths": Value::Object(auths) }).to_string()
}

/// `.npmrc` with an auth token line per registry.
fn npmrc(records: &[ProviderRecord]) -> String {
    records
        .iter()
        .filter_map(|record| {
            let url = record.url.as_deref()?;
            let secret = record.secret()?;
            let host = url
                .trim_start_matches("https:")
                .trim_start_matches("http:")
                .trim_start_matches("//")
                .trim_end_matches('/');
            Some(format!("//{host}/:_authToken={secret}\n"))
        })
        .collect()
}
