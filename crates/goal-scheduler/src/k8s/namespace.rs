use std::path::Path;
use tracing::debug;

pub const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";
pub const DEFAULT_NAMESPACE: &str = "default";

const NAMESPACE_ENV_VARS: [&str; 2] = ["ATOMIST_POD_NAMESPACE", "ATOMIST_DEPLOYMENT_NAMESPACE"];

/// Namespace this process operates in: environment, then the mounted
/// service-account file, then `default`.
pub async fn read_namespace() -> String {
    let env: Vec<Option<String>> = NAMESPACE_ENV_VARS
        .iter()
        .map(|name| std::env::var(name).ok())
        .collect();
    resolve_namespace(&env, Path::new(SERVICE_ACCOUNT_NAMESPACE_FILE)).await
}

pub async fn resolve_namespace(env: &[Option<String>], service_account_file: &Path) -> String {
    if let Some(ns) = env
        .iter()
        .flatten()
        .map(|ns| ns.trim())
        .find(|ns| !ns.is_empty())
    {
        return ns.to_string();
    }

    match tokio::fs::read_to_string(service_account_file).await {
        Ok(contents) if !contents.trim().is_empty() => contents.trim().to_string(),
        Ok(_) => DEFAULT_NAMESPACE.to_string(),
        Err(e) => {
            debug!(
                "Service account namespace file {} unreadable ({}), using '{}'",
                service_account_file.display(),
                e,
                DEFAULT_NAMESPACE
            );
            DEFAULT_NAMESPACE.to_string()
        }
    }
}
