//! Helpers for running the cluster-facing code against a `wiremock` server.

use kube::Client;
use serde_json::{json, Value};
use wiremock::MockServer;

/// Client whose API server is `server`.
pub fn mock_client(server: &MockServer) -> Client {
    let uri = server.uri().parse().unwrap();
    Client::try_from(kube::Config::new(uri)).unwrap()
}

/// `Status` body of a failed API call.
pub fn failure_status(code: u16, reason: &str, message: &str) -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": message,
        "reason": reason,
        "code": code
    })
}

/// `Status` body of a successful delete.
pub fn success_status() -> Value {
    json!({"kind": "Status", "apiVersion": "v1", "metadata": {}, "status": "Success"})
}

/// Methods and paths of every request the server saw, in order.
pub async fn requests(server: &MockServer) -> Vec<(String, String)> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|r| (r.method.to_string(), r.url.path().to_string()))
        .collect()
}
