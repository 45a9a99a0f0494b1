//! Human-readable messages from the many shapes a cluster API failure takes.

use serde_json::Value;

const GENERIC_MESSAGE: &str = "Unknown Kubernetes API error";

/// Message for a kube client error.
#[must_use]
pub fn k8s_error_message(err: &kube::Error) -> String {
    match err {
        kube::Error::Api(ae) if !ae.message.trim().is_empty() => ae.message.clone(),
        kube::Error::Api(ae) if !ae.reason.trim().is_empty() => {
            format!("{} ({})", ae.reason, ae.code)
        }
        kube::Error::Api(ae) => format!("{GENERIC_MESSAGE} ({})", ae.code),
        other => {
            let message = other.to_string();
            if let Some(document) = embedded_json(&message) {
                return json_error_message(&document);
            }
            if message.trim().is_empty() {
                GENERIC_MESSAGE.to_string()
            } else {
                message
            }
        }
    }
}

/// Message for a crate error, normalizing the Kubernetes variant.
#[must_use]
pub fn error_message(err: &crate::Error) -> String {
    match err {
        crate::Error::KubeError(e) => k8s_error_message(e),
        other => other.to_string(),
    }
}

/// JSON object trailing a transport error message, as a failing proxy or
/// webhook reports it.
fn embedded_json(message: &str) -> Option<Value> {
    let start = message.find('{')?;
    serde_json::from_str::<Value>(&message[start..])
        .ok()
        .filter(Value::is_object)
}

/// Message from a JSON error document, trying in order: `message`, `body`
/// as a string, `body.message`, `response.body` as a string and
/// `response.body.message`.
#[must_use]
pub fn json_error_message(err: &Value) -> String {
    let candidates = [
        err.get("message"),
        err.get("body"),
        err.pointer("/body/message"),
        err.pointer("/response/body"),
        err.pointer("/response/body/message"),
    ];
    candidates
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .find(|s| !s.trim().is_empty())
        .map_or_else(|| GENERIC_MESSAGE.to_string(), str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;
    use serde_json::json;

    #[test]
    fn prefers_api_message() {
        let err = kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "jobs.batch \"sdm-job\" already exists".to_string(),
            reason: "AlreadyExists".to_string(),
            code: 409,
        });
        assert_eq!(k8s_error_message(&err), "jobs.batch \"sdm-job\" already exists");
    }

    #[test]
    fn falls_back_to_reason_and_code() {
        let err = kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: String::new(),
            reason: "Forbidden".to_string(),
            code: 403,
        });
        assert_eq!(k8s_error_message(&err), "Forbidden (403)");
    }

    #[test]
    fn transport_errors_with_json_bodies_are_unwrapped() {
        let body = r#"{"response":{"body":{"message":"admission webhook denied the job"}}}"#;
        let err = kube::Error::Service(Box::new(std::io::Error::other(body)));
        assert_eq!(k8s_error_message(&err), "admission webhook denied the job");

        let plain = kube::Error::Service(Box::new(std::io::Error::other("connection reset")));
        assert!(k8s_error_message(&plain).contains("connection reset"));
    }

    #[test]
    fn json_messages_follow_priority_order() {
        assert_eq!(json_error_message(&json!({"message": "direct"})), "direct");
        assert_eq!(json_error_message(&json!({"body": "plain body"})), "plain body");
        assert_eq!(
            json_error_message(&json!({"body": {"message": "nested body"}})),
            "nested body"
        );
        assert_eq!(
            json_error_message(&json!({"response": {"body": "response body"}})),
            "response body"
        );
        assert_eq!(
            json_error_message(&json!({"response": {"body": {"message": "deepest"}}})),
            "deepest"
        );
        assert_eq!(
            json_error_message(&json!({"code": 500})),
            "Unknown Kubernetes API error"
        );
    }

    #[test]
    fn empty_direct_message_is_skipped() {
        assert_eq!(
            json_error_message(&json!({"message": "", "body": {"message": "from body"}})),
            "from body"
        );
    }
}
