//! Following the goal container: startup polling, log streaming, pod
//! watching and the join of the last two.
//!
//! Log streaming and watching are plain futures joined with `try_join!`
//! under a timeout. Whichever side finishes the join, dropping the other
//! future closes its HTTP stream, so no teardown bookkeeping is needed.

use crate::clients::ProgressLog;
use crate::error::{Error, Result};
use futures::{AsyncBufRead, AsyncBufReadExt, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{ContainerStateTerminated, Pod};
use kube::api::{Api, LogParams};
use kube::runtime::{watcher, WatchStreamExt};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const POLL_ATTEMPTS: u32 = 240;

/// How the goal container ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerExit {
    pub container: String,
    pub exit_code: i32,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl ContainerExit {
    fn from_terminated(container: &str, state: &ContainerStateTerminated) -> Self {
        Self {
            container: container.to_string(),
            exit_code: state.exit_code,
            reason: state.reason.clone(),
            message: state.message.clone(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// One-line summary including the pod's reason and message when present.
    #[must_use]
    pub fn describe(&self) -> String {
        let mut text = format!(
            "Container '{}' exited with code {}",
            self.container, self.exit_code
        );
        if let Some(reason) = &self.reason {
            text.push_str(&format!(" ({reason})"));
        }
        if let Some(message) = self.message.as_deref().filter(|m| !m.trim().is_empty()) {
            text.push_str(&format!(": {}", message.trim()));
        }
        text
    }
}

/// Termination state of `container` in `pod`, if it has terminated.
#[must_use]
pub fn terminated_state(pod: &Pod, container: &str) -> Option<ContainerExit> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|s| s.name == container)?
        .state
        .as_ref()?
        .terminated
        .as_ref()
        .map(|t| ContainerExit::from_terminated(container, t))
}

/// True once `container` is running or has already terminated.
#[must_use]
pub fn container_started(pod: &Pod, container: &str) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find(|s| s.name == container))
        .and_then(|s| s.state.as_ref())
        .is_some_and(|state| state.running.is_some() || state.terminated.is_some())
}

/// Poll the pod until the container has started.
pub async fn wait_for_container(
    pods: &Api<Pod>,
    pod_name: &str,
    container: &str,
    interval: Duration,
    attempts: u32,
) -> Result<()> {
    for attempt in 1..=attempts {
        match pods.get(pod_name).await {
            Ok(pod) if container_started(&pod, container) => {
                debug!(pod = %pod_name, container = %container, attempt, "Container started");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => debug!(pod = %pod_name, "Failed to read pod: {}", e),
        }
        tokio::time::sleep(interval).await;
    }
    Err(Error::Timeout(format!(
        "Container '{container}' in pod {pod_name} did not start after {attempts} checks"
    )))
}

/// Stream the container's log into `log` until the container closes it.
pub async fn stream_logs(
    pods: &Api<Pod>,
    pod_name: &str,
    container: &str,
    log: &dyn ProgressLog,
) -> Result<()> {
    let params = LogParams {
        container: Some(container.to_string()),
        follow: true,
        ..Default::default()
    };
    let reader = pods.log_stream(pod_name, &params).await?;
    let lines = copy_lines(Box::pin(reader), log).await?;
    debug!(pod = %pod_name, container = %container, lines, "Log stream complete");
    Ok(())
}

/// Copy newline-delimited output into `log`. Bytes that are not UTF-8 are
/// replaced rather than failing the stream.
pub async fn copy_lines<R>(mut reader: R, log: &dyn ProgressLog) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let mut count = 0;
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        log.write(line.trim_end_matches(['\n', '\r'])).await?;
        count += 1;
    }
    log.flush().await?;
    Ok(count)
}

/// Watch the pod until the container terminates. A non-zero exit is an error
/// so the join stops without waiting for the log stream.
pub async fn watch_container(pods: Api<Pod>, pod_name: &str, container: &str) -> Result<ContainerExit> {
    let config = watcher::Config::default().fields(&format!("metadata.name={pod_name}"));
    let mut events = watcher(pods, config).applied_objects().boxed();
    while let Some(pod) = events.try_next().await? {
        if let Some(exit) = terminated_state(&pod, container) {
            info!(pod = %pod_name, "{}", exit.describe());
            return if exit.is_success() {
                Ok(exit)
            } else {
                Err(Error::ExecutionError(exit.describe()))
            };
        }
    }
    Err(Error::ExecutionError(format!(
        "Watch of pod {pod_name} ended before container '{container}' terminated"
    )))
}

/// Succeed only when both the log stream and the watch succeed; fail as soon
/// as either fails or `timeout` passes.
pub async fn join_completion<L, W>(logs: L, watch: W, timeout: Duration) -> Result<ContainerExit>
where
    L: Future<Output = Result<()>>,
    W: Future<Output = Result<ContainerExit>>,
{
    match tokio::time::timeout(timeout, async { tokio::try_join!(logs, watch) }).await {
        Ok(Ok(((), exit))) => Ok(exit),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            warn!("Goal did not complete within {:?}", timeout);
            Err(Error::Timeout(format!(
                "Goal did not complete within the goal timeout of {timeout:?}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn exit(code: i32) -> ContainerExit {
        ContainerExit {
            container: "goal".to_string(),
            exit_code: code,
            reason: None,
            message: None,
        }
    }

    /// Sets its flag when dropped, standing in for an open stream.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn pod(states: serde_json::Value) -> Pod {
        serde_json::from_value(json!({
            "metadata": {"name": "job-pod"},
            "status": {"containerStatuses": states}
        }))
        .unwrap()
    }

    fn status(name: &str, state: serde_json::Value) -> serde_json::Value {
        json!({"name": name, "ready": false, "restartCount": 0, "image": "", "imageID": "", "state": state})
    }

    #[tokio::test]
    async fn success_needs_both_sides() {
        let logs = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        };
        let watch = async { Ok(exit(0)) };
        let result = join_completion(logs, watch, Duration::from_secs(5)).await;
        assert_eq!(result.unwrap(), exit(0));
    }

    #[tokio::test]
    async fn failed_exit_wins_over_pending_logs() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(released.clone());
        let logs = async move {
            let _stream = flag;
            futures::future::pending::<()>().await;
            Ok(())
        };
        let watch = async { Err(Error::ExecutionError(exit(2).describe())) };

        let err = join_completion(logs, watch, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited with code 2"));
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn log_error_fails_the_join() {
        let logs = async { Err(Error::IoError(std::io::Error::other("stream reset"))) };
        let watch = futures::future::pending::<Result<ContainerExit>>();
        let err = join_completion(logs, watch, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IoError(_)));
    }

    #[tokio::test]
    async fn timeout_names_the_limit_and_releases_both_sides() {
        let logs_released = Arc::new(AtomicBool::new(false));
        let watch_released = Arc::new(AtomicBool::new(false));
        let (log_flag, watch_flag) = (
            DropFlag(logs_released.clone()),
            DropFlag(watch_released.clone()),
        );
        let logs = async move {
            let _stream = log_flag;
            futures::future::pending::<()>().await;
            Ok(())
        };
        let watch = async move {
            let _watch = watch_flag;
            futures::future::pending::<()>().await;
            Ok(exit(0))
        };

        let err = join_completion(logs, watch, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(err.to_string().contains("50ms"));
        assert!(logs_released.load(Ordering::SeqCst));
        assert!(watch_released.load(Ordering::SeqCst));
    }

    #[derive(Default)]
    struct RecordingLog {
        lines: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ProgressLog for RecordingLog {
        async fn write(&self, line: &str) -> Result<()> {
            self.lines.lock().unwrap().push(line.to_string());
            Ok(())
        }

        async fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn invalid_utf8_output_is_replaced_not_fatal() {
        let log = RecordingLog::default();
        let output: &[u8] = b"npm install\r\nprogress \xff\xfe 50%\ndone";
        let count = copy_lines(futures::io::Cursor::new(output), &log).await.unwrap();

        assert_eq!(count, 3);
        let lines = log.lines.lock().unwrap();
        assert_eq!(lines[0], "npm install");
        assert_eq!(lines[1], "progress \u{fffd}\u{fffd} 50%");
        assert_eq!(lines[2], "done");
    }

    #[test]
    fn reads_termination_of_the_named_container_only() {
        let pod = pod(json!([
            status("sidecar", json!({"terminated": {"exitCode": 1, "reason": "Error"}})),
            status("goal", json!({"running": {}}))
        ]));
        assert!(terminated_state(&pod, "goal").is_none());
        assert!(container_started(&pod, "goal"));

        let exit = terminated_state(&pod, "sidecar").unwrap();
        assert_eq!(exit.exit_code, 1);
        assert_eq!(exit.describe(), "Container 'sidecar' exited with code 1 (Error)");
    }

    #[test]
    fn waiting_container_has_not_started() {
        let pod = pod(json!([status("goal", json!({"waiting": {"reason": "ContainerCreating"}}))]));
        assert!(!container_started(&pod, "goal"));
        assert!(!container_started(&pod, "missing"));
    }
}
