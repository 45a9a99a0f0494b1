use crate::error::{Error, Result};
use crate::goal::ExecuteGoalResult;
use std::path::Path;
use tracing::debug;

/// Read the result a goal container left behind. A missing file is `None`.
pub async fn read_result_file(path: &Path) -> Result<Option<ExecuteGoalResult>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No result file");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    if contents.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&contents).map(Some).map_err(|e| {
        Error::ExecutionError(format!(
            "Invalid result file {}: {e}",
            path.display()
        ))
    })
}
