//! Goal artifact cache.
//!
//! Output entries of a goal are archived per classifier so later goals of the
//! same push can restore them as input. Archives live under the cache path,
//! which the job spec already isolates per workspace.

use crate::error::{Error, Result};
use crate::goal::{CacheEntry, GoalEvent};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder as TarBuilder};
use tracing::{debug, info, warn};

#[async_trait]
pub trait GoalCache: Send + Sync {
    /// Archive the files matching each entry's pattern under `project_dir`.
    async fn put(&self, goal: &GoalEvent, project_dir: &Path, entries: &[CacheEntry]) -> Result<()>;

    /// Extract previously stored entries into `target_dir`. Missing entries
    /// are skipped.
    async fn restore(
        &self,
        goal: &GoalEvent,
        target_dir: &Path,
        entries: &[CacheEntry],
    ) -> Result<()>;
}

pub struct FileSystemGoalCache {
    root: PathBuf,
}

impl FileSystemGoalCache {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn archive_path(&self, goal: &GoalEvent, classifier: &str) -> PathBuf {
        let classifier: String = classifier
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.root
            .join("goal-cache")
            .join(&goal.sha)
            .join(format!("{classifier}.tar.gz"))
    }
}

#[async_trait]
impl GoalCache for FileSystemGoalCache {
    async fn put(&self, goal: &GoalEvent, project_dir: &Path, entries: &[CacheEntry]) -> Result<()> {
        for entry in entries {
            let archive = self.archive_path(goal, &entry.classifier);
            let project_dir = project_dir.to_path_buf();
            let pattern = entry.pattern.clone();
            let files = tokio::task::spawn_blocking(move || {
                write_archive(&archive, &project_dir, pattern.as_deref())
            })
            .await
            .map_err(|e| Error::CacheError(format!("Cache task failed: {e}")))??;
            info!(
                classifier = %entry.classifier,
                "Cached {} files for goal {}",
                files,
                goal.unique_name
            );
        }
        Ok(())
    }

    async fn restore(
        &self,
        goal: &GoalEvent,
        target_dir: &Path,
        entries: &[CacheEntry],
    ) -> Result<()> {
        for entry in entries {
            let archive = self.archive_path(goal, &entry.classifier);
            if !tokio::fs::try_exists(&archive).await.unwrap_or(false) {
                warn!(classifier = %entry.classifier, "No cache entry to restore");
                continue;
            }
            let target_dir = target_dir.to_path_buf();
            tokio::task::spawn_blocking(move || extract_archive(&archive, &target_dir))
                .await
                .map_err(|e| Error::CacheError(format!("Cache task failed: {e}")))??;
            debug!(classifier = %entry.classifier, "Restored cache entry");
        }
        Ok(())
    }
}

/// Write the files matching `pattern` into a tar.gz at `archive`. An absent
/// pattern writes an empty archive. Returns the number of files archived.
fn write_archive(archive: &Path, project_dir: &Path, pattern: Option<&str>) -> Result<usize> {
    if let Some(parent) = archive.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(archive)?;
    let enc = GzEncoder::new(file, Compression::default());
    let mut tar = TarBuilder::new(enc);

    let mut count = 0;
    if let Some(pattern) = pattern {
        let full_pattern = project_dir.join(pattern);
        let paths = glob::glob(&full_pattern.to_string_lossy())
            .map_err(|e| Error::CacheError(format!("Invalid cache pattern '{pattern}': {e}")))?;
        for path in paths.flatten() {
            if !path.is_file() {
                continue;
            }
            let relative = path.strip_prefix(project_dir).unwrap_or(&path);
            tar.append_path_with_name(&path, relative)?;
            count += 1;
        }
    }

    tar.into_inner()?.finish()?;
    Ok(count)
}

fn extract_archive(archive: &Path, target_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(target_dir)?;
    let file = File::open(archive)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive.unpack(target_dir)?;
    Ok(())
}
