//! Secret resolution and the on-disk layout of secret files inside a job.
//!
//! Secret files are written by the init container into `emptyDir` volumes,
//! one volume per distinct target directory. The fulfillment callback and
//! the init container both derive that layout from the declarations alone,
//! so the file contents never travel through the goal data.

pub mod decrypt;
pub mod provider;
pub mod resolver;

pub use provider::{CredentialQuery, ProviderRecord};
pub use resolver::{ResolvedFile, SecretResolver};

use crate::error::{Error, Result};
use crate::goal::SecretFileMount;
use std::path::Path;

/// Where the init container mounts secret volumes.
pub const SECRET_ROOT: &str = "/atm/secret";

/// Placement of one secret file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretFile {
    /// Path the goal containers see.
    pub mount_path: String,
    pub volume: String,
    pub file_name: String,
}

impl SecretFile {
    /// Mount point of this file's volume in the init container.
    #[must_use]
    pub fn init_dir(&self) -> String {
        format!("{SECRET_ROOT}/{}", self.volume)
    }
}

/// Assign each file mount a volume, numbered by first appearance of its
/// directory. Repeated mount paths keep their first placement.
pub fn secret_file_layout(mounts: &[SecretFileMount]) -> Result<Vec<SecretFile>> {
    let mut dirs: Vec<String> = Vec::new();
    let mut files: Vec<SecretFile> = Vec::new();
    for mount in mounts {
        if files.iter().any(|f| f.mount_path == mount.mount_path) {
            continue;
        }
        let path = Path::new(&mount.mount_path);
        let (Some(dir), Some(file_name)) = (
            path.parent().and_then(Path::to_str),
            path.file_name().and_then(|f| f.to_str()),
        ) else {
            return Err(Error::ConfigError(format!(
                "Secret mount path '{}' does not name a file",
                mount.mount_path
            )));
        };
        let index = match dirs.iter().position(|d| d == dir) {
            Some(index) => index,
            None => {
                dirs.push(dir.to_string());
                dirs.len() - 1
            }
        };
        files.push(SecretFile {
            mount_path: mount.mount_path.clone(),
            volume: format!("secret-{index}"),
            file_name: file_name.to_string(),
        });
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goal::SecretValue;

    fn mount(path: &str) -> SecretFileMount {
        SecretFileMount {
            mount_path: path.to_string(),
            value: SecretValue::Encrypted("x".to_string()),
        }
    }

    #[test]
    fn shares_one_volume_per_directory() {
        let layout = secret_file_layout(&[
            mount("/opt/secret/a.json"),
            mount("/root/.npmrc"),
            mount("/opt/secret/b.json"),
        ])
        .unwrap();
        assert_eq!(layout.len(), 3);
        assert_eq!(layout[0].volume, "secret-0");
        assert_eq!(layout[1].volume, "secret-1");
        assert_eq!(layout[2].volume, "secret-0");
        assert_eq!(layout[2].init_dir(), "/atm/secret/secret-0");
        assert_eq!(layout[2].file_name, "b.json");
    }

    #[test]
    fn repeated_paths_are_placed_once() {
        let layout =
            secret_file_layout(&[mount("/root/.npmrc"), mount("/root/.npmrc")]).unwrap();
        assert_eq!(layout.len(), 1);
    }

    #[test]
    fn root_is_not_a_file() {
        assert!(secret_file_layout(&[mount("/")]).unwrap_err().is_configuration());
    }
}
