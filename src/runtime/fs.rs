//! FsManager - default host storage backed by a directory on disk.
//!
//! Answers the agent's file requests within a workspace root; paths that
//! escape the root are rejected.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::api::types::ApiError;
use crate::protocols::host::AgentHost;
use crate::runtime::path::{
    canonicalize_workspace_root, resolve_path_in_workspace, resolve_write_target_in_workspace,
};

const MAX_READ_BYTES: u64 = 1024 * 1024;

/// Per-workspace file system host.
pub struct FsManager {
    workspace_root: PathBuf,
}

impl FsManager {
    /// Create a new FsManager scoped to an existing directory.
    pub fn new(workspace_root: impl AsRef<Path>) -> Result<Self, ApiError> {
        let workspace_root = canonicalize_workspace_root(workspace_root.as_ref())?;
        log::info!(
            "File host scoped to workspace: root={}",
            workspace_root.display()
        );
        Ok(Self { workspace_root })
    }
}

#[async_trait]
impl AgentHost for FsManager {
    async fn read_text_file(&self, path: &str) -> Result<String, ApiError> {
        let resolved = match resolve_path_in_workspace(&self.workspace_root, path) {
            Ok(resolved) => resolved,
            Err(ApiError::PathNotFound { .. }) => {
                log::debug!("Read of missing file returns empty content: path={path}");
                return Ok(String::new());
            }
            Err(e) => return Err(e),
        };

        let metadata = fs::metadata(&resolved)
            .await
            .map_err(|e| ApiError::IoError {
                message: format!("Failed to read metadata for '{path}': {e}"),
            })?;

        if !metadata.is_file() {
            return Err(ApiError::InvalidInput {
                message: format!("Path is not a file: {path}"),
            });
        }

        if metadata.len() > MAX_READ_BYTES {
            return Err(ApiError::InvalidInput {
                message: format!("File too large to read: {path} (max {MAX_READ_BYTES} bytes)"),
            });
        }

        fs::read_to_string(&resolved)
            .await
            .map_err(|e| ApiError::IoError {
                message: format!("Failed to read file '{path}': {e}"),
            })
    }

    async fn write_text_file(&self, path: &str, content: &str) -> Result<(), ApiError> {
        let resolved = resolve_write_target_in_workspace(&self.workspace_root, path)?;

        match fs::symlink_metadata(&resolved).await {
            Ok(metadata) => {
                if metadata.file_type().is_symlink() {
                    return Err(ApiError::InvalidInput {
                        message: format!("Path is a symlink: {path}"),
                    });
                }
                if metadata.is_dir() {
                    return Err(ApiError::InvalidInput {
                        message: format!("Path is a directory: {path}"),
                    });
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ApiError::IoError {
                    message: format!("Failed to read metadata for '{path}': {e}"),
                });
            }
        }

        let parent = resolved.parent().ok_or_else(|| ApiError::InvalidInput {
            message: format!("Path must include a parent directory: {path}"),
        })?;
        let temp_path = parent.join(format!(".tmp_write_{}", Uuid::new_v4()));
        let mut temp_file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| ApiError::IoError {
                message: format!("Failed to create temp file for '{path}': {e}"),
            })?;

        let written = async {
            temp_file.write_all(content.as_bytes()).await?;
            temp_file.flush().await?;
            temp_file.sync_all().await
        }
        .await;
        drop(temp_file);

        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(ApiError::IoError {
                message: format!("Failed to write temp file for '{path}': {e}"),
            });
        }

        if let Err(e) = replace_file(&temp_path, &resolved).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }

        log::debug!("Wrote text file: path={path}, bytes={}", content.len());
        Ok(())
    }
}

async fn replace_file(from: &Path, to: &Path) -> Result<(), ApiError> {
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            fs::remove_file(to).await.map_err(|err| ApiError::IoError {
                message: format!("Failed to replace existing file: {err}"),
            })?;
            fs::rename(from, to).await.map_err(|err| ApiError::IoError {
                message: format!("Failed to replace file: {err}"),
            })
        }
        Err(e) => Err(ApiError::IoError {
            message: format!("Failed to replace file: {e}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    async fn temp_root() -> PathBuf {
        let root = env::temp_dir().join(format!("fs_root_{}", Uuid::new_v4()));
        fs::create_dir_all(&root)
            .await
            .expect("failed to create root dir");
        root
    }

    #[tokio::test]
    async fn test_read_text_file_success() {
        let root = temp_root().await;
        fs::write(root.join("hello.txt"), "hello world")
            .await
            .expect("failed to write file");

        let manager = FsManager::new(&root).unwrap();
        let content = manager.read_text_file("hello.txt").await.unwrap();
        assert_eq!(content, "hello world");

        fs::remove_dir_all(&root)
            .await
            .expect("failed to remove root dir");
    }

    #[tokio::test]
    async fn test_read_missing_file_is_empty() {
        let root = temp_root().await;

        let manager = FsManager::new(&root).unwrap();
        assert_eq!(manager.read_text_file("missing.md").await.unwrap(), "");

        fs::remove_dir_all(&root)
            .await
            .expect("failed to remove root dir");
    }

    #[tokio::test]
    async fn test_read_text_file_rejects_large_file() {
        let root = temp_root().await;
        let content = vec![b'a'; (MAX_READ_BYTES as usize) + 1];
        fs::write(root.join("large.txt"), content)
            .await
            .expect("failed to write file");

        let manager = FsManager::new(&root).unwrap();
        let result = manager.read_text_file("large.txt").await;
        assert!(matches!(result, Err(ApiError::InvalidInput { .. })));

        fs::remove_dir_all(&root)
            .await
            .expect("failed to remove root dir");
    }

    #[tokio::test]
    async fn test_write_text_file_creates_and_replaces() {
        let root = temp_root().await;

        let manager = FsManager::new(&root).unwrap();
        manager.write_text_file("note.md", "first").await.unwrap();
        manager.write_text_file("note.md", "second").await.unwrap();

        let content = fs::read_to_string(root.join("note.md"))
            .await
            .expect("failed to read written file");
        assert_eq!(content, "second");

        fs::remove_dir_all(&root)
            .await
            .expect("failed to remove root dir");
    }

    #[tokio::test]
    async fn test_write_text_file_rejects_directory() {
        let root = temp_root().await;
        fs::create_dir_all(root.join("nested"))
            .await
            .expect("failed to create nested dir");

        let manager = FsManager::new(&root).unwrap();
        let result = manager.write_text_file("nested", "data").await;
        assert!(matches!(result, Err(ApiError::InvalidInput { .. })));

        fs::remove_dir_all(&root)
            .await
            .expect("failed to remove root dir");
    }
}
