//! Path utilities for workspace boundary validation and request normalization.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use crate::api::types::ApiError;

/// Canonicalizes and validates a workspace root directory.
///
/// # Arguments
/// * `root` - The path to validate (can be relative or absolute)
///
/// # Returns
/// * `Ok(PathBuf)` - Canonicalized absolute path
/// * `Err(ApiError)` - If path doesn't exist, isn't a directory, or can't be canonicalized
pub fn canonicalize_workspace_root(root: &Path) -> Result<PathBuf, ApiError> {
    let display = root.display().to_string();
    if display.trim().is_empty() {
        return Err(ApiError::InvalidInput {
            message: "Root directory cannot be empty".to_string(),
        });
    }

    if !root.exists() {
        return Err(ApiError::PathNotFound { path: display });
    }

    if !root.is_dir() {
        return Err(ApiError::InvalidInput {
            message: format!("Path is not a directory: {display}"),
        });
    }

    root.canonicalize().map_err(|e| ApiError::IoError {
        message: format!("Failed to canonicalize path '{display}': {e}"),
    })
}

/// Turn a path sent by the agent into a root-relative form.
///
/// Agents send absolute paths under the working directory as well as
/// "/notes/a.md"-style paths meaning "relative to the root". Both become
/// `notes/a.md`. Separators are normalized to `/`.
pub fn normalize_request_path(path: &str, root: &Path) -> String {
    let candidate = Path::new(path);
    let relative = candidate
        .strip_prefix(root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| candidate.to_path_buf());

    let joined = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            Component::ParentDir => Some("..".to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/");

    joined.trim_start_matches('/').to_string()
}

/// Resolve an existing file path within a workspace root.
///
/// Performs a canonicalization-based boundary check so the resolved path
/// (symlinks included) stays within the root.
pub fn resolve_path_in_workspace(root: &Path, input: &str) -> Result<PathBuf, ApiError> {
    if input.trim().is_empty() {
        return Err(ApiError::InvalidInput {
            message: "Path cannot be empty".to_string(),
        });
    }

    let root = canonical_root(root)?;
    let candidate = root.join(Path::new(input));

    let resolved = candidate.canonicalize().map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            ApiError::PathNotFound {
                path: input.to_string(),
            }
        } else {
            ApiError::IoError {
                message: format!("Failed to canonicalize path '{input}': {e}"),
            }
        }
    })?;

    if !resolved.starts_with(&root) {
        return Err(ApiError::InvalidInput {
            message: format!("Path escapes workspace root: {input}"),
        });
    }

    Ok(resolved)
}

/// Resolve a path that is about to be written.
///
/// The file itself may not exist yet; its parent directory must, and the
/// parent has to stay within the root after canonicalization.
pub fn resolve_write_target_in_workspace(root: &Path, input: &str) -> Result<PathBuf, ApiError> {
    if input.trim().is_empty() {
        return Err(ApiError::InvalidInput {
            message: "Path cannot be empty".to_string(),
        });
    }

    let root = canonical_root(root)?;
    let candidate = root.join(Path::new(input));

    let file_name = candidate
        .file_name()
        .map(|name| name.to_os_string())
        .ok_or_else(|| ApiError::InvalidInput {
            message: format!("Path must name a file: {input}"),
        })?;
    let parent = candidate.parent().ok_or_else(|| ApiError::InvalidInput {
        message: format!("Path must include a parent directory: {input}"),
    })?;

    let parent = parent.canonicalize().map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            ApiError::PathNotFound {
                path: input.to_string(),
            }
        } else {
            ApiError::IoError {
                message: format!("Failed to canonicalize parent of '{input}': {e}"),
            }
        }
    })?;

    if !parent.starts_with(&root) {
        return Err(ApiError::InvalidInput {
            message: format!("Path escapes workspace root: {input}"),
        });
    }

    Ok(parent.join(file_name))
}

fn canonical_root(root: &Path) -> Result<PathBuf, ApiError> {
    let root_display = root.display().to_string();
    root.canonicalize().map_err(|e| ApiError::IoError {
        message: format!("Failed to canonicalize workspace root '{root_display}': {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use uuid::Uuid;

    #[test]
    fn test_canonicalize_existing_directory() {
        let result = canonicalize_workspace_root(&env::temp_dir());
        assert!(result.unwrap().is_absolute());
    }

    #[test]
    fn test_canonicalize_nonexistent_path() {
        let result = canonicalize_workspace_root(Path::new("/nonexistent/path/12345"));
        assert!(matches!(result, Err(ApiError::PathNotFound { .. })));
    }

    #[test]
    fn test_normalize_strips_root_and_leading_slash() {
        let root = Path::new("/home/me/vault");
        assert_eq!(
            normalize_request_path("/home/me/vault/notes/a.md", root),
            "notes/a.md"
        );
        assert_eq!(normalize_request_path("/notes/a.md", root), "notes/a.md");
        assert_eq!(normalize_request_path("notes/./a.md", root), "notes/a.md");
        assert_eq!(normalize_request_path("//a.md", root), "a.md");
    }

    #[test]
    fn test_resolve_path_in_workspace_relative() {
        let root = env::temp_dir().join(format!("ws_root_{}", Uuid::new_v4()));
        std::fs::create_dir_all(&root).expect("failed to create root dir");

        let file_path = root.join("test.txt");
        std::fs::write(&file_path, "hello").expect("failed to write file");

        let resolved = resolve_path_in_workspace(&root, "test.txt").unwrap();
        assert_eq!(resolved, file_path.canonicalize().unwrap());

        std::fs::remove_dir_all(&root).expect("failed to remove root dir");
    }

    #[test]
    fn test_resolve_path_in_workspace_rejects_escape() {
        let root = env::temp_dir().join(format!("ws_root_{}", Uuid::new_v4()));
        std::fs::create_dir_all(&root).expect("failed to create root dir");

        let outside_dir = env::temp_dir().join(format!("outside_{}", Uuid::new_v4()));
        std::fs::create_dir_all(&outside_dir).expect("failed to create outside dir");
        std::fs::write(outside_dir.join("secret.txt"), "secret").expect("failed to write file");

        let escape_path = format!(
            "../{}/secret.txt",
            outside_dir.file_name().unwrap().to_string_lossy()
        );
        let result = resolve_path_in_workspace(&root, &escape_path);
        assert!(matches!(result, Err(ApiError::InvalidInput { .. })));

        let result = resolve_write_target_in_workspace(&root, &escape_path);
        assert!(matches!(result, Err(ApiError::InvalidInput { .. })));

        std::fs::remove_dir_all(&outside_dir).expect("failed to remove outside dir");
        std::fs::remove_dir_all(&root).expect("failed to remove root dir");
    }

    #[test]
    fn test_resolve_write_target_allows_new_file() {
        let root = env::temp_dir().join(format!("ws_root_{}", Uuid::new_v4()));
        std::fs::create_dir_all(root.join("notes")).expect("failed to create root dir");

        let resolved = resolve_write_target_in_workspace(&root, "notes/new.md").unwrap();
        assert_eq!(
            resolved,
            root.join("notes").canonicalize().unwrap().join("new.md")
        );

        std::fs::remove_dir_all(&root).expect("failed to remove root dir");
    }
}
