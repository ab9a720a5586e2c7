use std::fs;
use std::path::{Component, Path, PathBuf};

use mime_guess::MimeGuess;

use workspace_agent_error::WorkspaceError;

/// A file read out of a workspace's project directory. Contents are read
/// fresh from the mount on every call; nothing is cached.
#[derive(Debug)]
pub struct ProjectFile {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub file_name: String,
}

/// Read `file_path` relative to `project_root`, refusing any path that
/// resolves outside the root.
pub fn read_project_file(
    project_root: &Path,
    file_path: &str,
) -> Result<ProjectFile, WorkspaceError> {
    let resolved = resolve_path(project_root, file_path)?;

    let metadata = fs::metadata(&resolved).map_err(|_| WorkspaceError::FileNotFound {
        path: file_path.to_string(),
    })?;
    if !metadata.is_file() {
        return Err(WorkspaceError::FileNotFound {
            path: file_path.to_string(),
        });
    }

    let bytes = fs::read(&resolved).map_err(|err| WorkspaceError::Internal {
        message: format!("failed to read file: {err}"),
    })?;
    let mime_type = MimeGuess::from_path(&resolved)
        .first_or_octet_stream()
        .essence_str()
        .to_string();
    let file_name = resolved
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();

    Ok(ProjectFile {
        bytes,
        mime_type,
        file_name,
    })
}

fn resolve_path(root: &Path, input: &str) -> Result<PathBuf, WorkspaceError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(WorkspaceError::InvalidRequest {
            message: "file_path is required".to_string(),
        });
    }

    let input_path = PathBuf::from(input);
    if input_path.is_absolute() {
        return Err(WorkspaceError::InvalidRequest {
            message: "file_path must be relative to the project root".to_string(),
        });
    }
    if input_path
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(WorkspaceError::InvalidRequest {
            message: "path traversal is not allowed".to_string(),
        });
    }

    let root = fs::canonicalize(root).map_err(|_| WorkspaceError::FileNotFound {
        path: input.to_string(),
    })?;
    let joined = root.join(&input_path);
    // Symlinks inside the project can still point out of it; the canonical
    // form must stay under the root.
    let normalized = fs::canonicalize(&joined).unwrap_or(joined);
    if !normalized.starts_with(&root) {
        return Err(WorkspaceError::InvalidRequest {
            message: "path is outside the workspace".to_string(),
        });
    }

    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project_with_file() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("project");
        fs::create_dir_all(project.join("docs")).unwrap();
        fs::write(project.join("docs/notes.txt"), b"remember the milk").unwrap();
        fs::write(dir.path().join("secret.txt"), b"outside").unwrap();
        (dir, project)
    }

    #[test]
    fn reads_nested_files() {
        let (_dir, project) = project_with_file();
        let file = read_project_file(&project, "docs/notes.txt").unwrap();
        assert_eq!(file.bytes, b"remember the milk");
        assert_eq!(file.file_name, "notes.txt");
        assert_eq!(file.mime_type, "text/plain");
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        let (_dir, project) = project_with_file();
        for path in [
            "../secret.txt",
            "docs/../../secret.txt",
            "docs/../../../etc/passwd",
            "..",
        ] {
            let err = read_project_file(&project, path).unwrap_err();
            assert!(
                matches!(err, WorkspaceError::InvalidRequest { .. }),
                "{path} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_absolute_paths() {
        let (_dir, project) = project_with_file();
        let err = read_project_file(&project, "/etc/passwd").unwrap_err();
        assert!(matches!(err, WorkspaceError::InvalidRequest { .. }));
    }

    #[test]
    fn missing_file_is_not_found() {
        let (_dir, project) = project_with_file();
        let err = read_project_file(&project, "docs/missing.txt").unwrap_err();
        assert!(matches!(err, WorkspaceError::FileNotFound { .. }));
    }

    #[test]
    fn symlink_escape_is_rejected() {
        let (dir, project) = project_with_file();
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(dir.path().join("secret.txt"), project.join("link.txt"))
                .unwrap();
            let err = read_project_file(&project, "link.txt").unwrap_err();
            assert!(matches!(err, WorkspaceError::InvalidRequest { .. }));
        }
    }
}
