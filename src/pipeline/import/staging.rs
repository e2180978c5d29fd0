use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::ImportError;

/// Write upload bytes to `<upload_dir>/<project_id>/<document_id>.<ext>`.
pub fn stage_bytes(
    upload_dir: &Path,
    project_id: &str,
    document_id: &Uuid,
    extension: &str,
    bytes: &[u8],
) -> Result<PathBuf, ImportError> {
    let project_dir = project_dir_name(project_id)?;
    let target_dir = upload_dir.join(project_dir);
    std::fs::create_dir_all(&target_dir)?;

    let target_path = target_dir.join(format!("{document_id}.{extension}"));
    // Write to a temporary sibling first so readers never see a partial file.
    let tmp_path = target_dir.join(format!(".{document_id}.{extension}.part"));
    std::fs::write(&tmp_path, bytes)?;
    std::fs::rename(&tmp_path, &target_path)?;

    tracing::debug!(
        document_id = %document_id,
        size = bytes.len(),
        "File staged"
    );

    Ok(target_path)
}

/// Remove a staged file (if the import is abandoned). Missing files are fine.
pub fn remove_staged(path: &Path) -> Result<(), ImportError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Read back a staged file
pub fn read_staged(path: &Path) -> Result<Vec<u8>, ImportError> {
    Ok(std::fs::read(path)?)
}

/// Project ids become directory names; anything path-like is refused.
fn project_dir_name(project_id: &str) -> Result<&str, ImportError> {
    let valid = !project_id.is_empty()
        && project_id.len() <= 128
        && project_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
    if valid {
        Ok(project_id)
    } else {
        Err(ImportError::InvalidProject(project_id.to_string()))
    }
}
