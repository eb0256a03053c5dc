use std::fs;
use std::io::Write;

use camino::Utf8Path;
use tempfile::Builder;
use tracing::debug;

use crate::error::HarvestError;

/// Writes `content` to `path`, creating missing parent folders. An existing
/// file is overwritten.
pub fn write_file(path: &Utf8Path, content: &[u8]) -> Result<(), HarvestError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| HarvestError::Filesystem(format!("create {parent}: {err}")))?;
    }
    fs::write(path.as_std_path(), content)
        .map_err(|err| HarvestError::Filesystem(format!("write {path}: {err}")))
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), HarvestError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix("treeharvest-")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    Ok(())
}

pub fn discard(path: &Utf8Path) {
    if let Err(err) = fs::remove_file(path.as_std_path()) {
        debug!(%path, %err, "could not remove file");
    }
}
