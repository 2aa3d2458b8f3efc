//! Local filesystem helpers.

use std::ffi::OsStr;
use std::path::Path;

/// Empty `path` without removing it, sparing any entry named in `keep`.
///
/// Symlinks are unlinked, never followed.
pub async fn clear_dir(path: &Path, keep: &[&OsStr]) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        if keep.contains(&entry.file_name().as_os_str()) {
            continue;
        }
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(path).await?;
        } else {
            tokio::fs::remove_file(path).await?;
        }
    }
    Ok(())
}
