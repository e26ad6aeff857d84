//! Mutations: mkdir/delete/rename/copy (§4.4).

use std::path::Path;

use tracing::debug;

use crate::error::{map_io_error, rewrite_rename_copy_error, FileSystemProviderErrorCode, Result};
use crate::uri::Resource;

/// `mkdir(resource)` (§4.4). Errors propagate unmodified.
pub async fn mkdir(resource: &Resource) -> Result<()> {
    let path = resource.to_file_path();
    debug!(path = %path.display(), "mkdir");
    tokio::fs::create_dir(path).await.map_err(|e| map_io_error(e, Some(path)))
}

/// Options accepted by [`delete`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    pub recursive: bool,
    /// Accepted but delegated upstream; the disk provider always deletes
    /// permanently (§4.4).
    pub use_trash: bool,
}

/// `delete(resource, opts)` (§4.4).
pub async fn delete(resource: &Resource, opts: DeleteOptions) -> Result<()> {
    let path = resource.to_file_path();
    debug!(path = %path.display(), recursive = opts.recursive, "delete");
    if opts.recursive {
        recursive_remove(path).await
    } else {
        tokio::fs::remove_file(path).await.map_err(|e| map_io_error(e, Some(path)))
    }
}

/// Robust recursive remove (§4.4): rename the target into a temporary sibling
/// first, then recursively unlink the sibling. Tolerates Windows
/// file-in-use errors on the original path, since the rename itself is the
/// only step that touches the original name.
async fn recursive_remove(path: &Path) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        crate::error::FileSystemProviderError::new(FileSystemProviderErrorCode::Unknown, "path has no parent to stage deletion in")
            .with_path(path)
    })?;
    let staging = parent.join(format!(".{}.deleting", unique_suffix(path)));

    tokio::fs::rename(path, &staging).await.map_err(|e| map_io_error(e, Some(path)))?;

    let remove_result = tokio::fs::remove_dir_all(&staging).await;
    remove_result.map_err(|e| map_io_error(e, Some(&staging)))
}

fn unique_suffix(path: &Path) -> String {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let pid = std::process::id();
    format!("{name}-{pid}")
}

/// Options shared by [`rename`] and [`copy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferOptions {
    pub overwrite: bool,
}

/// `rename(from, to, opts)` (§4.4).
pub async fn rename(from: &Resource, to: &Resource, opts: TransferOptions, case_sensitive: bool) -> Result<()> {
    let from_path = from.to_file_path();
    let to_path = to.to_file_path();

    if from_path == to_path {
        return Ok(());
    }

    // A case-only difference is exactly how callers perform a case change
    // on a case-insensitive filesystem, so rename permits it.
    validate_target_deleted(from_path, to_path, opts, false, case_sensitive).await?;

    debug!(from = %from_path.display(), to = %to_path.display(), "rename");
    tokio::fs::rename(from_path, to_path)
        .await
        .map_err(|e| rewrite_rename_copy_error(map_io_error(e, Some(from_path)), from_path, to_path))
}

/// `copy(from, to, opts)` (§4.4), with `preserveSymlinks: true`.
pub async fn copy(from: &Resource, to: &Resource, opts: TransferOptions, case_sensitive: bool) -> Result<()> {
    let from_path = from.to_file_path();
    let to_path = to.to_file_path();

    if from_path == to_path {
        return Ok(());
    }

    validate_target_deleted(from_path, to_path, opts, true, case_sensitive).await?;

    debug!(from = %from_path.display(), to = %to_path.display(), "copy");
    copy_preserving_symlinks(from_path, to_path).await.map_err(|e| rewrite_rename_copy_error(e, from_path, to_path))
}

/// Shared rename/copy preamble (§4.4 steps 2-4).
async fn validate_target_deleted(from: &Path, to: &Path, opts: TransferOptions, is_copy: bool, case_sensitive: bool) -> Result<()> {
    let same_resource_different_case = !case_sensitive && is_same_path_different_case(from, to);

    if is_copy && same_resource_different_case {
        return Err(crate::error::FileSystemProviderError::new(FileSystemProviderErrorCode::FileExists, "cannot copy onto a case-only variant of the source").with_path(to));
    }

    let exists = tokio::fs::try_exists(to).await.unwrap_or(false);
    if !exists {
        return Ok(());
    }
    if !opts.overwrite {
        return Err(crate::error::FileSystemProviderError::new(FileSystemProviderErrorCode::FileExists, "target already exists").with_path(to));
    }
    if same_resource_different_case {
        // rename's case-change path: `to` "exists" only because it
        // case-insensitively matches `from` on disk, not because it's a
        // distinct file to clear out of the way.
        return Ok(());
    }
    recursive_remove(to).await
}

/// Paths equal case-insensitively but not case-sensitively (§3
/// `isSameResourceWithDifferentPathCase`).
fn is_same_path_different_case(from: &Path, to: &Path) -> bool {
    if from == to {
        return false;
    }
    let from_lossy = from.to_string_lossy();
    let to_lossy = to.to_string_lossy();
    from_lossy.to_lowercase() == to_lossy.to_lowercase()
}

async fn copy_preserving_symlinks(from: &Path, to: &Path) -> Result<()> {
    let meta = tokio::fs::symlink_metadata(from).await.map_err(|e| map_io_error(e, Some(from)))?;

    if meta.is_dir() {
        copy_dir_preserving_symlinks(from, to).await
    } else if meta.file_type().is_symlink() {
        copy_symlink(from, to).await
    } else {
        tokio::fs::copy(from, to).await.map(|_| ()).map_err(|e| map_io_error(e, Some(from)))
    }
}

#[cfg(unix)]
async fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    let target = tokio::fs::read_link(from).await.map_err(|e| map_io_error(e, Some(from)))?;
    tokio::fs::symlink(target, to).await.map_err(|e| map_io_error(e, Some(to)))
}

#[cfg(not(unix))]
async fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    let target = tokio::fs::read_link(from).await.map_err(|e| map_io_error(e, Some(from)))?;
    let target_meta = tokio::fs::metadata(&target).await;
    if target_meta.map(|m| m.is_dir()).unwrap_or(false) {
        tokio::fs::symlink_dir(target, to).await.map_err(|e| map_io_error(e, Some(to)))
    } else {
        tokio::fs::symlink_file(target, to).await.map_err(|e| map_io_error(e, Some(to)))
    }
}

async fn copy_dir_preserving_symlinks(from: &Path, to: &Path) -> Result<()> {
    tokio::fs::create_dir_all(to).await.map_err(|e| map_io_error(e, Some(to)))?;
    let mut entries = tokio::fs::read_dir(from).await.map_err(|e| map_io_error(e, Some(from)))?;

    while let Some(entry) = entries.next_entry().await.map_err(|e| map_io_error(e, Some(from)))? {
        let child_from = entry.path();
        let child_to = to.join(entry.file_name());
        // Recursion into an async fn requires boxing; depth here is bounded
        // by real directory trees, not adversarial input.
        Box::pin(copy_preserving_symlinks(&child_from, &child_to)).await?;
    }
    Ok(())
}
