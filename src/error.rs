//! Portable filesystem error taxonomy and native-to-portable translation.

use std::io;
use std::path::{Path, PathBuf};

/// Portable error taxonomy exposed to callers of the provider.
///
/// Every native OS error collapses into one of these variants; anything not
/// otherwise recognized becomes [`FileSystemProviderErrorCode::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FileSystemProviderErrorCode {
    #[error("file not found")]
    FileNotFound,
    #[error("file is a directory")]
    FileIsADirectory,
    #[error("file is not a directory")]
    FileNotADirectory,
    #[error("file already exists")]
    FileExists,
    #[error("no permissions")]
    NoPermissions,
    #[error("file is locked for writing")]
    FileWriteLocked,
    #[error("unknown error")]
    Unknown,
}

/// A filesystem provider error: a portable code plus enough context to log or
/// display meaningfully, without losing the originating OS error text.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct FileSystemProviderError {
    pub code: FileSystemProviderErrorCode,
    pub message: String,
    pub path: Option<PathBuf>,
    #[source]
    pub source: Option<io::Error>,
}

impl FileSystemProviderError {
    pub fn new(code: FileSystemProviderErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), path: None, source: None }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn code(&self) -> FileSystemProviderErrorCode {
        self.code
    }
}

/// Result alias used throughout the provider.
pub type Result<T> = std::result::Result<T, FileSystemProviderError>;

/// Map a native `io::Error` to the portable taxonomy (§4.6 of the spec).
///
/// Already-portable errors pass through unchanged — the mapping is idempotent
/// as required by the "toError(toError(e)) == toError(e)" testable property.
pub fn map_io_error(err: io::Error, path: Option<&Path>) -> FileSystemProviderError {
    let code = native_code_to_portable(&err);
    let message = err.to_string();
    let mut wrapped = FileSystemProviderError::new(code, message);
    wrapped.source = Some(err);
    if let Some(path) = path {
        wrapped = wrapped.with_path(path);
    }
    wrapped
}

/// Pass an already-portable error straight through: translating it again
/// must be a no-op, since `map_io_error` never discards code/message/path.
pub fn reraise(err: FileSystemProviderError) -> FileSystemProviderError {
    err
}

fn native_code_to_portable(err: &io::Error) -> FileSystemProviderErrorCode {
    use io::ErrorKind::*;
    match err.kind() {
        NotFound => FileSystemProviderErrorCode::FileNotFound,
        AlreadyExists => FileSystemProviderErrorCode::FileExists,
        PermissionDenied => FileSystemProviderErrorCode::NoPermissions,
        _ => match raw_os_error_code(err) {
            Some(RawCode::IsDir) => FileSystemProviderErrorCode::FileIsADirectory,
            Some(RawCode::NotDir) => FileSystemProviderErrorCode::FileNotADirectory,
            _ => FileSystemProviderErrorCode::Unknown,
        },
    }
}

enum RawCode {
    IsDir,
    NotDir,
}

#[cfg(unix)]
fn raw_os_error_code(err: &io::Error) -> Option<RawCode> {
    match err.raw_os_error() {
        Some(code) if code == libc::EISDIR => Some(RawCode::IsDir),
        Some(code) if code == libc::ENOTDIR => Some(RawCode::NotDir),
        _ => None,
    }
}

#[cfg(not(unix))]
fn raw_os_error_code(_err: &io::Error) -> Option<RawCode> {
    None
}

/// Best-effort upgrade of a `NoPermissions` error to `FileWriteLocked` by
/// re-`stat`ing the target and checking the owner-write bit (§4.6). A failing
/// probe leaves the original error untouched.
pub async fn upgrade_write_lock(mut err: FileSystemProviderError, path: &Path) -> FileSystemProviderError {
    if err.code != FileSystemProviderErrorCode::NoPermissions {
        return err;
    }
    match is_owner_write_locked(path).await {
        Ok(true) => {
            err.code = FileSystemProviderErrorCode::FileWriteLocked;
            err
        }
        _ => err,
    }
}

#[cfg(unix)]
async fn is_owner_write_locked(path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::PermissionsExt;
    let meta = tokio::fs::metadata(path).await?;
    Ok(meta.permissions().mode() & 0o200 == 0)
}

#[cfg(not(unix))]
async fn is_owner_write_locked(path: &Path) -> io::Result<bool> {
    let meta = tokio::fs::metadata(path).await?;
    Ok(meta.permissions().readonly())
}

/// Rewrite `EINVAL | EBUSY | ENAMETOOLONG` failures from rename/copy into a
/// message naming the source basename and target-parent basename (§4.4 step 6).
pub fn rewrite_rename_copy_error(
    err: FileSystemProviderError,
    from: &Path,
    to: &Path,
) -> FileSystemProviderError {
    let is_opaque = matches!(
        err.source.as_ref().and_then(io::Error::raw_os_error),
        Some(code) if is_einval_ebusy_enametoolong(code)
    );
    if !is_opaque {
        return err;
    }
    let source_name = from.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let target_parent_name = to
        .parent()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let message = format!(
        "Unable to move/copy '{source_name}' into '{target_parent_name}' ({}): {}",
        err.code, err.message
    );
    FileSystemProviderError { message, ..err }
}

#[cfg(unix)]
fn is_einval_ebusy_enametoolong(code: i32) -> bool {
    code == libc::EINVAL || code == libc::EBUSY || code == libc::ENAMETOOLONG
}

#[cfg(not(unix))]
fn is_einval_ebusy_enametoolong(_code: i32) -> bool {
    false
}
