//! Metadata subsystem: `stat` and `readdir` (§4.1).

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use tracing::warn;

use crate::error::{map_io_error, FileSystemProviderError, Result};
use crate::uri::Resource;

bitflags! {
    /// Bit-flag classification of a filesystem entry.
    ///
    /// A dangling symlink is `SYMBOLIC_LINK | UNKNOWN`, never `FILE` or
    /// `DIRECTORY`; anything that is neither a regular file nor a directory
    /// resolves to `UNKNOWN`, possibly OR'd with `SYMBOLIC_LINK`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileType: u8 {
        const FILE = 0b0001;
        const DIRECTORY = 0b0010;
        const SYMBOLIC_LINK = 0b0100;
        const UNKNOWN = 0b1000;
    }
}

/// Portable stat record (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatRecord {
    pub file_type: FileType,
    /// Birth time in milliseconds since the epoch — deliberately the
    /// creation time, not the POSIX change-time (§3).
    pub ctime: u64,
    pub mtime: u64,
    pub size: u64,
}

/// Resolve symlinks and classify `resource` (§4.1 `stat`).
pub async fn stat(resource: &Resource) -> Result<StatRecord> {
    let path = resource.to_file_path();
    stat_path(path).await
}

/// `stat` over a bare path, used both by [`stat`] and by `readdir`'s
/// recursive per-symlink-entry lookup.
pub async fn stat_path(path: &Path) -> Result<StatRecord> {
    let link_meta = tokio::fs::symlink_metadata(path).await.map_err(|e| map_io_error(e, Some(path)))?;
    let is_symlink = link_meta.file_type().is_symlink();

    if !is_symlink {
        return Ok(stat_record_from_metadata(&link_meta, FileType::empty()));
    }

    match tokio::fs::metadata(path).await {
        Ok(target_meta) => Ok(stat_record_from_metadata(&target_meta, FileType::SYMBOLIC_LINK)),
        Err(_dangling) => Ok(StatRecord {
            file_type: FileType::SYMBOLIC_LINK | FileType::UNKNOWN,
            ctime: birth_time_ms(&link_meta),
            mtime: modified_time_ms(&link_meta),
            size: 0,
        }),
    }
}

fn stat_record_from_metadata(meta: &std::fs::Metadata, extra: FileType) -> StatRecord {
    let base = if meta.is_dir() {
        FileType::DIRECTORY
    } else if meta.is_file() {
        FileType::FILE
    } else {
        FileType::UNKNOWN
    };
    StatRecord {
        file_type: base | extra,
        ctime: birth_time_ms(meta),
        mtime: modified_time_ms(meta),
        size: meta.len(),
    }
}

fn system_time_to_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

fn birth_time_ms(meta: &std::fs::Metadata) -> u64 {
    meta.created().map(system_time_to_ms).unwrap_or_else(|_| modified_time_ms(meta))
}

fn modified_time_ms(meta: &std::fs::Metadata) -> u64 {
    meta.modified().map(system_time_to_ms).unwrap_or(0)
}

/// Enumerate a directory's entries (§4.1 `readdir`).
///
/// Per-entry stat failures (e.g. a permission-denied symlink target) are
/// logged and dropped rather than failing the whole listing; only a failure
/// to open the directory itself propagates.
pub async fn readdir(resource: &Resource) -> Result<Vec<(String, FileType)>> {
    let dir_path = resource.to_file_path();
    let mut entries = tokio::fs::read_dir(dir_path).await.map_err(|e| map_io_error(e, Some(dir_path)))?;

    let mut out = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                warn!(path = %dir_path.display(), error = %err, "readdir: failed to advance iterator, stopping early");
                break;
            }
        };

        let name = entry.file_name().to_string_lossy().into_owned();
        let file_type = match entry.file_type().await {
            Ok(ft) if ft.is_symlink() => match stat_path(&entry.path()).await {
                Ok(record) => record.file_type,
                Err(err) => {
                    log_dropped_entry(&entry.path(), &err);
                    continue;
                }
            },
            Ok(ft) if ft.is_dir() => FileType::DIRECTORY,
            Ok(ft) if ft.is_file() => FileType::FILE,
            Ok(_) => FileType::UNKNOWN,
            Err(err) => {
                log_dropped_entry(&entry.path(), &map_io_error(err, Some(&entry.path())));
                continue;
            }
        };
        out.push((name, file_type));
    }
    Ok(out)
}

fn log_dropped_entry(path: &Path, err: &FileSystemProviderError) {
    warn!(path = %path.display(), error = %err, "readdir: dropping entry after per-entry failure");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stats_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.txt");
        tokio::fs::write(&file_path, b"hi").await.unwrap();

        let record = stat_path(&file_path).await.unwrap();
        assert_eq!(record.file_type, FileType::FILE);
        assert_eq!(record.size, 2);
    }

    #[tokio::test]
    async fn stats_directory() {
        let dir = tempfile::tempdir().unwrap();
        let record = stat_path(dir.path()).await.unwrap();
        assert_eq!(record.file_type, FileType::DIRECTORY);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dangling_symlink_is_unknown_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let link_path = dir.path().join("dangling");
        tokio::fs::symlink("/nonexistent/target/for/this/test", &link_path).await.unwrap();

        let record = stat_path(&link_path).await.unwrap();
        assert_eq!(record.file_type, FileType::SYMBOLIC_LINK | FileType::UNKNOWN);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_to_file_has_both_flags() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target.txt");
        tokio::fs::write(&target, b"data").await.unwrap();
        let link_path = dir.path().join("link.txt");
        tokio::fs::symlink(&target, &link_path).await.unwrap();

        let record = stat_path(&link_path).await.unwrap();
        assert_eq!(record.file_type, FileType::FILE | FileType::SYMBOLIC_LINK);
    }

    #[tokio::test]
    async fn readdir_lists_entries_with_types() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"x").await.unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();

        let resource = Resource::from_path(dir.path());
        let mut listed = readdir(&resource).await.unwrap();
        listed.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(listed, vec![("a.txt".to_string(), FileType::FILE), ("sub".to_string(), FileType::DIRECTORY)]);
    }
}
