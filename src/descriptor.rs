//! Descriptor I/O: the file-descriptor position cache, open/close/read/write,
//! and the write retry/flush policy (§4.3 — the hard part of this crate).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task;
use tracing::{debug, warn};

use crate::error::{map_io_error, FileSystemProviderErrorCode, Result};
use crate::uri::Resource;

const WRITE_RETRY_ATTEMPTS: u32 = 3;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Options accepted by [`DescriptorTable::open`].
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    pub write: bool,
    pub create: bool,
    /// Best-effort owner-write-bit preflight before opening for write (§4.3).
    pub unlock: bool,
}

struct OpenFile {
    file: Arc<std::fs::File>,
    path: PathBuf,
}

/// The descriptor→{position, writable-resource} cache plus the open file
/// table it's paired with.
///
/// All mutation is behind a single mutex, matching the spec's design note
/// (§9): "on a threaded implementation, a single mutex around both is
/// sufficient because all updates are paired."
pub struct DescriptorTable {
    next_fd: AtomicU64,
    inner: Mutex<Inner>,
    can_flush: AtomicBool,
}

#[derive(Default)]
struct Inner {
    files: HashMap<u64, OpenFile>,
    pos: HashMap<u64, u64>,
    writable: HashMap<u64, Resource>,
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorTable {
    pub fn new() -> Self {
        Self { next_fd: AtomicU64::new(1), inner: Mutex::new(Inner::default()), can_flush: AtomicBool::new(true) }
    }

    /// Whether `fdatasync` is still attempted on close. Sticky `false` once a
    /// sync has failed once (§3 "canflush flag").
    pub fn can_flush(&self) -> bool {
        self.can_flush.load(Ordering::Relaxed)
    }

    /// `open(resource, opts) → fd` (§4.3).
    pub async fn open(&self, resource: &Resource, opts: OpenOptions) -> Result<u64> {
        let path = resource.to_file_path().to_path_buf();

        if opts.write && opts.unlock {
            best_effort_unlock(&path).await;
        }

        let file = if opts.write {
            open_for_write(&path, opts.create).await?
        } else {
            let path = path.clone();
            task::spawn_blocking(move || std::fs::OpenOptions::new().read(true).open(&path))
                .await
                .expect("blocking open task panicked")
                .map_err(|e| map_io_error(e, Some(&path)))?
        };

        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().await;
        inner.pos.insert(fd, 0);
        if opts.write {
            inner.writable.insert(fd, resource.clone());
        }
        inner.files.insert(fd, OpenFile { file: Arc::new(file), path });
        debug!(fd, writable = opts.write, "descriptor opened");
        Ok(fd)
    }

    /// `close(fd)` (§4.3): drops the position entry unconditionally, flushes
    /// via `fdatasync` if the descriptor was writable and flushing hasn't
    /// been disabled, then closes the native handle.
    pub async fn close(&self, fd: u64) -> Result<()> {
        let (open_file, was_writable) = {
            let mut inner = self.inner.lock().await;
            inner.pos.remove(&fd);
            let was_writable = inner.writable.remove(&fd).is_some();
            let open_file = inner.files.remove(&fd);
            (open_file, was_writable)
        };
        let Some(open_file) = open_file else {
            return Err(crate::error::FileSystemProviderError::new(
                FileSystemProviderErrorCode::Unknown,
                format!("close: unknown descriptor {fd}"),
            ));
        };

        if was_writable && self.can_flush() {
            if let Err(err) = fdatasync(&open_file.file).await {
                warn!(fd, path = %open_file.path.display(), error = %err, "fdatasync failed, disabling future syncs");
                self.can_flush.store(false, Ordering::Relaxed);
            }
        }

        close_native(open_file).await
    }

    /// `read(fd, pos, dst, offset, length) → bytesRead` (§4.3).
    pub async fn read(&self, fd: u64, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let (file, path, normalized) = self.begin_op(fd, pos).await?;
        let buf_len = buf.len();
        let result = read_blocking(file, normalized, buf_len).await;
        self.finalize_pos(fd, normalized, result.as_ref().ok().map(|(n, _)| *n)).await;
        let (n, data) = result.map_err(|e| map_io_error(e, Some(&path)))?;
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    /// `write(fd, pos, src, offset, length) → bytesWritten` (§4.3), with the
    /// 3-attempt/100ms write retry policy.
    pub async fn write(&self, fd: u64, pos: u64, data: &[u8]) -> Result<usize> {
        let mut last_err = None;
        for attempt in 1..=WRITE_RETRY_ATTEMPTS {
            let (file, path, normalized) = self.begin_op(fd, pos).await?;
            let result = write_blocking(file, normalized, data.to_vec()).await;
            self.finalize_pos(fd, normalized, result.as_ref().ok().copied()).await;
            match result {
                Ok(n) => return Ok(n),
                Err(err) => {
                    warn!(fd, attempt, path = %path.display(), error = %err, "write attempt failed, retrying");
                    last_err = Some(map_io_error(err, Some(&path)));
                    if attempt < WRITE_RETRY_ATTEMPTS {
                        tokio::time::sleep(WRITE_RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(last_err.expect("loop always sets last_err before exhausting attempts"))
    }

    /// Fetch the file handle, path, and normalized position for an op,
    /// without holding the table lock during the blocking syscall.
    async fn begin_op(&self, fd: u64, pos: u64) -> Result<(Arc<std::fs::File>, PathBuf, Option<u64>)> {
        let inner = self.inner.lock().await;
        let open_file = inner.files.get(&fd).ok_or_else(|| {
            crate::error::FileSystemProviderError::new(
                FileSystemProviderErrorCode::Unknown,
                format!("unknown descriptor {fd}"),
            )
        })?;
        let current = inner.pos.get(&fd).copied();
        let normalized = normalize_pos(current, pos);
        Ok((Arc::clone(&open_file.file), open_file.path.clone(), normalized))
    }

    /// Apply the position-update rules of §4.3 step 3, in a finalize block
    /// that runs regardless of whether the op succeeded.
    async fn finalize_pos(&self, fd: u64, normalized: Option<u64>, bytes_len: Option<usize>) {
        let mut inner = self.inner.lock().await;
        match (normalized, bytes_len) {
            (Some(_), _) => {
                // Explicit seek: pread/pwrite semantics don't advance the
                // cached position, success or failure.
            }
            (None, Some(n)) => {
                if let Some(p) = inner.pos.get_mut(&fd) {
                    *p += n as u64;
                }
            }
            (None, None) => {
                inner.pos.remove(&fd);
            }
        }
    }
}

/// `normalizePos(fd, requestedPos) → Option<u64>` (§4.3).
fn normalize_pos(current: Option<u64>, requested: u64) -> Option<u64> {
    if current == Some(requested) {
        None
    } else {
        Some(requested)
    }
}

async fn open_for_write(path: &Path, create: bool) -> Result<std::fs::File> {
    #[cfg(windows)]
    {
        if create {
            if let Some(file) = try_windows_truncate_then_reopen(path).await? {
                return Ok(file);
            }
        }
    }
    let path = path.to_path_buf();
    task::spawn_blocking(move || std::fs::OpenOptions::new().write(true).create(create).truncate(true).open(&path))
        .await
        .expect("blocking open task panicked")
        .map_err(|e| map_io_error(e, Some(&path)))
}

/// Windows write-open quirk (§4.3): truncating an existing file first and
/// reopening without the truncate flag preserves hidden-file attributes and
/// alternate data streams, unlike opening directly with the truncate flag.
#[cfg(windows)]
async fn try_windows_truncate_then_reopen(path: &Path) -> Result<Option<std::fs::File>> {
    let truncate_path = path.to_path_buf();
    let truncate_result =
        task::spawn_blocking(move || std::fs::OpenOptions::new().write(true).open(&truncate_path).and_then(|f| f.set_len(0)))
            .await
            .expect("blocking truncate task panicked");

    match truncate_result {
        Ok(()) => {
            let reopen_path = path.to_path_buf();
            let file = task::spawn_blocking(move || std::fs::OpenOptions::new().read(true).write(true).open(&reopen_path))
                .await
                .expect("blocking reopen task panicked")
                .map_err(|e| map_io_error(e, Some(path)))?;
            Ok(Some(file))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "windows pre-truncate failed, falling back to plain write-open");
            Ok(None)
        }
    }
}

async fn best_effort_unlock(path: &Path) {
    let path = path.to_path_buf();
    let outcome = task::spawn_blocking(move || {
        let meta = std::fs::metadata(&path)?;
        if !is_owner_write_bit_clear(&meta) {
            return Ok(());
        }
        set_owner_write_bit(&path, &meta)
    })
    .await;

    if let Ok(Err(err)) = outcome {
        warn!(error = %err, "best-effort write-unlock failed, continuing anyway");
    }
}

#[cfg(unix)]
fn is_owner_write_bit_clear(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o200 == 0
}

#[cfg(not(unix))]
fn is_owner_write_bit_clear(meta: &std::fs::Metadata) -> bool {
    meta.permissions().readonly()
}

#[cfg(unix)]
fn set_owner_write_bit(path: &Path, meta: &std::fs::Metadata) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = meta.permissions();
    perms.set_mode(perms.mode() | 0o200);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_owner_write_bit(path: &Path, meta: &std::fs::Metadata) -> std::io::Result<()> {
    let mut perms = meta.permissions();
    perms.set_readonly(false);
    std::fs::set_permissions(path, perms)
}

async fn read_blocking(file: Arc<std::fs::File>, normalized: Option<u64>, len: usize) -> std::io::Result<(usize, Vec<u8>)> {
    task::spawn_blocking(move || {
        let mut buf = vec![0u8; len];
        let n = match normalized {
            #[cfg(unix)]
            Some(offset) => {
                use std::os::unix::fs::FileExt;
                file.read_at(&mut buf, offset)?
            }
            #[cfg(windows)]
            Some(offset) => {
                use std::os::windows::fs::FileExt;
                file.seek_read(&mut buf, offset)?
            }
            None => {
                use std::io::Read;
                (&*file).read(&mut buf)?
            }
        };
        Ok((n, buf))
    })
    .await
    .expect("blocking read task panicked")
}

async fn write_blocking(file: Arc<std::fs::File>, normalized: Option<u64>, data: Vec<u8>) -> std::io::Result<usize> {
    task::spawn_blocking(move || match normalized {
        #[cfg(unix)]
        Some(offset) => {
            use std::os::unix::fs::FileExt;
            file.write_at(&data, offset)
        }
        #[cfg(windows)]
        Some(offset) => {
            use std::os::windows::fs::FileExt;
            file.seek_write(&data, offset)
        }
        None => {
            use std::io::Write;
            (&*file).write(&data)
        }
    })
    .await
    .expect("blocking write task panicked")
}

async fn fdatasync(file: &Arc<std::fs::File>) -> std::io::Result<()> {
    let file = Arc::clone(file);
    task::spawn_blocking(move || fdatasync_blocking(&file)).await.expect("blocking fdatasync task panicked")
}

#[cfg(unix)]
fn fdatasync_blocking(file: &std::fs::File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let ret = unsafe { libc::fdatasync(file.as_raw_fd()) };
    if ret != 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(unix))]
fn fdatasync_blocking(file: &std::fs::File) -> std::io::Result<()> {
    file.sync_data()
}

/// Close the native handle. Only propagates a close-time error when this
/// call holds the sole reference to the handle; a concurrent in-flight
/// read/write on the same descriptor (caller error, §5) simply drops our
/// reference and lets the last owner close it.
async fn close_native(open_file: OpenFile) -> Result<()> {
    let path = open_file.path.clone();
    match Arc::try_unwrap(open_file.file) {
        Ok(file) => task::spawn_blocking(move || close_blocking(file))
            .await
            .expect("blocking close task panicked")
            .map_err(|e| map_io_error(e, Some(&path))),
        Err(_still_referenced) => Ok(()),
    }
}

#[cfg(unix)]
fn close_blocking(file: std::fs::File) -> std::io::Result<()> {
    use std::os::unix::io::IntoRawFd;
    let fd = file.into_raw_fd();
    let ret = unsafe { libc::close(fd) };
    if ret != 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(unix))]
fn close_blocking(file: std::fs::File) -> std::io::Result<()> {
    drop(file);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_pos_matches_cache() {
        assert_eq!(normalize_pos(Some(5), 5), None);
        assert_eq!(normalize_pos(Some(5), 3), Some(3));
        assert_eq!(normalize_pos(None, 0), Some(0));
    }

    #[tokio::test]
    async fn position_advances_on_sequential_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let table = DescriptorTable::new();
        let resource = Resource::from_path(&path);
        let fd = table.open(&resource, OpenOptions { write: false, create: false, unlock: false }).await.unwrap();

        let mut buf = [0u8; 3];
        let n = table.read(fd, 0, &mut buf).await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf, b"hel");

        let mut buf2 = [0u8; 2];
        let n2 = table.read(fd, 3, &mut buf2).await.unwrap();
        assert_eq!(n2, 2);
        assert_eq!(&buf2, b"lo");

        // Explicit seek to an already-consumed offset: position unaffected.
        let mut buf3 = [0u8; 1];
        table.read(fd, 0, &mut buf3).await.unwrap();
        let pos = table.inner.lock().await.pos.get(&fd).copied();
        assert_eq!(pos, Some(5));

        table.close(fd).await.unwrap();
    }

    #[tokio::test]
    async fn error_removes_cached_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.txt");
        tokio::fs::write(&path, b"hi").await.unwrap();

        let table = DescriptorTable::new();
        let resource = Resource::from_path(&path);
        let fd = table.open(&resource, OpenOptions { write: false, create: false, unlock: false }).await.unwrap();

        table.close(fd).await.unwrap();
        // fd is now unknown; a subsequent read must fail rather than panic.
        let mut buf = [0u8; 1];
        assert!(table.read(fd, 0, &mut buf).await.is_err());
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("e.txt");
        let table = DescriptorTable::new();
        let resource = Resource::from_path(&path);

        let fd = table.open(&resource, OpenOptions { write: true, create: true, unlock: false }).await.unwrap();
        let n = table.write(fd, 0, b"abc").await.unwrap();
        assert_eq!(n, 3);
        table.close(fd).await.unwrap();

        let contents = tokio::fs::read(&path).await.unwrap();
        assert_eq!(contents, b"abc");
    }

    #[tokio::test]
    async fn close_drops_both_maps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        let table = DescriptorTable::new();
        let resource = Resource::from_path(&path);
        let fd = table.open(&resource, OpenOptions { write: true, create: true, unlock: false }).await.unwrap();
        table.close(fd).await.unwrap();

        let inner = table.inner.lock().await;
        assert!(!inner.pos.contains_key(&fd));
        assert!(!inner.writable.contains_key(&fd));
        assert!(!inner.files.contains_key(&fd));
    }
}
