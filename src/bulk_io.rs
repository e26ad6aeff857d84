//! Bulk I/O: whole-file read/write and buffered streaming reads (§4.2).

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::descriptor::{DescriptorTable, OpenOptions};
use crate::error::{map_io_error, upgrade_write_lock, FileSystemProviderErrorCode, Result};
use crate::uri::Resource;

/// Options accepted by [`write_file`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteFileOptions {
    pub create: bool,
    pub overwrite: bool,
    pub unlock: bool,
}

/// `readFile(resource) → bytes` (§4.2).
pub async fn read_file(resource: &Resource) -> Result<Vec<u8>> {
    let path = resource.to_file_path();
    debug!(path = %path.display(), "read_file");
    tokio::fs::read(path).await.map_err(|e| map_io_error(e, Some(path)))
}

/// `writeFile(resource, content, opts) → ()` (§4.2).
///
/// Probes existence up front unless `create && overwrite` (in which case any
/// prior state is irrelevant), then opens/writes/closes through the
/// descriptor subsystem so the close-time flush and retry policy apply.
pub async fn write_file(descriptors: &DescriptorTable, resource: &Resource, content: &[u8], opts: WriteFileOptions) -> Result<()> {
    let path = resource.to_file_path();
    debug!(path = %path.display(), len = content.len(), "write_file");

    if !(opts.create && opts.overwrite) {
        let exists = tokio::fs::try_exists(path).await.unwrap_or(false);
        if !exists && !opts.create {
            return Err(crate::error::FileSystemProviderError::new(FileSystemProviderErrorCode::FileNotFound, "file does not exist").with_path(path));
        }
        if exists && !opts.overwrite {
            return Err(crate::error::FileSystemProviderError::new(FileSystemProviderErrorCode::FileExists, "file already exists").with_path(path));
        }
    }

    let open_opts = OpenOptions { write: true, create: true, unlock: opts.unlock };
    let fd = match descriptors.open(resource, open_opts).await {
        Ok(fd) => fd,
        Err(err) => return Err(upgrade_write_lock(err, path).await),
    };

    let write_result = write_all(descriptors, fd, content, path).await;
    let close_result = descriptors.close(fd).await;

    match write_result {
        Ok(()) => close_result,
        Err(err) => {
            // writeFile always closes in a finalize block; surface the
            // write error (it's the one the caller needs to see), but make
            // sure close still ran so the descriptor never leaks.
            let _ = close_result;
            Err(upgrade_write_lock(err, path).await)
        }
    }
}

/// Write the whole of `content` through the descriptor table, looping past
/// short writes (`write_all` semantics) so that `writeFile` followed by
/// `readFile` round-trips any byte sequence (§8) rather than silently
/// truncating on a partial write.
async fn write_all(descriptors: &DescriptorTable, fd: u64, content: &[u8], path: &std::path::Path) -> Result<()> {
    let mut written = 0usize;
    while written < content.len() {
        match descriptors.write(fd, written as u64, &content[written..]).await {
            Ok(0) => {
                let io_err = std::io::Error::from(std::io::ErrorKind::WriteZero);
                return Err(map_io_error(io_err, Some(path)));
            }
            Ok(n) => written += n,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Cooperative cancellation token for [`read_file_stream`].
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<tokio::sync::Notify>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.notify_waiters();
    }

    async fn cancelled(&self) {
        self.0.notified().await;
    }
}

/// One chunk of a streamed read, or the end of the stream.
#[derive(Debug)]
pub enum StreamEvent {
    Chunk(Vec<u8>),
    End,
    Cancelled,
}

/// `readFileStream(resource, opts, cancelToken) → Stream<bytes>` (§4.2).
///
/// The streaming primitive itself (backpressure, the consumer-facing stream
/// type) is an external collaborator per §1; this crate provides the pump
/// that reads `buffer_size`-sized chunks and forwards them on an mpsc
/// channel, honouring cancellation.
pub async fn read_file_stream(
    resource: &Resource,
    buffer_size: usize,
    cancel: CancellationToken,
) -> Result<tokio::sync::mpsc::Receiver<StreamEvent>> {
    let path = resource.to_file_path().to_path_buf();
    let file = tokio::fs::File::open(&path).await.map_err(|e| map_io_error(e, Some(&path)))?;
    let (tx, rx) = tokio::sync::mpsc::channel(4);

    tokio::spawn(pump(file, buffer_size, cancel, tx, path));
    Ok(rx)
}

async fn pump(
    mut file: tokio::fs::File,
    buffer_size: usize,
    cancel: CancellationToken,
    tx: tokio::sync::mpsc::Sender<StreamEvent>,
    path: std::path::PathBuf,
) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(path = %path.display(), "read_file_stream: cancelled");
                let _ = tx.send(StreamEvent::Cancelled).await;
                return;
            }
            read = file.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                let _ = tx.send(StreamEvent::End).await;
                return;
            }
            Ok(n) => {
                if tx.send(StreamEvent::Chunk(buf[..n].to_vec())).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                debug!(path = %path.display(), error = %err, "read_file_stream: read failed, ending stream");
                return;
            }
        }
    }
}

pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
