//! `DiskFileSystemProvider`: the single object wiring the five cooperating
//! subsystems together (§2), constructed once at startup and disposed at
//! shutdown (§3 lifecycle).

use std::sync::Arc;

use tracing::{debug, info_span, Instrument};

use crate::bulk_io::{self, CancellationToken, StreamEvent, WriteFileOptions};
use crate::capabilities::{self, Capabilities, Emitter, FileChange, Subscription};
use crate::config::ProviderConfig;
use crate::descriptor::{DescriptorTable, OpenOptions};
use crate::error::Result;
use crate::mutations::{self, DeleteOptions, TransferOptions};
use crate::stat::{self, FileType, StatRecord};
use crate::uri::Resource;
use crate::watch::RecursiveWatcherMultiplexer;

/// The provider: one instance per workbench session (§3).
pub struct DiskFileSystemProvider {
    config: ProviderConfig,
    descriptors: DescriptorTable,
    capabilities: Capabilities,
    on_change: Arc<Emitter<FileChange>>,
    on_error: Arc<Emitter<String>>,
    on_log_level: Arc<Emitter<bool>>,
    watcher: Arc<RecursiveWatcherMultiplexer>,
}

impl DiskFileSystemProvider {
    pub fn new(config: ProviderConfig) -> Arc<Self> {
        let on_change = Arc::new(Emitter::new());
        let on_error = Arc::new(Emitter::new());
        let on_log_level = Arc::new(Emitter::new());

        let watch_emitter = Arc::clone(&on_change);
        let watcher = RecursiveWatcherMultiplexer::new(config.clone(), Arc::new(move |change| watch_emitter.fire(&change)));

        Arc::new(Self {
            config,
            descriptors: DescriptorTable::new(),
            capabilities: capabilities::capabilities(),
            on_change,
            on_error,
            on_log_level,
            watcher,
        })
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn on_did_change_file(&self, listener: impl Fn(&FileChange) + Send + Sync + 'static) {
        self.on_change.subscribe(listener);
    }

    pub fn on_did_error_occur(&self, listener: impl Fn(&String) + Send + Sync + 'static) {
        self.on_error.subscribe(listener);
    }

    /// Toggle verbose logging on the active recursive watcher backend and
    /// every live non-recursive watch, per §4.5's "subscribe to
    /// onDidChangeLogLevel to propagate verbose mode dynamically".
    pub async fn set_log_level(&self, verbose: bool) {
        self.watcher.set_verbose_logging(verbose).await;
        self.on_log_level.fire(&verbose);
    }

    // -- Metadata (§4.1) --

    pub async fn stat(&self, resource: &Resource) -> Result<StatRecord> {
        stat::stat(resource).instrument(info_span!("stat", path = %resource.to_file_path().display())).await
    }

    pub async fn readdir(&self, resource: &Resource) -> Result<Vec<(String, FileType)>> {
        stat::readdir(resource).instrument(info_span!("readdir", path = %resource.to_file_path().display())).await
    }

    // -- Bulk I/O (§4.2) --

    pub async fn read_file(&self, resource: &Resource) -> Result<Vec<u8>> {
        bulk_io::read_file(resource).await
    }

    pub async fn write_file(&self, resource: &Resource, content: &[u8], opts: WriteFileOptions) -> Result<()> {
        bulk_io::write_file(&self.descriptors, resource, content, opts).await
    }

    pub async fn read_file_stream(&self, resource: &Resource, cancel: CancellationToken) -> Result<tokio::sync::mpsc::Receiver<StreamEvent>> {
        bulk_io::read_file_stream(resource, self.config.buffer_size, cancel).await
    }

    // -- Descriptor I/O (§4.3) --

    pub async fn open(&self, resource: &Resource, opts: OpenOptions) -> Result<u64> {
        self.descriptors.open(resource, opts).await
    }

    pub async fn close(&self, fd: u64) -> Result<()> {
        self.descriptors.close(fd).await
    }

    pub async fn read(&self, fd: u64, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.descriptors.read(fd, pos, buf).await
    }

    pub async fn write(&self, fd: u64, pos: u64, data: &[u8]) -> Result<usize> {
        self.descriptors.write(fd, pos, data).await
    }

    // -- Mutations (§4.4) --

    pub async fn mkdir(&self, resource: &Resource) -> Result<()> {
        mutations::mkdir(resource).await
    }

    pub async fn delete(&self, resource: &Resource, opts: DeleteOptions) -> Result<()> {
        mutations::delete(resource, opts).await
    }

    pub async fn rename(&self, from: &Resource, to: &Resource, opts: TransferOptions) -> Result<()> {
        let case_sensitive = self.capabilities.contains(Capabilities::PATH_CASE_SENSITIVE);
        mutations::rename(from, to, opts, case_sensitive).await
    }

    pub async fn copy(&self, from: &Resource, to: &Resource, opts: TransferOptions) -> Result<()> {
        let case_sensitive = self.capabilities.contains(Capabilities::PATH_CASE_SENSITIVE);
        mutations::copy(from, to, opts, case_sensitive).await
    }

    // -- Watch multiplexer (§4.5) --

    pub async fn watch_recursive(&self, path: impl Into<String>, excludes: Vec<String>) -> Subscription {
        self.watcher.watch_recursive(path, excludes).await
    }

    pub fn watch_non_recursive(&self, path: impl AsRef<std::path::Path>) -> Subscription {
        crate::watch::watch_non_recursive(path, Arc::clone(&self.on_change), Arc::clone(&self.on_error), Arc::clone(&self.on_log_level))
    }

    /// Dispose the provider: tears down the active recursive watcher (§3).
    /// Non-recursive watches and emitter subscriptions are torn down by
    /// dropping their own [`Subscription`] handles.
    pub async fn dispose(&self) {
        debug!("disposing DiskFileSystemProvider");
        self.watcher.dispose().await;
    }
}
