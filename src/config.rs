//! Layered configuration for the provider (§6, §10.3): defaults baked in,
//! overridable via a TOML document at construction.

use serde::Deserialize;

/// Top-level provider configuration (§6 "Configuration options").
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Streaming read chunk size in bytes (default 64 KiB).
    pub buffer_size: usize,
    pub watcher: WatcherConfig,
    /// Product release track; `"stable"` influences the legacy-watcher
    /// default heuristic (§4.5).
    pub product_channel: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self { buffer_size: crate::bulk_io::DEFAULT_BUFFER_SIZE, watcher: WatcherConfig::default(), product_channel: "stable".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub use_polling: PollingMode,
    pub polling_interval_ms: u64,
    pub legacy_watcher: LegacyWatcher,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self { use_polling: PollingMode::Off, polling_interval_ms: 5_000, legacy_watcher: LegacyWatcher::Absent }
    }
}

/// `watcher.usePolling`: `false`, `true` (all folders), or a glob allowlist
/// (§6).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PollingMode {
    #[default]
    Off,
    All,
    Globs(Vec<String>),
}

impl PollingMode {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, PollingMode::Off)
    }
}

/// TOML represents `usePolling` as either a bool or a glob list; a plain
/// `#[serde(untagged)]` on [`PollingMode`] can't match a bare bool against a
/// unit variant, so this wrapper mirrors the on-disk shape and [`PollingMode`]
/// converts from it.
#[derive(Deserialize)]
#[serde(untagged)]
enum PollingModeRepr {
    Bool(bool),
    Globs(Vec<String>),
}

impl<'de> Deserialize<'de> for PollingMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(match PollingModeRepr::deserialize(deserializer)? {
            PollingModeRepr::Bool(false) => PollingMode::Off,
            PollingModeRepr::Bool(true) => PollingMode::All,
            PollingModeRepr::Globs(globs) => PollingMode::Globs(globs),
        })
    }
}

/// `legacyWatcher`: `"on"` forces legacy, `"off"` forces efficient, absent
/// applies the heuristic in §4.5 step 2.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LegacyWatcher {
    On,
    Off,
    #[default]
    Absent,
}

impl ProviderConfig {
    /// Parse a provider config from a TOML document, falling back to
    /// defaults for any field it doesn't set.
    pub fn from_toml(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }
}
