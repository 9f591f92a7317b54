//! Replica configuration.

use replica_store::StoreConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for opening a replica.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// How long an upload may stay `uploading` before it is reset.
    pub upload_expiry: Duration,

    /// How long a download may stay `downloading` before it is reset.
    pub download_expiry: Duration,

    /// How long a deletion request may stay `deleting` before it is reset.
    pub deletion_expiry: Duration,

    /// Expiry interval sent to the server with each upload batch.
    pub batch_expiry_interval: Duration,

    /// Retry count above which expiry resets are logged as warnings.
    pub retry_warning_threshold: u32,

    /// Durable store configuration.
    pub store: StoreConfig,

    /// Directory for staged upload content. Defaults to `<root>/staging` for
    /// on-disk replicas; in-memory replicas have none unless set.
    pub staging_dir: Option<PathBuf>,

    /// Replay recorded transfer outcomes when the replica opens.
    pub reattach_on_open: bool,

    /// Run pending schema migrations when the replica opens.
    pub migrate_on_open: bool,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            upload_expiry: Duration::from_secs(60 * 60),
            download_expiry: Duration::from_secs(60 * 60),
            deletion_expiry: Duration::from_secs(10 * 60),
            batch_expiry_interval: Duration::from_secs(24 * 60 * 60),
            retry_warning_threshold: 5,
            store: StoreConfig::default(),
            staging_dir: None,
            reattach_on_open: true,
            migrate_on_open: true,
        }
    }
}

impl ReplicaConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the upload expiry.
    #[must_use]
    pub const fn upload_expiry(mut self, expiry: Duration) -> Self {
        self.upload_expiry = expiry;
        self
    }

    /// Sets the download expiry.
    #[must_use]
    pub const fn download_expiry(mut self, expiry: Duration) -> Self {
        self.download_expiry = expiry;
        self
    }

    /// Sets the deletion expiry.
    #[must_use]
    pub const fn deletion_expiry(mut self, expiry: Duration) -> Self {
        self.deletion_expiry = expiry;
        self
    }

    /// Sets the batch expiry interval sent to the server.
    #[must_use]
    pub const fn batch_expiry_interval(mut self, interval: Duration) -> Self {
        self.batch_expiry_interval = interval;
        self
    }

    /// Sets the retry warning threshold.
    #[must_use]
    pub const fn retry_warning_threshold(mut self, retries: u32) -> Self {
        self.retry_warning_threshold = retries;
        self
    }

    /// Sets the store configuration.
    #[must_use]
    pub fn store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Sets the staging directory.
    #[must_use]
    pub fn staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    /// Sets whether recorded transfer outcomes are replayed on open.
    #[must_use]
    pub const fn reattach_on_open(mut self, value: bool) -> Self {
        self.reattach_on_open = value;
        self
    }

    /// Sets whether pending migrations run on open.
    #[must_use]
    pub const fn migrate_on_open(mut self, value: bool) -> Self {
        self.migrate_on_open = value;
        self
    }
}
