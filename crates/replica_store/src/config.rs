//! Store configuration.

/// Configuration for opening a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Whether to create the store directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to sync the journal on every commit (safer but slower).
    pub sync_on_commit: bool,

    /// Write a checkpoint once this many frames have accumulated (0 = never).
    pub checkpoint_after_frames: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_commit: true,
            checkpoint_after_frames: 1024,
        }
    }
}

impl StoreConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the store directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to sync the journal on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the automatic checkpoint threshold.
    #[must_use]
    pub const fn checkpoint_after_frames(mut self, frames: u64) -> Self {
        self.checkpoint_after_frames = frames;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = StoreConfig::default();
        assert!(config.create_if_missing);
        assert!(config.sync_on_commit);
        assert_eq!(config.checkpoint_after_frames, 1024);
    }

    #[test]
    fn builder_pattern() {
        let config = StoreConfig::new()
            .sync_on_commit(false)
            .checkpoint_after_frames(0);

        assert!(!config.sync_on_commit);
        assert_eq!(config.checkpoint_after_frames, 0);
    }
}
