//! Runtime configuration consumed by the store.

use serde::Deserialize;

/// Tuning for the quick-abort policy.
///
/// The policy runs when the last client leaves an entry whose fetch is
/// still in progress and decides whether finishing the fetch is worth the
/// bandwidth.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct QuickAbortConfig {
    /// Keep fetching when less than this many KiB remain.
    ///
    /// A negative value disables the policy entirely: orphaned fetches are
    /// always allowed to finish.
    pub min_kb: i64,

    /// Abort when more than this many KiB remain.
    pub max_kb: i64,

    /// Keep fetching when more than this percentage of the object has
    /// already arrived.
    pub pct: i64,
}

impl Default for QuickAbortConfig {
    fn default() -> Self {
        Self {
            min_kb: 16,
            max_kb: 16,
            pct: 95,
        }
    }
}

/// Configuration for the store.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Quick-abort tuning.
    pub quick_abort: QuickAbortConfig,

    /// Ceiling on concurrently open swap-in handles.
    ///
    /// `None` means unlimited. When the ceiling is reached, a client that
    /// needs to open a swap-in handle fails its copy instead of queueing.
    pub max_open_disk_files: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quick_abort_defaults() {
        let config = QuickAbortConfig::default();
        assert_eq!(config.min_kb, 16);
        assert_eq!(config.max_kb, 16);
        assert_eq!(config.pct, 95);
    }

    #[test]
    fn store_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.max_open_disk_files, None);
    }
}
