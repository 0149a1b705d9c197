//! Failure kinds surfaced by the store client.

use thiserror::Error;

use crate::meta::MetaError;

/// A terminal failure on a store client.
///
/// Every variant is surfaced to the one outstanding copy callback as a
/// zero-length delivery with the error flag set; none of them propagate
/// further. A client that has failed stays failed (`object_ok` is never
/// reset) and answers subsequent copies with the same terminal delivery.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The global open-disk-files ceiling was reached before the swap-in
    /// handle could be opened.
    #[error("too many disk files open")]
    DiskOpenLimit,

    /// The swap directory refused to open a swap-in handle.
    #[error("failed to open swap-in file: {0}")]
    DiskOpenFailed(anyhow::Error),

    /// A positioned read on the swap file reported an error.
    #[error("swap file read failed: {0}")]
    DiskRead(#[from] std::io::Error),

    /// The swap file's metadata prefix was rejected.
    #[error("swap file metadata corrupt: {0}")]
    MetadataCorrupt(#[from] MetaError),

    /// A memory-only reader asked for bytes already trimmed from the
    /// window, with no swap file to fall back to.
    #[error("requested bytes are no longer in memory")]
    OutOfWindow,

    /// The client was unregistered while a copy was pending.
    #[error("client unregistered with a copy pending")]
    UnexpectedTermination,
}
