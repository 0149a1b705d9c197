//! The quick-abort policy.
//!
//! When the last reader leaves an entry whose fetch is still in progress,
//! the fetch is an orphan: nobody is waiting for its bytes. Completing it
//! anyway can still be worthwhile (the object may be requested again), so
//! the decision is economic: abort when little has arrived and much
//! remains, keep fetching when the end is near.

use tracing::debug;

use crate::config::QuickAbortConfig;
use crate::entry::StoreEntry;
use crate::entry::StoreStatus;

/// Runs the quick-abort policy after a client unregisters.
///
/// Aborts the entry's fetch iff no clients remain, the fetch is still
/// pending, the entry is not special, and [`should_quick_abort`] says the
/// remainder is not worth having.
pub fn maybe_quick_abort(entry: &StoreEntry, config: &QuickAbortConfig) {
    if !entry.has_mem() {
        return;
    }
    if entry.pending_nclients() > 0 {
        return;
    }
    if entry.store_status() != StoreStatus::Pending {
        return;
    }
    if entry.flags().special {
        return;
    }
    if !should_quick_abort(entry, config) {
        return;
    }
    entry.abort();
}

/// Decides whether an orphaned fetch should be aborted.
pub fn should_quick_abort(entry: &StoreEntry, config: &QuickAbortConfig) -> bool {
    let key = entry.key_hex();

    if !entry.request_cachable() {
        debug!(key, "quick-abort: yes, request not cachable");
        return true;
    }
    if entry.flags().key_private {
        debug!(key, "quick-abort: yes, private key");
        return true;
    }

    // With no parsed reply the expected length is zero: any received byte
    // reads as overrun and aborts below; an untouched fetch completes.
    let expectlen = entry.expected_len().unwrap_or(0).max(0);
    let curlen = entry.end_offset() as i64;
    let minlen = config.min_kb << 10;

    if config.min_kb < 0 {
        debug!(key, "quick-abort: no, disabled");
        return false;
    }
    if curlen > expectlen {
        debug!(key, curlen, expectlen, "quick-abort: yes, bad content length");
        return true;
    }
    if expectlen - curlen < minlen {
        debug!(key, "quick-abort: no, only a little more is left");
        return false;
    }
    if expectlen - curlen > (config.max_kb << 10) {
        debug!(key, "quick-abort: yes, too much left to go");
        return true;
    }
    if expectlen < 100 {
        debug!(key, "quick-abort: no, expected length too small to meter");
        return false;
    }
    // Truncating integer percentage; the check above keeps the divisor
    // nonzero.
    if curlen / (expectlen / 100) > config.pct {
        debug!(key, "quick-abort: no, past the point of no return");
        return false;
    }
    debug!(key, "quick-abort: yes, by default");
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::StoredReply;

    /// A pending entry whose reply declares `content_length` and whose
    /// window has received `curlen` bytes.
    fn pending_entry(content_length: i64, curlen: usize) -> std::rc::Rc<StoreEntry> {
        let entry = StoreEntry::new("http://example.com/abort");
        let mut reply = StoredReply::default();
        reply
            .parse(
                format!("HTTP/1.1 200 OK\r\nContent-Length: {content_length}\r\n\r\n").as_bytes(),
            )
            .unwrap();
        // Fold the header size out so expectlen is exactly content_length.
        reply.hdr_sz = 0;
        entry.set_reply(reply);
        entry.append(&vec![0u8; curlen]);
        entry
    }

    /// The configuration used by the decision-table tests.
    fn config(min_kb: i64, max_kb: i64, pct: i64) -> QuickAbortConfig {
        QuickAbortConfig {
            min_kb,
            max_kb,
            pct,
        }
    }

    #[test]
    fn aborts_a_barely_started_fetch() {
        let entry = pending_entry(10_000, 200);
        assert!(should_quick_abort(&entry, &config(4, 256, 95)));
    }

    #[test]
    fn keeps_a_nearly_finished_fetch() {
        let entry = pending_entry(10_000, 9_800);
        assert!(!should_quick_abort(&entry, &config(4, 256, 95)));
    }

    #[test]
    fn aborts_when_not_cachable() {
        let entry = pending_entry(10_000, 9_999);
        entry.set_request_cachable(false);
        assert!(should_quick_abort(&entry, &config(-1, 256, 95)));
    }

    #[test]
    fn aborts_a_private_key() {
        let entry = pending_entry(10_000, 9_999);
        entry.set_key_private(true);
        assert!(should_quick_abort(&entry, &config(-1, 256, 95)));
    }

    #[test]
    fn negative_min_disables_the_policy() {
        let entry = pending_entry(100_000_000, 0);
        assert!(!should_quick_abort(&entry, &config(-1, 16, 95)));
    }

    #[test]
    fn aborts_on_overrun_framing() {
        let entry = pending_entry(100, 500);
        assert!(should_quick_abort(&entry, &config(16, 16, 95)));
    }

    #[test]
    fn aborts_when_too_much_remains() {
        let entry = pending_entry(100_000_000, 0);
        assert!(should_quick_abort(&entry, &config(16, 16, 95)));
    }

    #[test]
    fn keeps_a_tiny_object() {
        let entry = pending_entry(50, 10);
        assert!(!should_quick_abort(&entry, &config(0, 1, 95)));
    }

    #[test]
    fn percent_threshold_is_truncating() {
        // 960 of 1000: 960 / (1000 / 100) = 96 > 95, keep.
        let entry = pending_entry(1_000, 960);
        assert!(!should_quick_abort(&entry, &config(0, 1_000_000, 95)));

        // 950 of 1000 truncates to exactly 95, which is not past it.
        let entry = pending_entry(1_000, 950);
        assert!(should_quick_abort(&entry, &config(0, 1_000_000, 95)));
    }

    #[test]
    fn wrapper_respects_its_gates() {
        // Special entries are never aborted.
        let entry = pending_entry(10_000, 200);
        entry.set_special(true);
        maybe_quick_abort(&entry, &config(4, 256, 95));
        assert!(!entry.flags().aborted);

        // A completed entry has nothing to abort.
        let entry = pending_entry(10_000, 200);
        entry.complete();
        maybe_quick_abort(&entry, &config(4, 256, 95));
        assert!(!entry.flags().aborted);

        // The barely-started pending orphan goes.
        let entry = pending_entry(10_000, 200);
        maybe_quick_abort(&entry, &config(4, 256, 95));
        assert!(entry.flags().aborted);
        assert_eq!(entry.store_status(), StoreStatus::Complete);
    }
}
