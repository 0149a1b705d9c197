//! Store clients and the copy engine.
//!
//! A [`StoreClient`] is one reader of a store entry. It holds at most one
//! outstanding copy request at a time and guarantees exactly one delivery
//! per request: from the memory window (possibly synchronously), from the
//! swap file once the metadata prefix has been validated, as a clean EOF,
//! or as a terminal error.
//!
//! The engine is not re-entrant. A copy attempted while another is on the
//! stack (a new request issued from inside a delivery callback, or a disk
//! layer completing synchronously) is parked as a zero-delay event and
//! resumes at the top level of the loop.

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::rc::Rc;
use std::rc::Weak;

use bytes::BytesMut;
use tracing::debug;
use tracing::warn;

use crate::abort::maybe_quick_abort;
use crate::entry::StoreClientKind;
use crate::entry::StoreEntry;
use crate::entry::StoreStatus;
use crate::entry::SwapState;
use crate::error::StoreError;
use crate::meta::SwapMetaUnpacker;
use crate::store::Store;
use crate::swap::SwapIn;

/// Size of the first disk read when the metadata prefix has not been
/// measured yet; large enough to cover the prefix of any sane object plus
/// the head of the body.
const SWAP_META_READ_SIZE: usize = 4096;

/// One copy request: a range of the object and the buffer to fill.
pub struct CopyRequest {
    /// Object offset the delivery should start at.
    pub offset: u64,
    /// Maximum number of bytes to deliver.
    pub length: usize,
    /// The buffer the bytes are delivered in.
    pub buf: BytesMut,
}

impl CopyRequest {
    /// A request for up to `length` bytes at `offset`, with a fresh buffer.
    pub fn new(offset: u64, length: usize) -> Self {
        Self {
            offset,
            length,
            buf: BytesMut::with_capacity(length),
        }
    }
}

/// The outcome of one copy request.
pub struct CopyResult {
    /// Object offset the delivery starts at.
    pub offset: u64,
    /// The delivered bytes, in the request's buffer.
    pub data: BytesMut,
    /// Whether the request failed terminally.
    pub error: bool,
}

impl CopyResult {
    /// The number of bytes delivered.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether no bytes were delivered.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether this is a clean end of object.
    pub fn is_eof(&self) -> bool {
        !self.error && self.data.is_empty()
    }
}

/// The receiver of copy deliveries.
///
/// The client stores only a weak reference to its sink; a delivery whose
/// sink has been dropped (its transaction is gone) is silently discarded.
/// This is what lets in-flight disk completions outlive their requester.
pub trait CopySink {
    /// Receives the result of one copy request.
    ///
    /// Issuing the next [`StoreClient::copy`] from inside this callback is
    /// allowed.
    fn deliver(&self, result: CopyResult);
}

/// Mutable per-client state.
struct ClientState {
    /// Object offset labelling the next delivery.
    cmp_offset: u64,
    /// Offset of the current (or last) copy request.
    copy_offset: u64,
    /// Length of the current (or last) copy request.
    copy_length: usize,
    /// The request's buffer; absent while lent to a disk read and after
    /// delivery.
    buf: Option<BytesMut>,
    /// The pending sink; a copy is outstanding iff this is set.
    sink: Option<Weak<dyn CopySink>>,
    /// The swap-in handle, once opened.
    swap_in: Option<Rc<dyn SwapIn>>,
    /// Cleared on the first unrecoverable failure.
    object_ok: bool,
    /// A disk read is in flight.
    disk_io_pending: bool,
    /// The copy engine is on the call stack.
    store_copying: bool,
    /// A deferred copy event is queued.
    copy_event_pending: bool,
}

/// One reader of a store entry.
pub struct StoreClient {
    /// The entry this client reads; fixed at registration.
    entry: Rc<StoreEntry>,
    /// How this client reaches the entry's bytes; fixed at registration.
    kind: StoreClientKind,
    /// The shared store context.
    store: Rc<Store>,
    /// Self-handle for deferred events and disk completions.
    weak_self: Weak<StoreClient>,
    /// The mutable state.
    state: RefCell<ClientState>,
}

impl StoreClient {
    /// Registers a new client on `entry`.
    ///
    /// The caller owns the returned client and must pass it to
    /// [`unregister`] when the transaction ends.
    ///
    /// # Panics
    ///
    /// Panics when the entry has no memory state, or when a disk reader is
    /// registered on an entry with neither a swap file nor an active
    /// swap-out. Both are caller bugs: the contract is unsatisfiable.
    ///
    /// [`unregister`]: StoreClient::unregister
    pub fn register(entry: &Rc<StoreEntry>, store: &Rc<Store>) -> Rc<Self> {
        assert!(
            entry.has_mem(),
            "cannot register a client on an entry without memory state"
        );
        let kind = entry.store_client_type();
        if kind == StoreClientKind::Disk {
            // The data must be reachable, now or once the swap-out lands.
            assert!(
                entry.swap_filen().is_some() || entry.swap_out_able(),
                "disk client registered with no way to reach the data"
            );
        }

        let client = Rc::new_cyclic(|weak_self| Self {
            entry: Rc::clone(entry),
            kind,
            store: Rc::clone(store),
            weak_self: weak_self.clone(),
            state: RefCell::new(ClientState {
                cmp_offset: 0,
                copy_offset: 0,
                copy_length: 0,
                buf: None,
                sink: None,
                swap_in: None,
                object_ok: true,
                disk_io_pending: false,
                store_copying: false,
                copy_event_pending: false,
            }),
        });
        entry.add_client(&client);
        debug!(key = entry.key_hex(), kind = ?kind, "registered store client");
        client
    }

    /// Unregisters `client` from `entry`.
    ///
    /// Closes any swap-in handle, fails a pending copy with a terminal
    /// error, gives the producer one more chance to commit to disk, and,
    /// when this was the last client, runs the quick-abort policy.
    ///
    /// Returns `false` when the entry has no memory state or the client
    /// was not registered on it.
    pub fn unregister(client: &Rc<StoreClient>, entry: &Rc<StoreEntry>) -> bool {
        debug_assert!(Rc::ptr_eq(&client.entry, entry));
        if !entry.has_mem() {
            return false;
        }
        if !entry.remove_client(client) {
            return false;
        }
        debug!(key = entry.key_hex(), "unregistering store client");

        // A lingering producer obligation: the object is complete but its
        // swap-out is not.
        if entry.store_status() == StoreStatus::Complete && entry.swap_state() != SwapState::Done {
            entry.swap_out();
        }

        if client.state.borrow_mut().swap_in.take().is_some() {
            client.store.count_swap_in();
        }

        if client.is_copy_pending() {
            client.fail(StoreError::UnexpectedTermination);
        }

        if entry.nclients() == 0 {
            maybe_quick_abort(entry, &client.store.config().quick_abort);
        }
        true
    }

    /// The entry this client reads.
    pub fn entry(&self) -> &Rc<StoreEntry> {
        &self.entry
    }

    /// How this client reaches the entry's bytes.
    pub fn kind(&self) -> StoreClientKind {
        self.kind
    }

    /// Whether a copy is outstanding.
    pub fn is_copy_pending(&self) -> bool {
        self.state.borrow().sink.is_some()
    }

    /// Whether the client is still healthy.
    pub fn object_ok(&self) -> bool {
        self.state.borrow().object_ok
    }

    /// The offset of the current (or last) copy request.
    pub fn copy_offset(&self) -> u64 {
        self.state.borrow().copy_offset
    }

    /// Whether this is a memory reader that still wants bytes below
    /// `offset`; the producer must not trim those from the window.
    pub fn mem_reader_has_lower_offset(&self, offset: u64) -> bool {
        self.kind == StoreClientKind::Memory && self.copy_offset() < offset
    }

    /// Issues a copy request.
    ///
    /// Exactly one delivery to `sink` follows: once data is available,
    /// when the producer finished at or before `request.offset`, or on a
    /// terminal error. The delivery may be synchronous when the data is
    /// already in memory, but never runs inside another client's delivery.
    ///
    /// # Panics
    ///
    /// Panics when a copy is already pending or the entry was aborted;
    /// both are caller bugs.
    pub fn copy<S: CopySink + 'static>(&self, request: CopyRequest, sink: &Rc<S>) {
        assert!(
            !self.entry.flags().aborted,
            "copy issued on an aborted entry"
        );
        {
            let mut state = self.state.borrow_mut();
            assert!(state.sink.is_none(), "copy issued while one is pending");
            debug!(
                key = self.entry.key_hex(),
                offset = request.offset,
                length = request.length,
                "copy requested"
            );
            // Range requests may jump into the body.
            state.cmp_offset = request.offset;
            state.copy_offset = request.offset;
            state.copy_length = request.length;
            state.buf = Some(request.buf);
            let sink: Rc<dyn CopySink> = sink.clone();
            let sink: Weak<dyn CopySink> = Rc::downgrade(&sink);
            state.sink = Some(sink);
        }
        self.drive_copy();
    }

    /// Marks the client failed and answers any pending copy with a
    /// terminal error.
    pub fn fail(&self, reason: StoreError) {
        warn!(
            key = self.entry.key_hex(),
            error = %reason,
            "store client failed"
        );
        self.state.borrow_mut().object_ok = false;
        if self.is_copy_pending() {
            self.finish(0, true);
        }
    }

    /// Writes this client's stats for a cache-manager style report.
    pub fn dump_stats<W: fmt::Write>(&self, out: &mut W, client_number: usize) -> fmt::Result {
        let state = self.state.borrow();
        writeln!(out, "\tClient #{client_number}")?;
        writeln!(out, "\t\tcopy_offset: {}", state.copy_offset)?;
        writeln!(out, "\t\tcopy_size: {}", state.copy_length)?;
        write!(out, "\t\tflags:")?;
        if state.sink.is_some() {
            write!(out, " pending")?;
        }
        if state.disk_io_pending {
            write!(out, " disk_io_pending")?;
        }
        if state.store_copying {
            write!(out, " store_copying")?;
        }
        if state.copy_event_pending {
            write!(out, " copy_event_pending")?;
        }
        writeln!(out)
    }

    /// Attempts to make progress on the pending copy.
    ///
    /// Re-entrant calls (the engine is already on the stack) are parked as
    /// a zero-delay event; calls while the producer is still assembling
    /// headers return silently and rely on [`invoke_handlers`] to re-drive.
    pub(crate) fn drive_copy(&self) {
        if self.state.borrow().copy_event_pending {
            // A deferred run is queued; it will observe the latest state.
            return;
        }
        if self.entry.flags().fwd_headers_wait {
            debug!(
                key = self.entry.key_hex(),
                "returning: producer is still assembling reply headers"
            );
            return;
        }

        let defer = {
            let mut state = self.state.borrow_mut();
            if state.store_copying {
                state.copy_event_pending = true;
                true
            } else {
                false
            }
        };
        if defer {
            debug!(key = self.entry.key_hex(), "queueing deferred copy");
            let weak = self.weak_self.clone();
            self.store.events().schedule(
                "store client deferred copy",
                Box::new(move || {
                    if let Some(client) = weak.upgrade() {
                        client.deferred_copy();
                    }
                }),
            );
            return;
        }

        debug_assert!(self.is_copy_pending());
        self.do_copy();
    }

    /// Runs when a deferred copy event fires.
    fn deferred_copy(&self) {
        {
            let mut state = self.state.borrow_mut();
            debug_assert!(state.copy_event_pending);
            state.copy_event_pending = false;
            if state.sink.is_none() {
                return;
            }
        }
        self.drive_copy();
    }

    /// Whether the producer is finished and the request starts at or past
    /// the end of the object.
    ///
    /// An unknown object length proves nothing: the swap file must be
    /// opened to find out.
    fn no_more_to_send(&self) -> bool {
        if self.entry.store_status() == StoreStatus::Pending {
            return false;
        }
        match self.entry.object_len() {
            Some(len) => self.state.borrow().copy_offset >= len,
            None => false,
        }
    }

    /// Selects a source for the pending copy and acts on it.
    fn do_copy(&self) {
        let _copying = CopyingGuard::arm(self);

        // A failed client only delivers terminal errors.
        if !self.state.borrow().object_ok {
            self.finish(0, true);
            return;
        }

        let (offset, length) = {
            let state = self.state.borrow();
            (state.copy_offset, state.copy_length)
        };
        debug!(
            key = self.entry.key_hex(),
            offset,
            end = self.entry.end_offset(),
            "driving copy"
        );

        if self.no_more_to_send() {
            // Clean end of object.
            self.finish(0, false);
            return;
        }

        // The producer has not reached the requested offset yet; the
        // handler fanout will wake us when it appends.
        if self.entry.store_status() == StoreStatus::Pending && offset >= self.entry.end_offset() {
            debug!(key = self.entry.key_hex(), "waiting for more producer bytes");
            return;
        }

        // Open the swap-in handle up front, even if this request could be
        // served from memory: failing the open now lets the caller fall
        // back to a cache miss before any byte has been sent on.
        if self.kind == StoreClientKind::Disk && self.state.borrow().swap_in.is_none() {
            if self.store.too_many_disk_files_open() {
                self.fail(StoreError::DiskOpenLimit);
                return;
            }
            if self.state.borrow().disk_io_pending {
                warn!(
                    key = self.entry.key_hex(),
                    "averted a second operation on a handle still opening"
                );
                return;
            }
            match self.store.swap_dir().open(&self.entry) {
                Ok(handle) => self.state.borrow_mut().swap_in = Some(handle),
                Err(e) => {
                    self.fail(StoreError::DiskOpenFailed(e));
                    return;
                }
            }
        }

        // The memory window.
        if offset >= self.entry.inmem_lo() && offset < self.entry.end_offset() {
            let n = {
                let mut state = self.state.borrow_mut();
                let mut buf = state.buf.take().expect("a pending copy holds a buffer");
                let n = self.entry.mem_copy(offset, &mut buf, length);
                state.buf = Some(buf);
                n
            };
            debug!(key = self.entry.key_hex(), n, "copying from the memory window");
            self.finish(n, false);
            return;
        }

        // Below the window with no swap file to fall back to: the bytes
        // are gone.
        if self.kind == StoreClientKind::Memory {
            self.fail(StoreError::OutOfWindow);
            return;
        }

        debug_assert!(!self.state.borrow().disk_io_pending);
        self.start_disk_read();
    }

    /// Issues the next disk read for the pending copy.
    fn start_disk_read(&self) {
        let hdr_sz = self.entry.swap_hdr_sz();
        let (swap_in, offset, length) = {
            let mut state = self.state.borrow_mut();
            debug_assert!(state.sink.is_some());
            debug_assert!(!state.disk_io_pending);
            state.disk_io_pending = true;
            let swap_in = Rc::clone(
                state
                    .swap_in
                    .as_ref()
                    .expect("a disk read needs an open swap-in handle"),
            );
            (swap_in, state.copy_offset, state.copy_length)
        };

        if hdr_sz == 0 {
            // First read: measure the metadata prefix. Read into a staging
            // buffer so the body segment can be carved out afterwards.
            let read_len = length.max(SWAP_META_READ_SIZE);
            debug!(
                key = self.entry.key_hex(),
                read_len, "reading the swap metadata prefix"
            );
            let weak = self.weak_self.clone();
            swap_in.read(
                BytesMut::new(),
                0,
                read_len,
                Box::new(move |result| {
                    if let Some(client) = weak.upgrade() {
                        client.handle_header_read(result);
                    }
                }),
            );
            return;
        }

        if self.entry.swap_state() == SwapState::Writing {
            // The swap-out must already have committed past this range.
            debug_assert!(self.entry.swapout_offset() > offset);
        }
        debug!(
            key = self.entry.key_hex(),
            offset, length, "reading object bytes from disk"
        );
        let buf = {
            let mut state = self.state.borrow_mut();
            state.buf.take().expect("a pending copy holds a buffer")
        };
        let weak = self.weak_self.clone();
        swap_in.read(
            buf,
            offset + hdr_sz,
            length,
            Box::new(move |result| {
                if let Some(client) = weak.upgrade() {
                    client.handle_body_read(result);
                }
            }),
        );
    }

    /// Completion of a body read.
    fn handle_body_read(&self, result: io::Result<BytesMut>) {
        {
            let mut state = self.state.borrow_mut();
            debug_assert!(state.disk_io_pending);
            state.disk_io_pending = false;
            if state.sink.is_none() {
                // Unregistered while the read was in flight.
                return;
            }
        }

        let buf = match result {
            Ok(buf) => buf,
            Err(e) => {
                self.fail(StoreError::DiskRead(e));
                return;
            }
        };
        let n = buf.len();
        debug!(key = self.entry.key_hex(), n, "body read completed");

        // The first chunk of a disk hit carries the serialized reply;
        // reconstruct the in-memory reply state if nobody has yet.
        if self.state.borrow().copy_offset == 0 && n > 0 && !self.entry.reply_parsed() {
            self.entry.repopulate_reply(&buf);
        }

        self.state.borrow_mut().buf = Some(buf);
        self.finish(n, false);
    }

    /// Completion of the metadata-prefix read.
    fn handle_header_read(&self, result: io::Result<BytesMut>) {
        {
            let mut state = self.state.borrow_mut();
            debug_assert!(state.disk_io_pending);
            state.disk_io_pending = false;
            if state.sink.is_none() {
                // Unregistered while the read was in flight.
                return;
            }
        }

        let staging = match result {
            Ok(buf) => buf,
            Err(e) => {
                self.fail(StoreError::DiskRead(e));
                return;
            }
        };

        let meta = match SwapMetaUnpacker::new(&staging).unpack() {
            Ok(meta) => meta,
            Err(e) => {
                warn!(
                    key = self.entry.key_hex(),
                    "swap file metadata inconsistent with available data"
                );
                self.fail(StoreError::MetadataCorrupt(e));
                return;
            }
        };
        // Make sure we got the right object.
        for tlv in &meta.tlvs {
            if let Err(e) = tlv.check_consistency(&self.entry) {
                self.fail(StoreError::MetadataCorrupt(e));
                return;
            }
        }

        let hdr_sz = meta.hdr_sz as u64;
        self.entry.set_swap_meta(hdr_sz);

        let (offset, length) = {
            let state = self.state.borrow();
            (state.copy_offset, state.copy_length)
        };
        let body_sz = staging.len() as u64 - hdr_sz;
        if offset < body_sz {
            // The first read already holds (part of) what the caller
            // wants: carve the body segment into the request buffer.
            let start = (hdr_sz + offset) as usize;
            let n = length.min((body_sz - offset) as usize);
            {
                let mut state = self.state.borrow_mut();
                let mut buf = state.buf.take().expect("a pending copy holds a buffer");
                buf.clear();
                buf.extend_from_slice(&staging[start..start + n]);
                state.buf = Some(buf);
            }
            if offset == 0 && n > 0 && !self.entry.reply_parsed() {
                self.entry.repopulate_reply(&staging[hdr_sz as usize..]);
            }
            debug!(
                key = self.entry.key_hex(),
                n, "delivering body bytes from the metadata read"
            );
            self.finish(n, false);
            return;
        }

        // Nothing past the metadata yet; issue the real body read now
        // that the prefix size is known.
        debug!(
            key = self.entry.key_hex(),
            hdr_sz, "re-reading for the body region"
        );
        self.start_disk_read();
    }

    /// Delivers the pending copy's result.
    ///
    /// The pending state is cleared before the sink runs, so the sink may
    /// issue the next copy from inside its callback. A sink that has been
    /// dropped in the meantime is skipped.
    fn finish(&self, n: usize, error: bool) {
        let (sink, result) = {
            let mut state = self.state.borrow_mut();
            let sink = state.sink.take().expect("delivery without a pending copy");
            let mut data = state.buf.take().unwrap_or_default();
            data.truncate(n);
            let result = CopyResult {
                offset: state.cmp_offset,
                data,
                error,
            };
            state.cmp_offset = state.copy_offset + result.data.len() as u64;
            (sink, result)
        };
        match sink.upgrade() {
            Some(sink) => sink.deliver(result),
            None => debug!(
                key = self.entry.key_hex(),
                "dropping delivery to a dead sink"
            ),
        }
    }
}

/// RAII mark for "the copy engine is on this client's stack".
struct CopyingGuard<'a> {
    /// The client being driven.
    client: &'a StoreClient,
}

impl<'a> CopyingGuard<'a> {
    /// Sets the mark.
    fn arm(client: &'a StoreClient) -> Self {
        let mut state = client.state.borrow_mut();
        debug_assert!(!state.store_copying);
        state.store_copying = true;
        Self { client }
    }
}

impl Drop for CopyingGuard<'_> {
    fn drop(&mut self) {
        self.client.state.borrow_mut().store_copying = false;
    }
}

/// Re-drives every waiting client of `entry`.
///
/// The producer calls this after appending bytes (or finishing). Clients
/// with no pending copy, or with a disk read already in flight, are left
/// alone; everyone else gets the copy engine run once. The list is
/// iterated over a snapshot, so deliveries that register or unregister
/// clients cannot skip or repeat anyone, and calling this redundantly is
/// harmless.
pub fn invoke_handlers(entry: &Rc<StoreEntry>) {
    // Commit what we can to disk first, if appropriate.
    entry.swap_out();

    debug!(key = entry.key_hex(), "invoking handlers");
    for (i, weak) in entry.client_snapshot().into_iter().enumerate() {
        let Some(client) = weak.upgrade() else {
            continue;
        };
        debug!(client = i, "checking client");
        if !client.is_copy_pending() {
            continue;
        }
        if client.state.borrow().disk_io_pending {
            continue;
        }
        client.drive_copy();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::config::StoreConfig;
    use crate::events::EventQueue;
    use crate::events::Events;
    use crate::swap::FileSwapDir;

    /// Records deliveries for inspection.
    #[derive(Default)]
    struct TestSink {
        /// Results in delivery order.
        results: RefCell<Vec<CopyResult>>,
    }

    impl CopySink for TestSink {
        fn deliver(&self, result: CopyResult) {
            self.results.borrow_mut().push(result);
        }
    }

    /// A store over an empty temporary swap directory.
    fn test_store(events: &Rc<EventQueue>) -> (Rc<Store>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let swap_dir = FileSwapDir::new(dir.path(), Rc::clone(events) as Rc<dyn Events>);
        let store = Store::new(
            Rc::new(swap_dir),
            Rc::clone(events) as Rc<dyn Events>,
            StoreConfig::default(),
        );
        (store, dir)
    }

    #[test]
    fn register_and_unregister_bookkeeping() {
        let events = Rc::new(EventQueue::new());
        let (store, _dir) = test_store(&events);
        let entry = StoreEntry::new("http://example.com/r");

        let client = StoreClient::register(&entry, &store);
        assert_eq!(entry.nclients(), 1);
        assert_eq!(entry.refcount(), 1);
        assert_eq!(client.kind(), StoreClientKind::Memory);

        assert!(StoreClient::unregister(&client, &entry));
        assert_eq!(entry.nclients(), 0);

        // A second unregister finds nothing.
        assert!(!StoreClient::unregister(&client, &entry));
    }

    #[test]
    fn memory_hit_delivers_synchronously() {
        let events = Rc::new(EventQueue::new());
        let (store, _dir) = test_store(&events);
        let entry = StoreEntry::new("http://example.com/m");
        entry.append(b"hello world");

        let client = StoreClient::register(&entry, &store);
        let sink = Rc::new(TestSink::default());
        client.copy(CopyRequest::new(6, 5), &sink);

        let results = sink.results.borrow();
        assert_eq!(results.len(), 1);
        assert_eq!(&results[0].data[..], b"world");
        assert_eq!(results[0].offset, 6);
        assert!(!results[0].error);
        drop(results);

        assert!(!client.is_copy_pending());
        StoreClient::unregister(&client, &entry);
    }

    #[test]
    fn stats_dump_names_the_pending_flags() {
        let events = Rc::new(EventQueue::new());
        let (store, _dir) = test_store(&events);
        let entry = StoreEntry::new("http://example.com/s");

        let client = StoreClient::register(&entry, &store);
        let sink = Rc::new(TestSink::default());
        client.copy(CopyRequest::new(10, 20), &sink);

        let mut out = String::new();
        client.dump_stats(&mut out, 0).unwrap();
        assert!(out.contains("copy_offset: 10"));
        assert!(out.contains("copy_size: 20"));
        assert!(out.contains(" pending"));

        StoreClient::unregister(&client, &entry);
    }
}
