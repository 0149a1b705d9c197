//! Store entries and their memory-resident state.
//!
//! A [`StoreEntry`] is the shared description of one cached response; a
//! [`MemObject`] is the mutable state an active entry carries while it has
//! readers or a producer: the in-memory byte window, the client list, the
//! reply metadata, and the swap-out progress.
//!
//! Entries are shared single-threaded objects (`Rc` + interior
//! mutability). The entry never owns its clients; the client list holds
//! weak references and the transaction that registered a client owns it.

use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;

use bytes::Buf;
use bytes::BytesMut;
use sha2::Digest;
use sha2::Sha256;
use tracing::debug;
use tracing::warn;

use crate::client::StoreClient;
use crate::client::invoke_handlers;
use crate::reply::StoredReply;
use crate::reply::headers_end;

/// Where the producer side of an entry stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    /// The producer is still appending bytes.
    Pending,
    /// The producer is done; no more bytes will arrive.
    Complete,
}

/// Where the entry's swap-out stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapState {
    /// The entry has no swap file.
    None,
    /// The entry is being written to its swap file.
    Writing,
    /// The swap file holds the complete object.
    Done,
}

/// How a client will read an entry, fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreClientKind {
    /// Every byte the client wants is (or will be) in the memory window.
    Memory,
    /// Some of what the client wants lives only in the swap file.
    Disk,
}

/// Entry status bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryFlags {
    /// The fetch was aborted; no further copies may be issued.
    pub aborted: bool,
    /// The producer is still assembling reply headers; clients hold off.
    pub fwd_headers_wait: bool,
    /// The entry key is private to one transaction.
    pub key_private: bool,
    /// The entry is an internal object exempt from quick-abort.
    pub special: bool,
}

/// The memory-resident state of an active entry.
pub struct MemObject {
    /// The URL the object was (or is being) fetched from.
    url: String,
    /// The in-memory byte window; holds object bytes from `inmem_lo` up.
    window: BytesMut,
    /// Object offset of the first byte in the window.
    inmem_lo: u64,
    /// The registered readers, owned by their transactions.
    clients: Vec<Weak<StoreClient>>,
    /// Descriptor sentinel for the first client; `-1` when unset.
    fd: i32,
    /// Size of the swap file's metadata prefix; `0` until known.
    swap_hdr_sz: u64,
    /// Total object length, headers included; `None` until known.
    object_sz: Option<u64>,
    /// Whether the originating request allows caching.
    request_cachable: bool,
    /// How far the swap-out has committed to disk.
    swapout_offset: u64,
    /// The reply metadata, possibly not yet parsed.
    reply: StoredReply,
}

impl MemObject {
    /// Constructs the memory state for a fresh entry.
    fn new(url: String) -> Self {
        Self {
            url,
            window: BytesMut::new(),
            inmem_lo: 0,
            clients: Vec::new(),
            fd: -1,
            swap_hdr_sz: 0,
            object_sz: None,
            request_cachable: true,
            swapout_offset: 0,
            reply: StoredReply::default(),
        }
    }

    /// Object offset one past the last byte in the window.
    fn end_offset(&self) -> u64 {
        self.inmem_lo + self.window.len() as u64
    }

    /// Copies up to `max` bytes starting at object offset `offset` into
    /// `dst`, returning how many were available.
    fn copy(&self, offset: u64, dst: &mut BytesMut, max: usize) -> usize {
        debug_assert!(offset >= self.inmem_lo);
        let start = (offset - self.inmem_lo) as usize;
        if start >= self.window.len() {
            return 0;
        }
        let n = max.min(self.window.len() - start);
        dst.clear();
        dst.extend_from_slice(&self.window[start..start + n]);
        n
    }
}

/// The mutable half of a store entry.
struct EntryInner {
    /// Memory-resident state; dropped when the entry is purged from memory.
    mem: Option<MemObject>,
    /// Producer progress.
    store_status: StoreStatus,
    /// Swap-out progress.
    swap_state: SwapState,
    /// Swap file number, once assigned.
    swap_filen: Option<u32>,
    /// Size of the swap file, metadata prefix included.
    swap_file_sz: u64,
    /// Status bits.
    flags: EntryFlags,
    /// How many clients have ever attached.
    refcount: u32,
    /// Outstanding locks held by transactions.
    lock_count: u32,
}

/// One cacheable response, shared among its readers and its producer.
pub struct StoreEntry {
    /// SHA-256 of the URL; the entry's identity in the index and on disk.
    key: [u8; 32],
    /// Self-handle for re-driving readers from producer-side methods.
    weak_self: Weak<StoreEntry>,
    /// The mutable state.
    inner: RefCell<EntryInner>,
}

impl StoreEntry {
    /// Creates a fresh `Pending` entry for `url` with memory state attached.
    pub fn new(url: impl Into<String>) -> Rc<Self> {
        let url = url.into();
        let mut key = [0u8; 32];
        key.copy_from_slice(&Sha256::digest(url.as_bytes()));

        Rc::new_cyclic(|weak_self| Self {
            key,
            weak_self: weak_self.clone(),
            inner: RefCell::new(EntryInner {
                mem: Some(MemObject::new(url)),
                store_status: StoreStatus::Pending,
                swap_state: SwapState::None,
                swap_filen: None,
                swap_file_sz: 0,
                flags: EntryFlags::default(),
                refcount: 0,
                lock_count: 0,
            }),
        })
    }

    /// Resurrects a completed entry from the cache index.
    ///
    /// The object lives entirely in its swap file; its length stays
    /// unknown until the swap header has been read and measured against
    /// the file size.
    pub fn new_from_index(url: impl Into<String>, swap_filen: u32, swap_file_sz: u64) -> Rc<Self> {
        let entry = Self::new(url);
        {
            let mut inner = entry.inner.borrow_mut();
            inner.store_status = StoreStatus::Complete;
            inner.swap_state = SwapState::Done;
            inner.swap_filen = Some(swap_filen);
            inner.swap_file_sz = swap_file_sz;
        }
        entry
    }

    /// The entry's key.
    pub fn key(&self) -> [u8; 32] {
        self.key
    }

    /// The entry's key as hex text, for logs.
    pub fn key_hex(&self) -> String {
        hex::encode(self.key)
    }

    /// The URL of the entry, while memory state is attached.
    pub fn url(&self) -> Option<String> {
        self.inner.borrow().mem.as_ref().map(|mem| mem.url.clone())
    }

    /// Producer progress.
    pub fn store_status(&self) -> StoreStatus {
        self.inner.borrow().store_status
    }

    /// Swap-out progress.
    pub fn swap_state(&self) -> SwapState {
        self.inner.borrow().swap_state
    }

    /// Status bits.
    pub fn flags(&self) -> EntryFlags {
        self.inner.borrow().flags
    }

    /// The swap file number, once assigned.
    pub fn swap_filen(&self) -> Option<u32> {
        self.inner.borrow().swap_filen
    }

    /// Size of the swap file, metadata prefix included.
    pub fn swap_file_sz(&self) -> u64 {
        self.inner.borrow().swap_file_sz
    }

    /// How many clients have ever attached.
    pub fn refcount(&self) -> u32 {
        self.inner.borrow().refcount
    }

    /// Outstanding lock count.
    pub fn lock_count(&self) -> u32 {
        self.inner.borrow().lock_count
    }

    /// Takes a lock on the entry.
    pub fn lock(&self) {
        self.inner.borrow_mut().lock_count += 1;
    }

    /// Releases one lock on the entry.
    pub fn unlock(&self) {
        let mut inner = self.inner.borrow_mut();
        assert!(inner.lock_count > 0, "unlock without a lock");
        inner.lock_count -= 1;
    }

    /// Whether memory state is attached.
    pub fn has_mem(&self) -> bool {
        self.inner.borrow().mem.is_some()
    }

    /// The number of currently registered clients.
    pub fn nclients(&self) -> usize {
        self.inner
            .borrow()
            .mem
            .as_ref()
            .map_or(0, |mem| mem.clients.len())
    }

    /// The number of clients a still-pending fetch is feeding.
    ///
    /// Zero once the entry has been purged from memory.
    pub fn pending_nclients(&self) -> usize {
        self.nclients()
    }

    /// Object offset of the first byte in the memory window.
    pub fn inmem_lo(&self) -> u64 {
        self.with_mem(|mem| mem.inmem_lo)
    }

    /// Object offset one past the last byte in the memory window.
    pub fn end_offset(&self) -> u64 {
        self.with_mem(|mem| mem.end_offset())
    }

    /// The descriptor sentinel for the entry's first client.
    pub fn fd(&self) -> i32 {
        self.with_mem(|mem| mem.fd)
    }

    /// Sets the descriptor sentinel for the entry's first client.
    pub fn set_fd(&self, fd: i32) {
        self.with_mem_mut(|mem| mem.fd = fd);
    }

    /// Whether the originating request allows caching.
    pub fn request_cachable(&self) -> bool {
        self.with_mem(|mem| mem.request_cachable)
    }

    /// Marks whether the originating request allows caching.
    pub fn set_request_cachable(&self, cachable: bool) {
        self.with_mem_mut(|mem| mem.request_cachable = cachable);
    }

    /// Size of the swap file's metadata prefix, `0` until known.
    pub fn swap_hdr_sz(&self) -> u64 {
        self.with_mem(|mem| mem.swap_hdr_sz)
    }

    /// How far the swap-out has committed to disk.
    pub fn swapout_offset(&self) -> u64 {
        self.with_mem(|mem| mem.swapout_offset)
    }

    /// The total object length, headers included, if known.
    ///
    /// Known once the producer finished, or once a swap-in has measured
    /// the object against its metadata prefix; otherwise derived from the
    /// parsed reply of a completed entry.
    pub fn object_len(&self) -> Option<u64> {
        let inner = self.inner.borrow();
        let mem = inner.mem.as_ref()?;
        if let Some(len) = mem.object_sz {
            return Some(len);
        }
        if inner.store_status == StoreStatus::Complete {
            return mem.reply.expected_len().and_then(|len| u64::try_from(len).ok());
        }
        None
    }

    /// Picks how a new client will read this entry.
    ///
    /// Once part of the object has been trimmed from the memory window, or
    /// a finished object is not fully resident, readers must go to disk.
    pub fn store_client_type(&self) -> StoreClientKind {
        let inner = self.inner.borrow();
        let mem = inner.mem.as_ref().expect("entry has memory state");
        if mem.inmem_lo > 0 {
            return StoreClientKind::Disk;
        }
        if inner.store_status == StoreStatus::Complete {
            drop(inner);
            return match self.object_len() {
                Some(len) if self.end_offset() >= len => StoreClientKind::Memory,
                _ => StoreClientKind::Disk,
            };
        }
        StoreClientKind::Memory
    }

    /// Whether the entry can still be swapped out by its producer.
    pub(crate) fn swap_out_able(&self) -> bool {
        self.inner.borrow().swap_state == SwapState::Writing
    }

    /// Appends producer bytes to the memory window.
    ///
    /// The producer signals readers separately via [`invoke_handlers`];
    /// appending alone wakes nobody.
    pub fn append(&self, bytes: &[u8]) {
        self.with_mem_mut(|mem| mem.window.extend_from_slice(bytes));
        debug!(
            key = self.key_hex(),
            len = bytes.len(),
            end = self.end_offset(),
            "appended producer bytes"
        );
    }

    /// Marks the producer finished and fixes the object length.
    pub fn complete(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.store_status = StoreStatus::Complete;
        if let Some(mem) = inner.mem.as_mut() {
            if mem.object_sz.is_none() {
                mem.object_sz = Some(mem.end_offset());
            }
        }
    }

    /// Aborts the fetch: flags the entry, finishes it at its current
    /// length, and re-drives any remaining readers so they observe EOF.
    pub fn abort(&self) {
        debug!(key = self.key_hex(), "aborting entry");
        {
            let mut inner = self.inner.borrow_mut();
            inner.flags.aborted = true;
            inner.store_status = StoreStatus::Complete;
            if let Some(mem) = inner.mem.as_mut() {
                if mem.object_sz.is_none() {
                    mem.object_sz = Some(mem.end_offset());
                }
            }
        }
        if let Some(entry) = self.weak_self.upgrade() {
            invoke_handlers(&entry);
        }
    }

    /// Links the entry to its swap file.
    pub fn set_swap_file(&self, filen: u32, size: u64) {
        let mut inner = self.inner.borrow_mut();
        inner.swap_filen = Some(filen);
        inner.swap_file_sz = size;
    }

    /// Updates swap-out progress.
    pub fn set_swap_state(&self, state: SwapState) {
        self.inner.borrow_mut().swap_state = state;
    }

    /// Marks that the producer is (or is no longer) assembling headers.
    pub fn set_fwd_headers_wait(&self, wait: bool) {
        self.inner.borrow_mut().flags.fwd_headers_wait = wait;
    }

    /// Marks the entry key private.
    pub fn set_key_private(&self, private: bool) {
        self.inner.borrow_mut().flags.key_private = private;
    }

    /// Marks the entry as an internal object exempt from quick-abort.
    pub fn set_special(&self, special: bool) {
        self.inner.borrow_mut().flags.special = special;
    }

    /// Commits what the window holds to the swap file.
    ///
    /// The writer itself lives outside this subsystem; the hook only
    /// advances the committed offset while a swap-out is active.
    pub fn swap_out(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.swap_state != SwapState::Writing {
            return;
        }
        if let Some(mem) = inner.mem.as_mut() {
            mem.swapout_offset = mem.end_offset();
        }
    }

    /// Drops window bytes below `new_lo`.
    ///
    /// The producer calls this to cap memory usage once every reader is
    /// past the trimmed range (see [`lowest_mem_reader_offset`]).
    ///
    /// [`lowest_mem_reader_offset`]: StoreEntry::lowest_mem_reader_offset
    pub fn trim_memory(&self, new_lo: u64) {
        self.with_mem_mut(|mem| {
            if new_lo <= mem.inmem_lo {
                return;
            }
            let n = ((new_lo - mem.inmem_lo) as usize).min(mem.window.len());
            mem.window.advance(n);
            mem.inmem_lo += n as u64;
        });
    }

    /// Purges the memory state entirely.
    pub fn release_mem(&self) {
        self.inner.borrow_mut().mem = None;
    }

    /// The lowest offset any registered memory reader still wants.
    ///
    /// The producer must not trim the window above this.
    pub fn lowest_mem_reader_offset(&self) -> u64 {
        let clients = self.client_snapshot();
        let mut lowest = self.end_offset();
        for client in clients.iter().filter_map(Weak::upgrade) {
            if client.mem_reader_has_lower_offset(lowest) {
                lowest = client.copy_offset();
            }
        }
        lowest
    }

    /// Sets the entry's reply metadata directly (producer side).
    pub fn set_reply(&self, reply: StoredReply) {
        self.with_mem_mut(|mem| mem.reply = reply);
    }

    /// A snapshot of the entry's reply metadata.
    pub fn reply(&self) -> StoredReply {
        self.with_mem(|mem| mem.reply.clone())
    }

    /// The expected total object length from the parsed reply, if any.
    pub(crate) fn expected_len(&self) -> Option<i64> {
        self.with_mem(|mem| mem.reply.expected_len())
    }

    /// Whether the reply has a status yet.
    pub(crate) fn reply_parsed(&self) -> bool {
        self.with_mem(|mem| mem.reply.status.is_some())
    }

    /// Best-effort reply reconstruction from stored bytes.
    ///
    /// A disk hit delivers the serialized reply as object bytes; when the
    /// in-memory reply was never populated, parse it back out so the rest
    /// of the proxy sees status and headers. Failure is logged and
    /// otherwise ignored.
    pub(crate) fn repopulate_reply(&self, buf: &[u8]) {
        let Some(end) = headers_end(buf) else {
            warn!(
                key = self.key_hex(),
                "could not parse headers from on-disk object"
            );
            return;
        };
        let mut inner = self.inner.borrow_mut();
        let Some(mem) = inner.mem.as_mut() else {
            return;
        };
        if let Err(e) = mem.reply.parse(&buf[..end]) {
            warn!(
                key = self.key_hex(),
                error = %e,
                "could not parse headers from on-disk object"
            );
        }
    }

    /// Records the swap header size measured by a swap-in and derives the
    /// object length from the swap file size.
    ///
    /// A swap file still being written has no authoritative size yet, so
    /// the object length stays unknown until the producer finishes.
    pub(crate) fn set_swap_meta(&self, hdr_sz: u64) {
        let mut inner = self.inner.borrow_mut();
        let swap_file_sz = inner.swap_file_sz;
        let complete = inner.store_status == StoreStatus::Complete;
        if let Some(mem) = inner.mem.as_mut() {
            mem.swap_hdr_sz = hdr_sz;
            if complete && swap_file_sz >= hdr_sz {
                mem.object_sz = Some(swap_file_sz - hdr_sz);
            }
        }
    }

    /// Copies up to `max` window bytes at `offset` into `dst`.
    pub(crate) fn mem_copy(&self, offset: u64, dst: &mut BytesMut, max: usize) -> usize {
        self.with_mem(|mem| mem.copy(offset, dst, max))
    }

    /// Links a new client into the client list.
    pub(crate) fn add_client(&self, client: &Rc<StoreClient>) {
        let mut inner = self.inner.borrow_mut();
        inner.refcount += 1;
        inner
            .mem
            .as_mut()
            .expect("entry has memory state")
            .clients
            .push(Rc::downgrade(client));
    }

    /// Unlinks a client from the client list.
    ///
    /// Returns `false` when the client was not on the list. Removing the
    /// first client also resets the descriptor sentinel.
    pub(crate) fn remove_client(&self, client: &StoreClient) -> bool {
        let mut inner = self.inner.borrow_mut();
        let Some(mem) = inner.mem.as_mut() else {
            return false;
        };
        let Some(index) = mem
            .clients
            .iter()
            .position(|w| w.as_ptr() == std::ptr::from_ref(client))
        else {
            return false;
        };
        if index == 0 {
            mem.fd = -1;
        }
        mem.clients.remove(index);
        true
    }

    /// A snapshot of the client list for safe iteration.
    ///
    /// The copy engine may unregister clients (or register new ones) while
    /// the caller walks the list; iterating a snapshot visits each client
    /// at most once.
    pub(crate) fn client_snapshot(&self) -> Vec<Weak<StoreClient>> {
        self.inner
            .borrow()
            .mem
            .as_ref()
            .map_or_else(Vec::new, |mem| mem.clients.clone())
    }

    /// Runs `f` against the memory state.
    fn with_mem<R>(&self, f: impl FnOnce(&MemObject) -> R) -> R {
        f(self
            .inner
            .borrow()
            .mem
            .as_ref()
            .expect("entry has memory state"))
    }

    /// Runs `f` against the mutable memory state.
    fn with_mem_mut<R>(&self, f: impl FnOnce(&mut MemObject) -> R) -> R {
        f(self
            .inner
            .borrow_mut()
            .mem
            .as_mut()
            .expect("entry has memory state"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_arithmetic() {
        let entry = StoreEntry::new("http://example.com/a");
        assert_eq!(entry.end_offset(), 0);

        entry.append(b"0123456789");
        assert_eq!(entry.inmem_lo(), 0);
        assert_eq!(entry.end_offset(), 10);

        let mut dst = BytesMut::new();
        assert_eq!(entry.mem_copy(4, &mut dst, 3), 3);
        assert_eq!(&dst[..], b"456");

        // Reads past the window see nothing.
        assert_eq!(entry.mem_copy(10, &mut dst, 3), 0);
    }

    #[test]
    fn trim_advances_the_window() {
        let entry = StoreEntry::new("http://example.com/b");
        entry.append(b"0123456789");
        entry.trim_memory(4);

        assert_eq!(entry.inmem_lo(), 4);
        assert_eq!(entry.end_offset(), 10);

        let mut dst = BytesMut::new();
        assert_eq!(entry.mem_copy(4, &mut dst, 2), 2);
        assert_eq!(&dst[..], b"45");

        // Trimming backwards is a no-op.
        entry.trim_memory(2);
        assert_eq!(entry.inmem_lo(), 4);
    }

    #[test]
    fn client_type_follows_residency() {
        let entry = StoreEntry::new("http://example.com/c");
        assert_eq!(entry.store_client_type(), StoreClientKind::Memory);

        entry.append(b"abcdef");
        entry.complete();
        assert_eq!(entry.store_client_type(), StoreClientKind::Memory);

        // A trimmed window forces new readers to disk.
        entry.trim_memory(3);
        assert_eq!(entry.store_client_type(), StoreClientKind::Disk);
    }

    #[test]
    fn client_type_for_a_disk_hit() {
        // A hit resurrected from the index: complete, nothing in memory,
        // length unknown until the swap header is read.
        let entry = StoreEntry::new_from_index("http://example.com/d", 1, 900);
        assert_eq!(entry.object_len(), None);
        assert_eq!(entry.store_client_type(), StoreClientKind::Disk);

        // Measuring the swap header fixes the length.
        entry.set_swap_meta(20);
        assert_eq!(entry.object_len(), Some(880));
        assert_eq!(entry.store_client_type(), StoreClientKind::Disk);
    }

    #[test]
    fn object_len_falls_back_to_the_reply() {
        let entry = StoreEntry::new("http://example.com/e");
        assert_eq!(entry.object_len(), None);

        let mut reply = StoredReply::default();
        reply
            .parse(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n")
            .unwrap();
        let hdr_sz = reply.hdr_sz as u64;
        entry.set_reply(reply);

        // Still pending: the reply alone proves nothing.
        assert_eq!(entry.object_len(), None);

        entry.inner.borrow_mut().store_status = StoreStatus::Complete;
        assert_eq!(entry.object_len(), Some(100 + hdr_sz));
    }

    #[test]
    fn abort_completes_and_flags() {
        let entry = StoreEntry::new("http://example.com/f");
        entry.append(b"xy");
        entry.abort();

        assert!(entry.flags().aborted);
        assert_eq!(entry.store_status(), StoreStatus::Complete);
        assert_eq!(entry.object_len(), Some(2));
    }
}
