//! Swap-in access to spooled objects.
//!
//! A [`SwapDir`] opens read handles onto the swap files a cache has
//! spooled to disk; a [`SwapIn`] is one such handle, owned by a single
//! store client for its lifetime. Reads are positioned and asynchronous:
//! the completion callback runs later, at the top level of the event loop,
//! and must tolerate its client having disappeared in the meantime.

use std::cell::Cell;
use std::fs::File;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use bytes::BytesMut;
use tracing::debug;

use crate::entry::StoreEntry;
use crate::events::Events;

/// Completion for a positioned swap-in read.
///
/// On success the buffer holds the bytes read (short at end of file); on
/// error the buffer is lost with the failed read.
pub type ReadCompletion = Box<dyn FnOnce(io::Result<BytesMut>)>;

/// An open swap-in handle.
///
/// Dropping the handle closes it.
pub trait SwapIn {
    /// Reads up to `len` bytes at `offset` into `buf`, then hands `buf`
    /// back through `completion` at the top level of the event loop.
    fn read(&self, buf: BytesMut, offset: u64, len: usize, completion: ReadCompletion);
}

/// A source of swap-in handles.
pub trait SwapDir {
    /// Opens a swap-in handle for `entry`.
    fn open(&self, entry: &StoreEntry) -> Result<Rc<dyn SwapIn>>;

    /// The number of handles currently open.
    fn open_handles(&self) -> usize;
}

/// A swap directory backed by plain files.
///
/// Objects are stored one file per swap file number, named by the number
/// in hex, directly under a root directory. Reads are performed eagerly
/// and their completions delivered through the event scheduler, so the
/// caller only ever observes an asynchronous interface.
pub struct FileSwapDir {
    /// The directory holding the swap files.
    root: PathBuf,
    /// Scheduler used to defer read completions.
    events: Rc<dyn Events>,
    /// Open-handle count, shared with the handles themselves.
    open: Rc<Cell<usize>>,
}

impl FileSwapDir {
    /// Creates a swap directory rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, events: Rc<dyn Events>) -> Self {
        Self {
            root: root.into(),
            events,
            open: Rc::new(Cell::new(0)),
        }
    }

    /// The path of the swap file numbered `filen`.
    pub fn swap_path(&self, filen: u32) -> PathBuf {
        self.root.join(format!("{filen:08x}"))
    }
}

impl SwapDir for FileSwapDir {
    fn open(&self, entry: &StoreEntry) -> Result<Rc<dyn SwapIn>> {
        let Some(filen) = entry.swap_filen() else {
            bail!(
                "entry `{key}` has no swap file to open",
                key = entry.key_hex()
            );
        };

        let path = self.swap_path(filen);
        let file = File::open(&path).with_context(|| {
            format!(
                "failed to open swap file `{path}`",
                path = path.display()
            )
        })?;

        debug!(
            key = entry.key_hex(),
            path = %path.display(),
            "opened swap-in handle"
        );
        self.open.set(self.open.get() + 1);
        Ok(Rc::new(FileSwapIn {
            file,
            events: Rc::clone(&self.events),
            open: Rc::clone(&self.open),
        }))
    }

    fn open_handles(&self) -> usize {
        self.open.get()
    }
}

/// A swap-in handle onto one file.
struct FileSwapIn {
    /// The open swap file.
    file: File,
    /// Scheduler used to defer the completion.
    events: Rc<dyn Events>,
    /// The swap directory's open-handle count.
    open: Rc<Cell<usize>>,
}

impl FileSwapIn {
    /// Performs the positioned read, tolerating short reads at the end of
    /// the file.
    fn read_at(&self, buf: &mut BytesMut, offset: u64, len: usize) -> io::Result<()> {
        buf.clear();
        buf.resize(len, 0);

        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;
        while filled < len {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(filled);
        Ok(())
    }
}

impl SwapIn for FileSwapIn {
    fn read(&self, mut buf: BytesMut, offset: u64, len: usize, completion: ReadCompletion) {
        let result = self.read_at(&mut buf, offset, len).map(|()| buf);
        self.events
            .schedule("swap-in read completion", Box::new(move || completion(result)));
    }
}

impl Drop for FileSwapIn {
    fn drop(&mut self) {
        self.open.set(self.open.get() - 1);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::fs;

    use super::*;
    use crate::events::EventQueue;

    /// Collects one read completion for inspection.
    fn capture() -> (Rc<RefCell<Option<io::Result<BytesMut>>>>, ReadCompletion) {
        let slot = Rc::new(RefCell::new(None));
        let inner = Rc::clone(&slot);
        (slot, Box::new(move |result| *inner.borrow_mut() = Some(result)))
    }

    #[test]
    fn reads_are_positioned_and_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let events = Rc::new(EventQueue::new());
        let swap = FileSwapDir::new(dir.path(), Rc::clone(&events) as Rc<dyn Events>);

        let entry = StoreEntry::new_from_index("http://example.com/a", 42, 10);
        fs::write(swap.swap_path(42), b"0123456789").unwrap();

        let handle = swap.open(&entry).unwrap();
        assert_eq!(swap.open_handles(), 1);

        let (slot, completion) = capture();
        handle.read(BytesMut::new(), 2, 4, completion);

        // Nothing happens until the loop runs.
        assert!(slot.borrow().is_none());
        events.run_pending();

        let buf = slot.borrow_mut().take().unwrap().unwrap();
        assert_eq!(&buf[..], b"2345");
    }

    #[test]
    fn short_read_at_end_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let events = Rc::new(EventQueue::new());
        let swap = FileSwapDir::new(dir.path(), Rc::clone(&events) as Rc<dyn Events>);

        let entry = StoreEntry::new_from_index("http://example.com/b", 7, 6);
        fs::write(swap.swap_path(7), b"abcdef").unwrap();

        let handle = swap.open(&entry).unwrap();
        let (slot, completion) = capture();
        handle.read(BytesMut::new(), 4, 100, completion);
        events.run_pending();

        let buf = slot.borrow_mut().take().unwrap().unwrap();
        assert_eq!(&buf[..], b"ef");
    }

    #[test]
    fn missing_swap_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let events = Rc::new(EventQueue::new());
        let swap = FileSwapDir::new(dir.path(), Rc::clone(&events) as Rc<dyn Events>);

        let entry = StoreEntry::new_from_index("http://example.com/c", 9, 1);
        assert!(swap.open(&entry).is_err());
        assert_eq!(swap.open_handles(), 0);
    }

    #[test]
    fn entry_without_swap_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let events = Rc::new(EventQueue::new());
        let swap = FileSwapDir::new(dir.path(), Rc::clone(&events) as Rc<dyn Events>);

        let entry = StoreEntry::new("http://example.com/d");
        assert!(swap.open(&entry).is_err());
    }

    #[test]
    fn dropping_a_handle_closes_it() {
        let dir = tempfile::tempdir().unwrap();
        let events = Rc::new(EventQueue::new());
        let swap = FileSwapDir::new(dir.path(), Rc::clone(&events) as Rc<dyn Events>);

        let entry = StoreEntry::new_from_index("http://example.com/e", 3, 2);
        fs::write(swap.swap_path(3), b"xy").unwrap();

        let first = swap.open(&entry).unwrap();
        let second = swap.open(&entry).unwrap();
        assert_eq!(swap.open_handles(), 2);

        drop(first);
        assert_eq!(swap.open_handles(), 1);
        drop(second);
        assert_eq!(swap.open_handles(), 0);
    }
}
