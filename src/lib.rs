//! The store client subsystem of an HTTP caching proxy.
//!
//! A [`StoreEntry`] is one cacheable response: possibly still arriving from
//! an origin server, possibly fully resident in memory, possibly already
//! paged out to a swap file on disk, or some combination. A [`StoreClient`]
//! is the read-side handle through which one concurrent transaction consumes
//! bytes from that entry.
//!
//! The subsystem delivers bytes from whichever source currently holds them
//! (memory window, swap file, or "not yet arrived") into the caller's
//! buffer, with one outstanding read per client, without blocking the event
//! loop, and with orderly abort semantics when no readers remain.
//!
//! Everything runs on one thread, driven by an external event loop; the
//! crate only requires the ability to enqueue a zero-delay callback (see
//! [`Events`]). Disk reads go through the [`SwapDir`] collaborator; a
//! file-backed default is provided.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::broken_intra_doc_links)]

mod abort;
mod client;
mod config;
mod entry;
mod error;
mod events;
mod meta;
mod reply;
mod store;
pub mod swap;

pub use abort::*;
pub use client::*;
pub use config::*;
pub use entry::*;
pub use error::*;
pub use events::*;
pub use meta::*;
pub use reply::*;
pub use store::*;
pub use swap::SwapDir;
pub use swap::SwapIn;
// Re-export the http crate.
pub use http;
