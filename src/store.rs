//! The shared store context.

use std::cell::Cell;
use std::rc::Rc;

use crate::config::StoreConfig;
use crate::events::Events;
use crate::swap::SwapDir;

/// Counters the store accumulates for introspection.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreCounters {
    /// Swap-in handles closed after serving a client.
    pub swap_ins: u64,
}

/// Shared context for every store client: the swap directory, the event
/// scheduler, configuration, and counters.
pub struct Store {
    /// Source of swap-in handles.
    swap_dir: Rc<dyn SwapDir>,
    /// Zero-delay event scheduler.
    events: Rc<dyn Events>,
    /// Runtime configuration.
    config: StoreConfig,
    /// Accumulated counters.
    counters: Cell<StoreCounters>,
}

impl Store {
    /// Constructs a store context.
    pub fn new(swap_dir: Rc<dyn SwapDir>, events: Rc<dyn Events>, config: StoreConfig) -> Rc<Self> {
        Rc::new(Self {
            swap_dir,
            events,
            config,
            counters: Cell::new(StoreCounters::default()),
        })
    }

    /// The swap directory.
    pub fn swap_dir(&self) -> &Rc<dyn SwapDir> {
        &self.swap_dir
    }

    /// The event scheduler.
    pub fn events(&self) -> &Rc<dyn Events> {
        &self.events
    }

    /// The runtime configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// A snapshot of the counters.
    pub fn counters(&self) -> StoreCounters {
        self.counters.get()
    }

    /// Whether opening one more swap-in handle would exceed the ceiling.
    pub fn too_many_disk_files_open(&self) -> bool {
        self.config
            .max_open_disk_files
            .is_some_and(|limit| self.swap_dir.open_handles() >= limit)
    }

    /// Records a swap-in handle retired after serving a client.
    pub(crate) fn count_swap_in(&self) {
        let mut counters = self.counters.get();
        counters.swap_ins += 1;
        self.counters.set(counters);
    }
}
