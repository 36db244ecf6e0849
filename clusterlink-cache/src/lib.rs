//! # clusterlink-cache
//!
//! List-then-watch cache synchronization for cluster resource kinds.
//!
//! A [`SyncManager`] owns a [`SharedWatcherFactory`]; [`SyncManager::start`]
//! starts one kind's [`Watcher`] and blocks (bounded) until its cache has
//! completed the initial listing. [`SyncManager::start_all`] is the readiness
//! gate used at bootstrap and yields the read-only [`ResourceRegistry`].
//!
//! The control plane itself sits behind [`ListWatch`]; [`MemoryControlPlane`]
//! is the in-process implementation used by the daemon and by tests.

pub mod error;
pub mod factory;
pub mod informer;
pub mod manager;
pub mod memory;
pub mod registry;
pub mod source;
pub mod sync;
pub mod watcher;

pub use error::{CacheError, SourceError};
pub use factory::SharedWatcherFactory;
pub use informer::{EventHandler, Informer};
pub use manager::SyncManager;
pub use memory::MemoryControlPlane;
pub use registry::ResourceRegistry;
pub use source::{ListSnapshot, ListWatch, WatchStream};
pub use sync::{wait_for_cache_sync, SyncPoll};
pub use watcher::{Backoff, Watcher, WatcherState};
