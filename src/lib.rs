//! Named 64-bit metric cells shared between processes.
//!
//! Metrics are registered by name into a fixed-capacity chained hash set
//! that lives in a memory-mapped span, so every process mapping the same
//! file sees the same counters and a restarted process finds them intact.
//! When shared memory is disabled the same contract is served from the heap.
mod config;
mod entry;
mod error;
mod name;
mod store;

pub mod shm;

#[cfg(not(target_os = "windows"))]
mod shared_store;

#[cfg(target_os = "windows")]
mod shared_store_stub;

pub use config::{StoreConfig, DEFAULT_CAPACITY};
pub use entry::EntryHandle;
pub use error::{Error, Region, Result};
pub use name::{fnv1a, storage_name, MAX_NAME_LEN};
pub use shm::hashset::{AllocResult, HashSet};
pub use store::{HeapStore, MetricsStore};

#[cfg(not(target_os = "windows"))]
pub use shared_store::{SharedStore, SharedStoreInfo};
#[cfg(not(target_os = "windows"))]
pub use shm::ShmZone;

#[cfg(target_os = "windows")]
pub use shared_store_stub::{SharedStore, SharedStoreInfo};

use tracing::info;

/// Open the store a config describes.
pub fn open_store(config: &StoreConfig) -> Result<Box<dyn MetricsStore>> {
    config.validate()?;
    if config.shared {
        return Ok(Box::new(SharedStore::open(config)?));
    }
    let capacity = config.capacity();
    info!(capacity, "shared memory disabled, metrics kept on the heap");
    Ok(Box::new(HeapStore::new(capacity)))
}
