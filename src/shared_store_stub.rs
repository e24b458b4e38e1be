use crate::config::StoreConfig;
use crate::entry::EntryHandle;
use crate::error::{Error, Result};
use crate::store::MetricsStore;

/// Stub occupancy for Windows (shared backend not supported).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedStoreInfo {
    pub capacity: u32,
    pub buckets: u32,
    pub live: u32,
    pub attached: u32,
}

/// Stub SharedStore for Windows; opening it fails.
pub struct SharedStore {
    _private: (),
}

impl SharedStore {
    pub fn open(_config: &StoreConfig) -> Result<Self> {
        Err(Error::Unsupported)
    }

    pub fn lookup(&self, _name: &[u8]) -> Result<Option<EntryHandle>> {
        Err(Error::Unsupported)
    }

    pub fn snapshot(&self) -> Result<Vec<(Vec<u8>, u64)>> {
        Err(Error::Unsupported)
    }

    pub fn info(&self) -> Result<SharedStoreInfo> {
        Err(Error::Unsupported)
    }
}

impl MetricsStore for SharedStore {
    fn alloc(&self, _name: &[u8]) -> Result<Option<EntryHandle>> {
        Err(Error::Unsupported)
    }

    fn free(&self, _handle: EntryHandle) -> Result<bool> {
        Err(Error::Unsupported)
    }

    fn load(&self, _handle: EntryHandle) -> Result<u64> {
        Err(Error::Unsupported)
    }

    fn store(&self, _handle: EntryHandle, _value: u64) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn fetch_add(&self, _handle: EntryHandle, _delta: u64) -> Result<u64> {
        Err(Error::Unsupported)
    }

    fn len(&self) -> Result<usize> {
        Err(Error::Unsupported)
    }

    fn capacity(&self) -> usize {
        0
    }
}
