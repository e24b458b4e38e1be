use std::path::PathBuf;

use tracing::debug;

use crate::config::StoreConfig;
use crate::entry::EntryHandle;
use crate::error::Result;
use crate::shm::region::shm_dir;
use crate::shm::ShmZone;
use crate::store::MetricsStore;

/// Occupancy of the shared backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedStoreInfo {
    pub capacity: u32,
    pub buckets: u32,
    pub live: u32,
    pub attached: u32,
}

/// Metric entries in a shared-memory zone.
///
/// Every process opening the same path sees the same entries; a restarted
/// process reattaches and finds its counters where it left them.
pub struct SharedStore {
    zone: ShmZone,
}

impl SharedStore {
    pub fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let capacity = config.capacity();
        let buckets = config.bucket_count();

        let zone = match region_path(config) {
            Some(path) => ShmZone::create_or_open(&path, capacity, buckets)?,
            None => {
                debug!(capacity, buckets, "no region path configured, using anonymous mapping");
                ShmZone::anonymous(capacity, buckets)?
            }
        };
        Ok(SharedStore { zone })
    }

    pub fn zone(&self) -> &ShmZone {
        &self.zone
    }

    pub fn lookup(&self, name: &[u8]) -> Result<Option<EntryHandle>> {
        self.zone.lookup(name)
    }

    pub fn snapshot(&self) -> Result<Vec<(Vec<u8>, u64)>> {
        self.zone.snapshot()
    }

    pub fn info(&self) -> Result<SharedStoreInfo> {
        Ok(SharedStoreInfo {
            capacity: self.zone.capacity(),
            buckets: self.zone.bucket_count(),
            live: self.zone.len()?,
            attached: self.zone.attach_count(),
        })
    }
}

impl MetricsStore for SharedStore {
    fn alloc(&self, name: &[u8]) -> Result<Option<EntryHandle>> {
        self.zone.alloc(name)
    }

    fn free(&self, handle: EntryHandle) -> Result<bool> {
        self.zone.free(handle)
    }

    fn load(&self, handle: EntryHandle) -> Result<u64> {
        self.zone.load(handle)
    }

    fn store(&self, handle: EntryHandle, value: u64) -> Result<()> {
        self.zone.store(handle, value)
    }

    fn fetch_add(&self, handle: EntryHandle, delta: u64) -> Result<u64> {
        self.zone.fetch_add(handle, delta)
    }

    fn len(&self) -> Result<usize> {
        Ok(self.zone.len()? as usize)
    }

    fn capacity(&self) -> usize {
        self.zone.capacity() as usize
    }
}

/// Backing file for a config: an explicit path wins over a region name.
pub(crate) fn region_path(config: &StoreConfig) -> Option<PathBuf> {
    if let Some(path) = &config.path {
        return Some(path.clone());
    }
    config
        .name
        .as_ref()
        .map(|name| shm_dir().join(format!("shm_metrics_{name}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn file_config(dir: &tempfile::TempDir, capacity: u32) -> StoreConfig {
        StoreConfig {
            path: Some(dir.path().join("metrics.shm")),
            capacity,
            ..Default::default()
        }
    }

    #[test]
    fn region_path_resolution() {
        let explicit = StoreConfig {
            path: Some(PathBuf::from("/tmp/x.shm")),
            name: Some("ignored".to_string()),
            ..Default::default()
        };
        assert_eq!(region_path(&explicit), Some(PathBuf::from("/tmp/x.shm")));

        let named = StoreConfig {
            name: Some("proxy".to_string()),
            ..Default::default()
        };
        assert_eq!(
            region_path(&named),
            Some(shm_dir().join("shm_metrics_proxy"))
        );

        assert_eq!(region_path(&StoreConfig::default()), None);
    }

    #[test]
    fn two_stores_on_one_path_share_entries() {
        let dir = tempfile::tempdir().unwrap();
        let config = file_config(&dir, 16);

        let a = SharedStore::open(&config).unwrap();
        let b = SharedStore::open(&config).unwrap();

        let ha = a.alloc(b"listener_cx").unwrap().unwrap();
        let hb = b.alloc(b"listener_cx").unwrap().unwrap();
        assert_eq!(ha, hb);

        b.fetch_add(hb, 9).unwrap();
        assert_eq!(a.load(ha).unwrap(), 9);

        let info = a.info().unwrap();
        assert_eq!(
            info,
            SharedStoreInfo {
                capacity: 16,
                buckets: 8,
                live: 1,
                attached: 2,
            }
        );
    }

    #[test]
    fn anonymous_store_through_trait_object() {
        let store: Box<dyn MetricsStore> =
            Box::new(SharedStore::open(&StoreConfig::default()).unwrap());
        let h = store.alloc(b"uptime").unwrap().unwrap();
        store.store(h, 3).unwrap();
        assert_eq!(store.load(h).unwrap(), 3);
        assert!(store.free(h).unwrap());
        assert!(store.is_empty().unwrap());
        assert_eq!(store.capacity(), 4096);
    }

    #[test]
    fn live_shape_mismatch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let _held = SharedStore::open(&file_config(&dir, 16)).unwrap();
        assert!(matches!(
            SharedStore::open(&file_config(&dir, 32)),
            Err(Error::LayoutMismatch { .. })
        ));
    }
}
