use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::shm::layout::{default_buckets, SegmentLayout, SENTINEL, SPAN_HEADER_SIZE};

pub const DEFAULT_CAPACITY: u32 = 4096;

/// How metric entries are stored.
///
/// ```toml
/// shared = true
/// name = "proxy"          # or: path = "/var/run/proxy/metrics.shm"
/// segment_bytes = 33554432
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Shared memory when true, the process heap otherwise.
    pub shared: bool,
    /// Backing file of the shared region.
    pub path: Option<PathBuf>,
    /// Region name under the platform shm directory. Ignored with `path`.
    pub name: Option<String>,
    pub capacity: u32,
    /// Defaults to half the capacity.
    pub buckets: Option<u32>,
    /// Total mapping size; when set, the capacity is derived from it.
    pub segment_bytes: Option<usize>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            shared: true,
            path: None,
            name: None,
            capacity: DEFAULT_CAPACITY,
            buckets: None,
            segment_bytes: None,
        }
    }
}

impl StoreConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: StoreConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Heap-backed store of the given capacity.
    pub fn heap(capacity: u32) -> Self {
        StoreConfig {
            shared: false,
            capacity,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let capacity = self.capacity();
        if capacity == 0 {
            return Err(match self.segment_bytes {
                Some(bytes) => Error::Config(format!("{bytes} segment bytes hold no entry")),
                None => Error::Config("capacity must be positive".to_string()),
            });
        }
        if capacity >= SENTINEL {
            return Err(Error::Config(format!("capacity {capacity} is too large")));
        }
        if self.buckets == Some(0) {
            return Err(Error::Config("buckets must be positive".to_string()));
        }
        if let Some(name) = &self.name {
            if name.is_empty() || name.contains('/') {
                return Err(Error::Config(format!("invalid region name {name:?}")));
            }
        }
        Ok(())
    }

    /// Entry capacity, derived from `segment_bytes` when that is set.
    pub fn capacity(&self) -> u32 {
        match self.segment_bytes {
            Some(bytes) => SegmentLayout::capacity_for(bytes.saturating_sub(SPAN_HEADER_SIZE)),
            None => self.capacity,
        }
    }

    pub fn bucket_count(&self) -> u32 {
        self.buckets
            .unwrap_or_else(|| default_buckets(self.capacity()))
    }
}
