//! Lock-guarded access to one mapped hash set.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

use crate::entry::EntryHandle;
use crate::error::{Error, Result};
use super::hashset::{AllocResult, HashSet};
use super::layout::EntryRecord;
use super::region::ShmRegion;

/// A mapped region plus the hash set inside it.
///
/// Multiple processes sharing the same file each hold their own `ShmZone`
/// pointing at the same mapping.
pub struct ShmZone {
    region: ShmRegion,
    capacity: u32,
    buckets: u32,
}

impl ShmZone {
    /// Attach to `path` if it already holds a zone of this shape (keeping
    /// every registered metric and its value), otherwise create one.
    pub fn create_or_open(path: &Path, capacity: u32, buckets: u32) -> Result<Self> {
        let (region, _) = ShmRegion::create_or_open(path, capacity, buckets)?;
        Self::from_region(region)
    }

    /// Attach to an existing zone, taking its shape from the file.
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_region(ShmRegion::open(path)?)
    }

    /// A zone on an anonymous mapping, private to this process.
    pub fn anonymous(capacity: u32, buckets: u32) -> Result<Self> {
        Self::from_region(ShmRegion::anonymous(capacity, buckets)?)
    }

    /// Lay out the hash set unless someone already did, then attach.
    ///
    /// The check runs under the span lock, so of several first openers one
    /// initializes and the rest attach; a creator that died before
    /// initializing leaves the job to the next opener.
    fn from_region(region: ShmRegion) -> Result<Self> {
        let capacity = region.header().capacity;
        let buckets = region.header().buckets;

        {
            let lock = region.lock();
            let _guard = lock.lock();
            let fresh = !region.is_initialized();
            // SAFETY: the span lock is held for the life of the set; with
            // `fresh` no handle to this span exists yet.
            let set = unsafe {
                HashSet::from_raw(
                    region.segment_ptr(),
                    region.segment_len(),
                    capacity,
                    buckets,
                    fresh,
                )?
            };
            if fresh {
                region.mark_initialized();
            }
            info!(
                capacity,
                buckets,
                live = set.len(),
                initialized = fresh,
                "opened shared metrics zone"
            );
        }

        region.attach();
        Ok(ShmZone {
            region,
            capacity,
            buckets,
        })
    }

    /// Run `f` on the hash set with the span lock held.
    fn with_set<R>(&self, f: impl FnOnce(&mut HashSet<'_>) -> Result<R>) -> Result<R> {
        let lock = self.region.lock();
        let _guard = lock.lock();
        // SAFETY: the span lock is held for the life of the set; lock-free
        // readers only touch `value` and `generation`, atomically.
        let mut set = unsafe {
            HashSet::from_raw(
                self.region.segment_ptr(),
                self.region.segment_len(),
                self.capacity,
                self.buckets,
                false,
            )?
        };
        f(&mut set)
    }

    /// Register one owner of `name`, creating the entry on first use.
    ///
    /// `Ok(None)` means the zone is full; the metric cannot be registered
    /// until another one is released.
    pub fn alloc(&self, name: &[u8]) -> Result<Option<EntryHandle>> {
        self.with_set(|set| match set.alloc(name)? {
            AllocResult::Created(handle) => Ok(Some(handle)),
            AllocResult::Found(handle) => {
                set.retain(handle)?;
                Ok(Some(handle))
            }
            AllocResult::Exhausted => {
                debug!(
                    capacity = set.capacity(),
                    name = %String::from_utf8_lossy(name),
                    "shared metrics zone is full"
                );
                Ok(None)
            }
        })
    }

    /// Release one owner. `Ok(true)` when the entry was removed.
    pub fn free(&self, handle: EntryHandle) -> Result<bool> {
        self.with_set(|set| set.free(handle))
    }

    pub fn lookup(&self, name: &[u8]) -> Result<Option<EntryHandle>> {
        self.with_set(|set| set.lookup(name))
    }

    pub fn ref_count(&self, handle: EntryHandle) -> Result<u32> {
        self.with_set(|set| set.ref_count(handle))
    }

    /// Number of live entries.
    pub fn len(&self) -> Result<u32> {
        self.with_set(|set| Ok(set.len()))
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn bucket_count(&self) -> u32 {
        self.buckets
    }

    /// Every live `(name, value)` pair, in slot order.
    pub fn snapshot(&self) -> Result<Vec<(Vec<u8>, u64)>> {
        self.with_set(|set| {
            Ok(set
                .live_entries()
                .map(|(_, e)| (e.name().to_vec(), e.body.value.load(Ordering::Relaxed)))
                .collect())
        })
    }

    pub fn load(&self, handle: EntryHandle) -> Result<u64> {
        Ok(self.value_cell(handle)?.load(Ordering::Relaxed))
    }

    pub fn store(&self, handle: EntryHandle, value: u64) -> Result<()> {
        self.value_cell(handle)?.store(value, Ordering::Relaxed);
        Ok(())
    }

    /// Add to the cell, wrapping. Returns the previous value.
    pub fn fetch_add(&self, handle: EntryHandle, delta: u64) -> Result<u64> {
        Ok(self.value_cell(handle)?.fetch_add(delta, Ordering::Relaxed))
    }

    /// The value cell of a current handle, reached without the span lock.
    ///
    /// Records are only ever borrowed shared, and only the atomic `value`
    /// and `generation` are read here, so this never races the lock holder.
    fn value_cell(&self, handle: EntryHandle) -> Result<&AtomicU64> {
        if handle.index >= self.capacity {
            return Err(Error::InvalidHandle {
                index: handle.index,
                generation: handle.generation,
            });
        }

        // SAFETY: index < capacity, so the record lies inside the entry array
        // of an initialized span.
        let record = unsafe {
            &*(self
                .region
                .segment_ptr()
                .add(handle.index as usize * EntryRecord::SIZE) as *const EntryRecord)
        };

        if record.generation() != handle.generation {
            return Err(Error::InvalidHandle {
                index: handle.index,
                generation: handle.generation,
            });
        }
        Ok(&record.body.value)
    }

    /// Processes (zones) currently attached to the span.
    pub fn attach_count(&self) -> u32 {
        self.region.attach_count()
    }

    pub fn path(&self) -> Option<&Path> {
        self.region.path()
    }

    pub fn flush(&self) -> Result<()> {
        self.region.flush()
    }
}

impl Drop for ShmZone {
    fn drop(&mut self) {
        let remaining = self.region.detach();
        debug!(remaining, "detached from shared metrics zone");
    }
}
