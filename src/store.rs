use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::entry::EntryHandle;
use crate::error::{Error, Result};
use crate::name::storage_name;

/// Registration contract shared by the shared-memory and heap backends.
///
/// `alloc` registers one owner of a name (creating the entry on first use)
/// and returns `Ok(None)` when the store is full. `free` drops one owner
/// and reports whether the entry was removed. Value accessors work on the
/// entry's 64-bit cell and reject stale handles.
pub trait MetricsStore: Send + Sync {
    fn alloc(&self, name: &[u8]) -> Result<Option<EntryHandle>>;
    fn free(&self, handle: EntryHandle) -> Result<bool>;
    fn load(&self, handle: EntryHandle) -> Result<u64>;
    fn store(&self, handle: EntryHandle, value: u64) -> Result<()>;
    fn fetch_add(&self, handle: EntryHandle, delta: u64) -> Result<u64>;
    fn len(&self) -> Result<usize>;
    fn capacity(&self) -> usize;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

struct Cell {
    value: AtomicU64,
    generation: AtomicU32,
}

/// Name index of the heap store. Slot vectors are all `capacity` long.
struct HeapIndex {
    by_name: HashMap<Box<[u8]>, u32, RandomState>,
    names: Vec<Option<Box<[u8]>>>,
    refs: Vec<u32>,
    free: Vec<u32>,
}

/// In-process store with the same contract as the shared one, used when
/// shared memory is disabled. Nothing survives the process.
pub struct HeapStore {
    cells: Box<[Cell]>,
    index: Mutex<HeapIndex>,
}

impl HeapStore {
    pub fn new(capacity: u32) -> Self {
        let cells = (0..capacity)
            .map(|_| Cell {
                value: AtomicU64::new(0),
                generation: AtomicU32::new(0),
            })
            .collect();
        HeapStore {
            cells,
            index: Mutex::new(HeapIndex {
                by_name: HashMap::with_capacity_and_hasher(capacity as usize, RandomState::new()),
                names: vec![None; capacity as usize],
                refs: vec![0; capacity as usize],
                // popped from the back: slot 0 first, freed slots reused LIFO
                free: (0..capacity).rev().collect(),
            }),
        }
    }

    pub fn lookup(&self, name: &[u8]) -> Option<EntryHandle> {
        let stored = storage_name(name);
        let index = self.index.lock();
        index
            .by_name
            .get(&*stored)
            .map(|&i| EntryHandle::new(i, self.cells[i as usize].generation.load(Ordering::Acquire)))
    }

    /// The cell of a current handle.
    fn cell(&self, handle: EntryHandle) -> Result<&Cell> {
        match self.cells.get(handle.index as usize) {
            Some(cell) if cell.generation.load(Ordering::Acquire) == handle.generation => Ok(cell),
            _ => Err(invalid(handle)),
        }
    }
}

impl MetricsStore for HeapStore {
    fn alloc(&self, name: &[u8]) -> Result<Option<EntryHandle>> {
        let stored = storage_name(name);
        let mut index = self.index.lock();

        if let Some(&i) = index.by_name.get(&*stored) {
            let refs = &mut index.refs[i as usize];
            *refs = refs
                .checked_add(1)
                .ok_or(Error::Corrupted("reference count overflow"))?;
            let generation = self.cells[i as usize].generation.load(Ordering::Acquire);
            return Ok(Some(EntryHandle::new(i, generation)));
        }

        let Some(i) = index.free.pop() else {
            debug!(
                capacity = self.cells.len(),
                name = %String::from_utf8_lossy(name),
                "heap metrics store is full"
            );
            return Ok(None);
        };

        let key: Box<[u8]> = stored.into_owned().into_boxed_slice();
        index.by_name.insert(key.clone(), i);
        index.names[i as usize] = Some(key);
        index.refs[i as usize] = 1;

        let generation = self.cells[i as usize].generation.load(Ordering::Acquire);
        Ok(Some(EntryHandle::new(i, generation)))
    }

    fn free(&self, handle: EntryHandle) -> Result<bool> {
        let cell = self.cell(handle)?;
        let mut index = self.index.lock();
        let slot = handle.index as usize;

        // re-check under the lock; a concurrent free may have won
        if index.refs[slot] == 0 || cell.generation.load(Ordering::Acquire) != handle.generation {
            return Err(invalid(handle));
        }

        index.refs[slot] -= 1;
        if index.refs[slot] > 0 {
            return Ok(false);
        }

        if let Some(name) = index.names[slot].take() {
            index.by_name.remove(&name);
        }
        cell.value.store(0, Ordering::Relaxed);
        cell.generation.fetch_add(1, Ordering::AcqRel);
        index.free.push(handle.index);
        Ok(true)
    }

    fn load(&self, handle: EntryHandle) -> Result<u64> {
        Ok(self.cell(handle)?.value.load(Ordering::Relaxed))
    }

    fn store(&self, handle: EntryHandle, value: u64) -> Result<()> {
        self.cell(handle)?.value.store(value, Ordering::Relaxed);
        Ok(())
    }

    fn fetch_add(&self, handle: EntryHandle, delta: u64) -> Result<u64> {
        Ok(self.cell(handle)?.value.fetch_add(delta, Ordering::Relaxed))
    }

    fn len(&self) -> Result<usize> {
        Ok(self.index.lock().by_name.len())
    }

    fn capacity(&self) -> usize {
        self.cells.len()
    }
}

fn invalid(handle: EntryHandle) -> Error {
    Error::InvalidHandle {
        index: handle.index,
        generation: handle.generation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::MAX_NAME_LEN;

    #[test]
    fn worked_example_matches_shared_store() {
        let store = HeapStore::new(2);
        let a = store.alloc(b"a").unwrap().unwrap();
        let b = store.alloc(b"b").unwrap().unwrap();
        assert_eq!((a.index, b.index), (0, 1));

        assert_eq!(store.alloc(b"c").unwrap(), None);
        assert_eq!(store.len().unwrap(), 2);

        assert!(store.free(a).unwrap());
        assert_eq!(store.len().unwrap(), 1);

        let c = store.alloc(b"c").unwrap().unwrap();
        assert_eq!(c.index, 0);
        assert_ne!(c.generation, a.generation);
    }

    #[test]
    fn owners_are_counted() {
        let store = HeapStore::new(4);
        let first = store.alloc(b"cx_active").unwrap().unwrap();
        let second = store.alloc(b"cx_active").unwrap().unwrap();
        assert_eq!(first, second);

        store.fetch_add(first, 2).unwrap();
        assert!(!store.free(first).unwrap());
        assert_eq!(store.load(second).unwrap(), 2);
        assert!(store.free(second).unwrap());

        assert!(store.is_empty().unwrap());
        assert!(matches!(store.free(second), Err(Error::InvalidHandle { .. })));
        assert!(matches!(store.load(second), Err(Error::InvalidHandle { .. })));
    }

    #[test]
    fn owner_count_overflow_is_an_error() {
        let store = HeapStore::new(2);
        let h = store.alloc(b"popular").unwrap().unwrap();
        store.index.lock().refs[h.index as usize] = u32::MAX;

        assert!(matches!(store.alloc(b"popular"), Err(Error::Corrupted(_))));
        assert_eq!(store.index.lock().refs[h.index as usize], u32::MAX);
    }

    #[test]
    fn reused_slot_starts_at_zero() {
        let store = HeapStore::new(1);
        let h = store.alloc(b"old").unwrap().unwrap();
        store.store(h, 77).unwrap();
        store.free(h).unwrap();

        let fresh = store.alloc(b"new").unwrap().unwrap();
        assert_eq!(fresh.index, h.index);
        assert_eq!(store.load(fresh).unwrap(), 0);
    }

    #[test]
    fn long_names_use_shared_truncation() {
        let store = HeapStore::new(4);
        let long = vec![b'n'; MAX_NAME_LEN * 2];
        let h = store.alloc(&long).unwrap().unwrap();

        let stored = storage_name(&long).into_owned();
        assert_eq!(store.lookup(&stored), Some(h));
        assert_eq!(store.lookup(&long), Some(h));
        assert_eq!(store.alloc(&stored).unwrap(), Some(h));
    }
}
