//! Chained hash set over a raw shared-memory segment.
//!
//! The segment holds `cap` fixed-size entry records, a [`Meta`] header and
//! `slots_num` bucket heads (see [`SegmentLayout`]). Live entries hang off
//! their bucket in allocation order; free entries form a LIFO list threaded
//! through the same `next` field.
//!
//! `HashSet` does no locking. Callers sharing the segment between threads or
//! processes must serialize every `&mut self` call (see `ShmZone`).
use std::mem::align_of;
use std::ptr;
use std::slice;
use std::sync::atomic::AtomicU64;

use tracing::{debug, trace, warn};

use super::layout::{EntryRecord, Meta, SegmentLayout, SENTINEL};
use crate::entry::EntryHandle;
use crate::error::{Error, Result};
use crate::name::{bucket_of, storage_name};

/// Outcome of [`HashSet::alloc`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocResult {
    /// The name was already registered; nothing changed.
    Found(EntryHandle),
    /// A free slot was taken for the name, with one reference.
    Created(EntryHandle),
    /// Every slot is live. Not retried.
    Exhausted,
}

impl AllocResult {
    pub fn handle(&self) -> Option<EntryHandle> {
        match *self {
            AllocResult::Found(h) | AllocResult::Created(h) => Some(h),
            AllocResult::Exhausted => None,
        }
    }

    pub fn created(&self) -> bool {
        matches!(self, AllocResult::Created(_))
    }
}

/// Typed views over the three regions of one segment.
///
/// Entries are borrowed shared: their value and generation cells stay
/// reachable by lock-free readers while the set is open. Meta and bucket
/// heads belong to the set alone.
pub struct HashSet<'a> {
    entries: &'a [EntryRecord],
    meta: &'a mut Meta,
    slots: &'a mut [u32],
}

impl<'a> HashSet<'a> {
    /// Map a hash set onto `segment`.
    ///
    /// With `init` the regions are (re)initialized: every entry zeroed and
    /// chained into the free list, every bucket emptied. Without it the
    /// existing contents are trusted, but the stored capacity and bucket
    /// count must match the requested ones.
    pub fn open(segment: &'a mut [u8], capacity: u32, buckets: u32, init: bool) -> Result<Self> {
        // SAFETY: the exclusive borrow covers the whole segment for 'a.
        unsafe { Self::from_raw(segment.as_mut_ptr(), segment.len(), capacity, buckets, init) }
    }

    /// Map a hash set onto `len` bytes at `base`.
    ///
    /// # Safety
    /// The bytes must stay mapped for `'a`. While the set lives nobody else
    /// may access the meta or bucket regions, or any entry field other than
    /// atomic loads and stores of `value` and `generation`. With `init`,
    /// nobody may access the segment at all.
    pub unsafe fn from_raw(
        base: *mut u8,
        len: usize,
        capacity: u32,
        buckets: u32,
        init: bool,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidParameter("capacity must be positive"));
        }
        if capacity >= SENTINEL {
            return Err(Error::InvalidParameter("capacity collides with the sentinel index"));
        }
        if buckets == 0 {
            return Err(Error::InvalidParameter("bucket count must be positive"));
        }

        let addr = base as usize;
        let align = align_of::<EntryRecord>();
        if addr % align != 0 {
            return Err(Error::Misaligned { addr, align });
        }

        let layout = SegmentLayout::compute(len, capacity, buckets)?;

        if init {
            ptr::write_bytes(base, 0, layout.meta_offset);
        }

        // The layout check guarantees each region lies inside the segment
        // and the three never overlap; the base is aligned for EntryRecord
        // and the meta and slot offsets are multiples of 4. Every field is
        // an integer, atomic or byte array, so any byte pattern is valid.
        let entries = slice::from_raw_parts(base as *const EntryRecord, capacity as usize);
        let meta = &mut *(base.add(layout.meta_offset) as *mut Meta);
        let slots =
            slice::from_raw_parts_mut(base.add(layout.slots_offset) as *mut u32, buckets as usize);

        let mut set = HashSet {
            entries,
            meta,
            slots,
        };

        if init {
            set.initialize(len);
        } else {
            set.check_attached(capacity, buckets)?;
        }
        Ok(set)
    }

    fn initialize(&mut self, total: usize) {
        let cap = self.entries.len() as u32;

        self.meta.cap = cap;
        self.meta.slots_num = self.slots.len() as u32;
        self.meta.bytes_num = total.min(u32::MAX as usize) as u32;
        self.meta.size = 0;
        self.meta.free_index = 0;

        self.slots.fill(SENTINEL);

        for (i, entry) in self.entries.iter().enumerate() {
            let next = i as u32 + 1;
            entry.set_next(if next < cap { next } else { SENTINEL });
        }
    }

    fn check_attached(&self, capacity: u32, buckets: u32) -> Result<()> {
        if self.meta.cap != capacity || self.meta.slots_num != buckets {
            return Err(Error::LayoutMismatch {
                capacity,
                buckets,
                found_capacity: self.meta.cap,
                found_buckets: self.meta.slots_num,
            });
        }
        if self.meta.size > self.meta.cap {
            return Err(Error::Corrupted("live count exceeds capacity"));
        }
        Ok(())
    }

    /// Find or create the entry for `name`.
    ///
    /// Names longer than `MAX_NAME_LEN` are normalized first, see
    /// [`storage_name`]. A found entry is returned untouched; its reference
    /// count is the caller's business.
    pub fn alloc(&mut self, name: &[u8]) -> Result<AllocResult> {
        let stored = storage_name(name);
        let bucket = bucket_of(&stored, self.slots.len() as u32) as usize;

        let (found, tail) = self.find(&stored, bucket)?;
        if let Some(index) = found {
            return Ok(AllocResult::Found(self.handle_at(index)));
        }

        if self.meta.size >= self.meta.cap {
            return Ok(AllocResult::Exhausted);
        }

        let index = self.meta.free_index;
        let entry = self.entry(index)?;
        if entry.ref_count() != 0 {
            return Err(corrupted("free list head is still referenced"));
        }

        let next_free = entry.next();
        entry.assign_name(&stored);
        entry.set_ref_count(1);
        entry.set_next(SENTINEL);
        let generation = entry.generation();

        match tail {
            None => self.slots[bucket] = index,
            Some(last) => self.entry(last)?.set_next(index),
        }

        self.meta.size += 1;
        self.meta.free_index = next_free;

        debug!(index, bucket, size = self.meta.size, "created entry");
        Ok(AllocResult::Created(EntryHandle::new(index, generation)))
    }

    /// Release one reference held through `handle`.
    ///
    /// Returns `Ok(true)` when that was the last reference and the slot went
    /// back to the free list, `Ok(false)` when other owners remain.
    pub fn free(&mut self, handle: EntryHandle) -> Result<bool> {
        let (refs, bucket) = {
            let entry = self.checked(handle)?;
            let bucket = bucket_of(entry.name(), self.slots.len() as u32) as usize;
            (entry.ref_count(), bucket)
        };

        if refs > 1 {
            self.entries[handle.index as usize].dec_ref();
            trace!(index = handle.index, refs = refs - 1, "released reference");
            return Ok(false);
        }

        // validate everything before touching anything
        let remaining = self
            .meta
            .size
            .checked_sub(1)
            .ok_or_else(|| corrupted("live count underflow"))?;

        let mut prev = None;
        let mut index = self.slots[bucket];
        let mut steps = 0;
        while index != handle.index {
            if index == SENTINEL {
                return Err(corrupted("entry missing from its bucket chain"));
            }
            steps += 1;
            if steps > self.entries.len() {
                return Err(corrupted("cycle in bucket chain"));
            }
            prev = Some(index);
            index = self.entry(index)?.next();
        }

        let entry = &self.entries[index as usize];
        let next = entry.next();
        match prev {
            Some(p) => self.entries[p as usize].set_next(next),
            None => self.slots[bucket] = next,
        }

        entry.reset();
        entry.set_next(self.meta.free_index);

        self.meta.free_index = index;
        self.meta.size = remaining;

        debug!(index, bucket, size = self.meta.size, "reclaimed entry");
        Ok(true)
    }

    /// Add one reference to a live entry. Returns the new count.
    pub fn retain(&mut self, handle: EntryHandle) -> Result<u32> {
        let entry = self.checked(handle)?;
        let refs = entry
            .ref_count()
            .checked_add(1)
            .ok_or_else(|| corrupted("reference count overflow"))?;
        entry.set_ref_count(refs);
        trace!(index = handle.index, refs, "retained reference");
        Ok(refs)
    }

    /// Find the live entry for `name` without creating it.
    pub fn lookup(&self, name: &[u8]) -> Result<Option<EntryHandle>> {
        let stored = storage_name(name);
        let bucket = bucket_of(&stored, self.slots.len() as u32) as usize;
        let (found, _) = self.find(&stored, bucket)?;
        Ok(found.map(|index| self.handle_at(index)))
    }

    pub fn ref_count(&self, handle: EntryHandle) -> Result<u32> {
        Ok(self.checked(handle)?.ref_count())
    }

    /// The stored (normalized) name of a live entry.
    pub fn name(&self, handle: EntryHandle) -> Result<&[u8]> {
        Ok(self.checked(handle)?.name())
    }

    pub fn value(&self, handle: EntryHandle) -> Result<&AtomicU64> {
        Ok(&self.checked(handle)?.body.value)
    }

    /// All live entries, in slot order.
    pub fn live_entries(&self) -> impl Iterator<Item = (EntryHandle, &EntryRecord)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.ref_count() > 0)
            .map(|(i, e)| (EntryHandle::new(i as u32, e.generation()), e))
    }

    pub fn len(&self) -> u32 {
        self.meta.size
    }

    pub fn is_empty(&self) -> bool {
        self.meta.size == 0
    }

    pub fn capacity(&self) -> u32 {
        self.meta.cap
    }

    pub fn bucket_count(&self) -> u32 {
        self.meta.slots_num
    }

    pub fn byte_size(&self) -> u32 {
        self.meta.bytes_num
    }

    /// Length of the free list, walked from its head.
    pub fn free_len(&self) -> Result<u32> {
        let mut len = 0u32;
        let mut index = self.meta.free_index;
        while index != SENTINEL {
            len += 1;
            if len > self.meta.cap {
                return Err(corrupted("cycle in free list"));
            }
            index = self.entry(index)?.next();
        }
        Ok(len)
    }

    /// Walk `bucket` looking for `stored`. Returns the match, or the last
    /// entry of the chain when there is none.
    fn find(&self, stored: &[u8], bucket: usize) -> Result<(Option<u32>, Option<u32>)> {
        let mut tail = None;
        let mut index = self.slots[bucket];
        let mut steps = 0;
        while index != SENTINEL {
            let entry = self.entry(index)?;
            if entry.name_eq(stored) {
                return Ok((Some(index), tail));
            }
            steps += 1;
            if steps > self.entries.len() {
                return Err(corrupted("cycle in bucket chain"));
            }
            tail = Some(index);
            index = entry.next();
        }
        Ok((None, tail))
    }

    fn handle_at(&self, index: u32) -> EntryHandle {
        EntryHandle::new(index, self.entries[index as usize].generation())
    }

    fn entry(&self, index: u32) -> Result<&EntryRecord> {
        self.entries
            .get(index as usize)
            .ok_or_else(|| corrupted("entry index out of range"))
    }

    /// The live entry `handle` refers to, if the handle is still current.
    fn checked(&self, handle: EntryHandle) -> Result<&EntryRecord> {
        match self.entries.get(handle.index as usize) {
            Some(e) if e.ref_count() > 0 && e.generation() == handle.generation => Ok(e),
            _ => {
                warn!(
                    index = handle.index,
                    generation = handle.generation,
                    "rejected stale or unknown entry handle"
                );
                Err(Error::InvalidHandle {
                    index: handle.index,
                    generation: handle.generation,
                })
            }
        }
    }

    #[cfg(test)]
    fn chain(&self, bucket: usize) -> Vec<u32> {
        let mut out = Vec::new();
        let mut index = self.slots[bucket];
        while index != SENTINEL {
            out.push(index);
            index = self.entries[index as usize].next();
        }
        out
    }
}

fn corrupted(what: &'static str) -> Error {
    warn!(what, "shared hash set corrupted");
    Error::Corrupted(what)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::name::MAX_NAME_LEN;

    /// Zeroed, 8-byte aligned backing store for a segment.
    fn backing(capacity: u32, buckets: u32) -> Vec<u64> {
        vec![0u64; SegmentLayout::required_bytes(capacity, buckets).div_ceil(8)]
    }

    fn bytes(words: &mut [u64]) -> &mut [u8] {
        // SAFETY: u64 storage reinterpreted as bytes of the same length.
        unsafe { slice::from_raw_parts_mut(words.as_mut_ptr() as *mut u8, words.len() * 8) }
    }

    fn assert_accounting(set: &HashSet<'_>) {
        assert_eq!(set.len() + set.free_len().unwrap(), set.capacity());
    }

    #[test]
    fn free_rejects_live_count_underflow() {
        let mut mem = backing(4, 2);
        let mut set = HashSet::open(bytes(&mut mem), 4, 2, true).unwrap();
        let h = set.alloc(b"orphan").unwrap().handle().unwrap();

        // a segment whose live count disagrees with its entries
        set.meta.size = 0;
        assert!(matches!(set.free(h), Err(Error::Corrupted(_))));

        // nothing was unlinked
        assert_eq!(set.lookup(b"orphan").unwrap(), Some(h));
        assert_eq!(set.ref_count(h).unwrap(), 1);
    }

    #[test]
    fn retain_rejects_overflow() {
        let mut mem = backing(2, 1);
        let mut set = HashSet::open(bytes(&mut mem), 2, 1, true).unwrap();
        let h = set.alloc(b"hot").unwrap().handle().unwrap();
        set.entries[h.index as usize].set_ref_count(u32::MAX);
        assert!(matches!(set.retain(h), Err(Error::Corrupted(_))));
    }

    #[test]
    fn realloc_returns_same_entry() {
        let mut mem = backing(8, 4);
        let mut set = HashSet::open(bytes(&mut mem), 8, 4, true).unwrap();

        let first = set.alloc(b"downstream_cx_total").unwrap();
        let second = set.alloc(b"downstream_cx_total").unwrap();

        assert!(first.created());
        assert!(!second.created());
        assert_eq!(first.handle(), second.handle());
        assert_eq!(set.len(), 1);
        assert_eq!(set.ref_count(first.handle().unwrap()).unwrap(), 1);
    }

    #[test]
    fn worked_example_capacity_two_single_bucket() {
        let mut mem = backing(2, 1);
        let mut set = HashSet::open(bytes(&mut mem), 2, 1, true).unwrap();

        let a = set.alloc(b"a").unwrap();
        assert!(matches!(a, AllocResult::Created(h) if h.index == 0));
        let b = set.alloc(b"b").unwrap();
        assert!(matches!(b, AllocResult::Created(h) if h.index == 1));
        assert_eq!(set.chain(0), vec![0, 1]);

        assert_eq!(set.alloc(b"c").unwrap(), AllocResult::Exhausted);
        assert_eq!(set.len(), 2);

        assert!(set.free(a.handle().unwrap()).unwrap());
        assert_eq!(set.len(), 1);
        assert_eq!(set.meta.free_index, 0);
        assert_eq!(set.chain(0), vec![1]);

        let c = set.alloc(b"c").unwrap();
        assert!(matches!(c, AllocResult::Created(h) if h.index == 0));
        assert_eq!(set.chain(0), vec![1, 0]);
        assert_accounting(&set);
    }

    #[test]
    fn full_table_rejects_new_names_only() {
        let mut mem = backing(4, 2);
        let mut set = HashSet::open(bytes(&mut mem), 4, 2, true).unwrap();
        for name in ["w", "x", "y", "z"] {
            assert!(set.alloc(name.as_bytes()).unwrap().created());
        }

        assert_eq!(set.alloc(b"overflow").unwrap(), AllocResult::Exhausted);
        assert_eq!(set.len(), 4);
        assert_eq!(set.free_len().unwrap(), 0);

        // existing names still resolve when full
        assert!(matches!(set.alloc(b"y").unwrap(), AllocResult::Found(_)));
    }

    #[test]
    fn free_with_other_owners_keeps_entry() {
        let mut mem = backing(4, 2);
        let mut set = HashSet::open(bytes(&mut mem), 4, 2, true).unwrap();
        let h = set.alloc(b"shared").unwrap().handle().unwrap();
        assert_eq!(set.retain(h).unwrap(), 2);

        assert!(!set.free(h).unwrap());
        assert_eq!(set.ref_count(h).unwrap(), 1);
        assert_eq!(set.lookup(b"shared").unwrap(), Some(h));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn last_free_zeroes_and_recycles_slot() {
        let mut mem = backing(4, 2);
        let mut set = HashSet::open(bytes(&mut mem), 4, 2, true).unwrap();
        let h = set.alloc(b"requests").unwrap().handle().unwrap();
        set.value(h).unwrap().store(99, Ordering::Relaxed);

        assert!(set.free(h).unwrap());
        assert_eq!(set.lookup(b"requests").unwrap(), None);

        let rec = &set.entries[h.index as usize];
        assert_eq!(rec.name(), b"");
        assert_eq!(rec.ref_count(), 0);
        assert_eq!(rec.body.value.load(Ordering::Relaxed), 0);

        let reused = set.alloc(b"errors").unwrap().handle().unwrap();
        assert_eq!(reused.index, h.index);
        assert_ne!(reused.generation, h.generation);
        assert_eq!(set.value(reused).unwrap().load(Ordering::Relaxed), 0);
        assert_accounting(&set);
    }

    #[test]
    fn stale_and_double_free_are_rejected() {
        let mut mem = backing(2, 1);
        let mut set = HashSet::open(bytes(&mut mem), 2, 1, true).unwrap();
        let h = set.alloc(b"a").unwrap().handle().unwrap();
        assert!(set.free(h).unwrap());

        assert!(matches!(set.free(h), Err(Error::InvalidHandle { .. })));

        // the slot is reused by another name; the old handle must not free it
        let other = set.alloc(b"b").unwrap().handle().unwrap();
        assert_eq!(other.index, h.index);
        assert!(matches!(set.free(h), Err(Error::InvalidHandle { .. })));
        assert_eq!(set.lookup(b"b").unwrap(), Some(other));

        let out_of_range = EntryHandle::new(9, 0);
        assert!(matches!(set.free(out_of_range), Err(Error::InvalidHandle { .. })));
        assert_accounting(&set);
    }

    #[test]
    fn colliding_names_stay_independent() {
        let mut mem = backing(8, 1);
        let mut set = HashSet::open(bytes(&mut mem), 8, 1, true).unwrap();
        let names: [&[u8]; 4] = [b"alpha", b"beta", b"gamma", b"delta"];
        let handles: Vec<_> = names
            .iter()
            .map(|n| set.alloc(n).unwrap().handle().unwrap())
            .collect();
        assert_eq!(set.chain(0), vec![0, 1, 2, 3]);

        // middle, head, tail
        assert!(set.free(handles[1]).unwrap());
        assert_eq!(set.chain(0), vec![0, 2, 3]);
        assert!(set.free(handles[0]).unwrap());
        assert_eq!(set.chain(0), vec![2, 3]);
        assert!(set.free(handles[3]).unwrap());
        assert_eq!(set.chain(0), vec![2]);

        assert_eq!(set.lookup(b"gamma").unwrap(), Some(handles[2]));
        assert_eq!(set.lookup(b"alpha").unwrap(), None);
        assert_accounting(&set);
    }

    #[test]
    fn free_list_is_lifo() {
        let mut mem = backing(4, 2);
        let mut set = HashSet::open(bytes(&mut mem), 4, 2, true).unwrap();
        let a = set.alloc(b"a").unwrap().handle().unwrap();
        let b = set.alloc(b"b").unwrap().handle().unwrap();

        set.free(a).unwrap();
        set.free(b).unwrap();

        assert_eq!(set.alloc(b"c").unwrap().handle().unwrap().index, b.index);
        assert_eq!(set.alloc(b"d").unwrap().handle().unwrap().index, a.index);
    }

    #[test]
    fn accounting_holds_over_mixed_sequence() {
        let mut mem = backing(16, 5);
        let mut set = HashSet::open(bytes(&mut mem), 16, 5, true).unwrap();
        let mut live: Vec<EntryHandle> = Vec::new();
        let mut seed: u32 = 0x2545_f491;

        for _ in 0..2_000 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;

            if seed % 3 != 0 || live.is_empty() {
                let name = format!("metric.{}", seed % 40);
                match set.alloc(name.as_bytes()).unwrap() {
                    AllocResult::Created(h) => live.push(h),
                    AllocResult::Found(h) => {
                        set.retain(h).unwrap();
                        live.push(h);
                    }
                    AllocResult::Exhausted => assert_eq!(set.len(), 16),
                }
            } else {
                let h = live.swap_remove(seed as usize % live.len());
                set.free(h).unwrap();
            }
            assert_accounting(&set);
        }

        for h in live.drain(..) {
            set.free(h).unwrap();
        }
        assert!(set.is_empty());
        assert_eq!(set.free_len().unwrap(), 16);
    }

    #[test]
    fn max_length_names_are_verbatim() {
        let mut mem = backing(4, 2);
        let mut set = HashSet::open(bytes(&mut mem), 4, 2, true).unwrap();
        let exact = vec![b'm'; MAX_NAME_LEN];

        let h = set.alloc(&exact).unwrap().handle().unwrap();
        assert_eq!(set.name(h).unwrap(), &exact[..]);
        assert_eq!(set.lookup(&exact).unwrap(), Some(h));
    }

    #[test]
    fn over_length_names_are_truncated_consistently() {
        let mut mem = backing(4, 2);
        let mut set = HashSet::open(bytes(&mut mem), 4, 2, true).unwrap();
        let long: Vec<u8> = (0..=MAX_NAME_LEN).map(|i| b'a' + (i % 26) as u8).collect();
        let stored = storage_name(&long).into_owned();

        let created = set.alloc(&long).unwrap();
        let h = created.handle().unwrap();
        assert!(created.created());
        assert_eq!(set.name(h).unwrap(), &stored[..]);

        assert_eq!(set.alloc(&long).unwrap(), AllocResult::Found(h));
        assert_eq!(set.lookup(&stored).unwrap(), Some(h));
        assert_eq!(set.alloc(&stored).unwrap(), AllocResult::Found(h));

        assert!(set.free(h).unwrap());
        assert_eq!(set.lookup(&long).unwrap(), None);
        assert_accounting(&set);
    }

    #[test]
    fn attach_preserves_entries_and_values() {
        let mut mem = backing(4, 2);
        let h = {
            let mut set = HashSet::open(bytes(&mut mem), 4, 2, true).unwrap();
            let h = set.alloc(b"uptime").unwrap().handle().unwrap();
            set.value(h).unwrap().store(1234, Ordering::Relaxed);
            h
        };

        let mut set = HashSet::open(bytes(&mut mem), 4, 2, false).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.lookup(b"uptime").unwrap(), Some(h));
        assert_eq!(set.value(h).unwrap().load(Ordering::Relaxed), 1234);
        assert_eq!(set.alloc(b"uptime").unwrap(), AllocResult::Found(h));
        assert_accounting(&set);
    }

    #[test]
    fn attach_with_other_parameters_fails() {
        let mut mem = backing(4, 2);
        HashSet::open(bytes(&mut mem), 4, 2, true).unwrap();

        match HashSet::open(bytes(&mut mem), 4, 1, false) {
            Err(Error::LayoutMismatch {
                found_capacity,
                found_buckets,
                ..
            }) => {
                assert_eq!(found_capacity, 4);
                assert_eq!(found_buckets, 2);
            }
            other => panic!("expected LayoutMismatch, got {:?}", other.err()),
        }
    }

    #[test]
    fn open_rejects_bad_segments() {
        let mut mem = backing(4, 2);
        let buf = bytes(&mut mem);

        assert!(matches!(
            HashSet::open(&mut buf[..EntryRecord::SIZE], 4, 2, true),
            Err(Error::InsufficientSegment { .. })
        ));
        assert!(matches!(
            HashSet::open(&mut buf[1..], 1, 1, true),
            Err(Error::Misaligned { .. })
        ));
        assert!(matches!(
            HashSet::open(&mut buf[..], 0, 2, true),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            HashSet::open(&mut buf[..], 4, 0, true),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn init_threads_free_list_in_order() {
        let mut mem = backing(3, 2);
        let set = HashSet::open(bytes(&mut mem), 3, 2, true).unwrap();
        let nexts: Vec<u32> = set.entries.iter().map(|e| e.next()).collect();
        assert_eq!(nexts, vec![1, 2, SENTINEL]);
        assert_eq!(set.meta.free_index, 0);
        assert!(set.slots.iter().all(|&s| s == SENTINEL));
        assert_eq!(set.byte_size() as usize, mem_len(3, 2));
    }

    fn mem_len(capacity: u32, buckets: u32) -> usize {
        SegmentLayout::required_bytes(capacity, buckets).div_ceil(8) * 8
    }
}
