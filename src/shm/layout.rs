//! `#[repr(C)]` structures that live in shared memory (mmap).
//!
//! A mapped span looks like this:
//!
//! ```text
//! +-------------+----------------------------+------+-------------------+
//! | SpanHeader  | EntryRecord[cap]           | Meta | u32[slots_num]    |
//! | (128 bytes) | (128 bytes each)           | (20) | bucket heads      |
//! +-------------+----------------------------+------+-------------------+
//!               ^ segment handed to HashSet::open
//! ```
//!
//! The span header belongs to the region provider (magic, lock word,
//! attach counter). Everything after it is the hash-set segment, laid out
//! by [`SegmentLayout`].
use std::cell::UnsafeCell;
use std::mem::{align_of, size_of};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{Error, Region, Result};
use crate::name::MAX_NAME_LEN;

/// Records are padded to a multiple of this so neighbours never share a line.
pub const CACHE_LINE_SIZE: usize = 128;

/// Terminates bucket chains and the free list. Never a valid index.
pub const SENTINEL: u32 = u32::MAX;

/// Magic bytes at the start of the span header.
pub const MAGIC: [u8; 8] = *b"SHMMETR1";

/// Bumped whenever any structure in this file changes shape.
pub const FORMAT_VERSION: u32 = 1;

/// Size of the span header; the hash-set segment starts right after it.
pub const SPAN_HEADER_SIZE: usize = 128;

/// Header at offset 0 of a mapped span.
///
/// Fields are ordered u64-first to avoid implicit alignment padding
/// in `#[repr(C)]`. The plain fields are written once, before `version` is
/// published with a Release store; openers load `version` first.
#[repr(C)]
#[derive(Debug)]
pub struct SpanHeader {
    pub magic: [u8; 8],            // 0..8
    pub data_bytes: u64,           // 8..16  (segment bytes after this header)
    pub version: AtomicU32,        // 16..20 (0 = header not published yet)
    pub lock: AtomicU32,           // 20..24 (0 = free, otherwise holder pid)
    pub attach_count: AtomicU32,   // 24..28
    pub capacity: u32,             // 28..32
    pub buckets: u32,              // 32..36
    pub initialized: AtomicU32,    // 36..40 (hash set laid out, set under the lock)
    pub _pad: [u8; 88],            // 40..128
}

const _: () = assert!(size_of::<SpanHeader>() == SPAN_HEADER_SIZE);

/// Everything an entry carries before padding.
///
/// `value` and `generation` are read without the span lock, so records are
/// only ever borrowed shared and every field is interior-mutable. The other
/// fields are touched under the span lock alone, which orders their relaxed
/// accesses.
#[repr(C)]
#[derive(Debug)]
pub struct EntryBody {
    /// Metric state, owned by whoever holds a handle. Never interpreted here.
    pub value: AtomicU64,
    pub ref_count: AtomicU32,
    /// Reuse counter. Survives the zeroing done when the slot is reclaimed.
    pub generation: AtomicU32,
    /// Live: next entry in the bucket chain. Free: next slot in the free
    /// list. `SENTINEL` ends either list.
    pub next: AtomicU32,
    pub name_len: AtomicU32,
    pub name: UnsafeCell<[u8; MAX_NAME_LEN]>,
}

const ENTRY_PAD: usize =
    (CACHE_LINE_SIZE - size_of::<EntryBody>() % CACHE_LINE_SIZE) % CACHE_LINE_SIZE;

/// One slot of the entry array.
#[repr(C)]
#[derive(Debug)]
pub struct EntryRecord {
    pub body: EntryBody,
    _pad: [u8; ENTRY_PAD],
}

impl EntryRecord {
    pub const SIZE: usize = size_of::<Self>();
}

const _: () = assert!(EntryRecord::SIZE % CACHE_LINE_SIZE == 0);
const _: () = assert!(SPAN_HEADER_SIZE % align_of::<EntryRecord>() == 0);

impl EntryRecord {
    /// The stored (already normalized) name.
    #[inline]
    pub fn name(&self) -> &[u8] {
        let len = (self.body.name_len.load(Ordering::Relaxed) as usize).min(MAX_NAME_LEN);
        // SAFETY: names are written only by the span lock holder, and a
        // record is never shared across threads outside of it.
        unsafe { &(&(*self.body.name.get()))[..len] }
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.body.generation.load(Ordering::Acquire)
    }

    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.body.ref_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_ref_count(&self, refs: u32) {
        self.body.ref_count.store(refs, Ordering::Relaxed);
    }

    #[inline]
    pub fn next(&self) -> u32 {
        self.body.next.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_next(&self, next: u32) {
        self.body.next.store(next, Ordering::Relaxed);
    }

    #[inline]
    pub fn name_eq(&self, stored: &[u8]) -> bool {
        self.name() == stored
    }

    /// Copy a normalized name into the record. `stored` must not exceed
    /// `MAX_NAME_LEN`; longer input is cut.
    pub fn assign_name(&self, stored: &[u8]) {
        let len = stored.len().min(MAX_NAME_LEN);
        // SAFETY: see `name`; no borrow of the old name outlives this call
        // because callers hold the record through `&mut HashSet`.
        let name = unsafe { &mut *self.body.name.get() };
        name[..len].copy_from_slice(&stored[..len]);
        name[len..].fill(0);
        self.body.name_len.store(len as u32, Ordering::Relaxed);
    }

    /// Drop one reference. Returns true when this was the last one.
    #[inline]
    pub fn dec_ref(&self) -> bool {
        let refs = self.ref_count().saturating_sub(1);
        self.set_ref_count(refs);
        refs == 0
    }

    /// Advance the generation, then zero name, value and reference count.
    /// The chain pointer is kept.
    ///
    /// Lock-free readers holding the old generation fail their check from
    /// the first store on.
    pub fn reset(&self) {
        self.body.generation.fetch_add(1, Ordering::Release);
        self.body.value.store(0, Ordering::Relaxed);
        self.set_ref_count(0);
        self.assign_name(&[]);
    }

    #[cfg(test)]
    fn zeroed() -> Self {
        EntryRecord {
            body: EntryBody {
                value: AtomicU64::new(0),
                ref_count: AtomicU32::new(0),
                generation: AtomicU32::new(0),
                next: AtomicU32::new(0),
                name_len: AtomicU32::new(0),
                name: UnsafeCell::new([0; MAX_NAME_LEN]),
            },
            _pad: [0; ENTRY_PAD],
        }
    }
}

/// Shared bookkeeping for one hash set. Sits right after the entry array.
#[repr(C)]
#[derive(Debug)]
pub struct Meta {
    pub cap: u32,
    pub size: u32,
    pub free_index: u32,
    pub slots_num: u32,
    pub bytes_num: u32,
}

impl Meta {
    pub const SIZE: usize = size_of::<Self>();
}

const _: () = assert!(Meta::SIZE == 20);

/// Byte offsets of the three hash-set regions inside a segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentLayout {
    pub meta_offset: usize,
    pub slots_offset: usize,
    pub end: usize,
}

impl SegmentLayout {
    /// Partition `total` bytes for `capacity` entries and `buckets` heads.
    ///
    /// Regions are reserved in order (entries, meta, slots); the first one
    /// that runs past `total` is reported.
    pub fn compute(total: usize, capacity: u32, buckets: u32) -> Result<Self> {
        let mut offset = (capacity as usize)
            .checked_mul(EntryRecord::SIZE)
            .unwrap_or(usize::MAX);
        check(Region::Entry, offset, total)?;
        let meta_offset = offset;

        offset = offset.saturating_add(Meta::SIZE);
        check(Region::Meta, offset, total)?;
        let slots_offset = offset;

        offset = offset.saturating_add((buckets as usize).saturating_mul(size_of::<u32>()));
        check(Region::Slots, offset, total)?;

        Ok(SegmentLayout {
            meta_offset,
            slots_offset,
            end: offset,
        })
    }

    /// Smallest segment that holds `capacity` entries and `buckets` heads.
    /// Saturates at `usize::MAX` instead of wrapping.
    pub fn required_bytes(capacity: u32, buckets: u32) -> usize {
        (capacity as usize)
            .saturating_mul(EntryRecord::SIZE)
            .saturating_add(Meta::SIZE)
            .saturating_add((buckets as usize).saturating_mul(size_of::<u32>()))
    }

    /// Largest capacity that fits in `bytes` with the default bucket ratio.
    /// Zero when not even one entry fits.
    pub fn capacity_for(bytes: usize) -> u32 {
        let Some(avail) = bytes.checked_sub(Meta::SIZE) else {
            return 0;
        };
        // each entry costs its record plus half a bucket head; odd capacities
        // round the bucket count down, so the estimate may be one short
        let estimate = avail / (EntryRecord::SIZE + size_of::<u32>() / 2) + 1;
        let mut cap = estimate.min((SENTINEL - 1) as usize) as u32;
        while cap > 0 && Self::required_bytes(cap, default_buckets(cap)) > bytes {
            cap -= 1;
        }
        cap
    }
}

/// Buckets used when the caller does not choose: half the capacity.
#[inline]
pub fn default_buckets(capacity: u32) -> u32 {
    (capacity / 2).max(1)
}

#[inline]
fn check(region: Region, required: usize, available: usize) -> Result<()> {
    if required > available {
        return Err(Error::InsufficientSegment {
            region,
            required,
            available,
        });
    }
    Ok(())
}
