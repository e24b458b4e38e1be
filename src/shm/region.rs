//! Shared memory region management using mmap.
//!
//! Creates or opens a memory-mapped file (or an anonymous mapping) that
//! holds a span header followed by one hash-set segment. The span header
//! carries the magic, the lock word, the attach counter and the
//! initialized flag; the hash set itself is laid out by the caller at
//! [`ShmRegion::segment_ptr`].
//!
//! A creator fills the header and publishes it by storing `version` last.
//! Until then openers see `Error::Unpublished` and wait.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use memmap2::MmapMut;
use tracing::{info, warn};

use super::layout::{SegmentLayout, SpanHeader, FORMAT_VERSION, MAGIC, SENTINEL, SPAN_HEADER_SIZE};
use super::lock::ShmSpinLock;
use crate::error::{Error, Result};

/// Polls of an unpublished header before the file is treated as stale.
const PUBLISH_POLLS: u32 = 200;

const PUBLISH_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Create/open rounds before giving up on a path that keeps changing.
const OPEN_ROUNDS: u32 = 8;

/// Where named regions live by default.
pub fn shm_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        PathBuf::from("/dev/shm")
    } else {
        // macOS and other Unix: use TMPDIR
        std::env::temp_dir().join("shm_metrics")
    }
}

/// Total mapping length for a hash set of the given shape, page aligned.
pub fn span_size(capacity: u32, buckets: u32) -> Result<usize> {
    SPAN_HEADER_SIZE
        .checked_add(SegmentLayout::required_bytes(capacity, buckets))
        .and_then(|raw| raw.checked_next_multiple_of(page_size()))
        .ok_or(Error::InvalidParameter("region does not fit in the address space"))
}

fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    }
}

/// A mapped span: header plus hash-set segment.
pub struct ShmRegion {
    mmap: MmapMut,
    base: *mut u8,
    path: Option<PathBuf>,
}

// Mutation of the mapping goes through the span lock.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Create the file at `path`, which must not exist yet, and publish a
    /// fresh header. Fails with an `AlreadyExists` I/O error otherwise, so
    /// of several concurrent creators exactly one wins.
    ///
    /// The segment is left zeroed and the header marks the hash set as not
    /// initialized; the first zone to take the span lock lays it out.
    pub fn create(path: &Path, capacity: u32, buckets: u32) -> Result<Self> {
        check_shape(capacity, buckets)?;
        let total = span_size(capacity, buckets)?;
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let mapped = file.set_len(total as u64).and_then(|()| {
            // Safety: the header is unpublished, so no other opener uses
            // this file as a region yet.
            unsafe { MmapMut::map_mut(&file) }
        });
        let mmap = match mapped {
            Ok(mmap) => mmap,
            Err(e) => {
                // leave no half-made file behind for others to wait on
                let _ = fs::remove_file(path);
                return Err(e.into());
            }
        };

        let region = ShmRegion::from_mmap(mmap, Some(path.to_path_buf()));
        region.write_header(capacity, buckets);
        region.mmap.flush()?;

        info!(
            path = %path.display(),
            capacity,
            buckets,
            bytes = total,
            "created shared metrics region"
        );
        Ok(region)
    }

    /// Anonymous mapping. Visible to every thread of this process only.
    pub fn anonymous(capacity: u32, buckets: u32) -> Result<Self> {
        check_shape(capacity, buckets)?;
        let total = span_size(capacity, buckets)?;
        let mmap = MmapMut::map_anon(total)?;
        let region = ShmRegion::from_mmap(mmap, None);
        region.write_header(capacity, buckets);
        Ok(region)
    }

    /// Map an existing region file and validate its header.
    ///
    /// `Error::Unpublished` means the file exists but its creator has not
    /// finished writing the header (or died before it did).
    pub fn open(path: &Path) -> Result<Self> {
        let file = fs::OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < SPAN_HEADER_SIZE {
            return Err(Error::Unpublished);
        }

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let region = ShmRegion::from_mmap(mmap, Some(path.to_path_buf()));

        let header = region.header();
        match header.version.load(Ordering::Acquire) {
            0 => return Err(Error::Unpublished),
            _ if header.magic != MAGIC => return Err(Error::BadHeader("bad magic")),
            FORMAT_VERSION => {}
            _ => return Err(Error::BadHeader("unsupported format version")),
        }
        let data_bytes = header.data_bytes as usize;
        if SPAN_HEADER_SIZE.saturating_add(data_bytes) > len {
            return Err(Error::BadHeader("file truncated"));
        }
        SegmentLayout::compute(data_bytes, header.capacity, header.buckets)?;

        Ok(region)
    }

    /// Attach to `path` when it holds a region of exactly this shape,
    /// otherwise create it. The flag tells whether this call created it.
    ///
    /// A region of another shape is only replaced when nobody is attached
    /// to it. A file whose header stays unpublished, or that is not a
    /// region at all, is replaced after a grace period. Replacing unlinks
    /// the old file and creates a new one; files are never truncated in
    /// place, so stray mappings of the old file stay valid.
    pub fn create_or_open(path: &Path, capacity: u32, buckets: u32) -> Result<(Self, bool)> {
        check_shape(capacity, buckets)?;
        let mut polls = 0;
        let mut rounds = 0;

        loop {
            match Self::create(path, capacity, buckets) {
                Ok(region) => return Ok((region, true)),
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }

            match Self::open(path) {
                Ok(region) => {
                    let header = region.header();
                    if header.capacity == capacity && header.buckets == buckets {
                        info!(
                            path = %path.display(),
                            capacity,
                            buckets,
                            attached = region.attach_count(),
                            "attached to shared metrics region"
                        );
                        return Ok((region, false));
                    }
                    if region.attach_count() > 0 {
                        return Err(Error::LayoutMismatch {
                            capacity,
                            buckets,
                            found_capacity: header.capacity,
                            found_buckets: header.buckets,
                        });
                    }
                    warn!(
                        path = %path.display(),
                        found_capacity = header.capacity,
                        found_buckets = header.buckets,
                        capacity,
                        buckets,
                        "shared metrics region has another shape, replacing"
                    );
                    drop(region);
                    remove_if_present(path)?;
                }
                // another opener removed it between our two calls
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => {}
                Err(Error::Unpublished) if polls < PUBLISH_POLLS => {
                    polls += 1;
                    thread::sleep(PUBLISH_POLL_INTERVAL);
                    continue;
                }
                Err(e @ (Error::Unpublished | Error::BadHeader(_))) => {
                    warn!(path = %path.display(), error = %e, "stale shared metrics file, replacing");
                    remove_if_present(path)?;
                    polls = 0;
                }
                Err(e) => return Err(e),
            }

            rounds += 1;
            if rounds == OPEN_ROUNDS {
                return Err(Error::BadHeader("region kept changing while opening"));
            }
        }
    }

    fn from_mmap(mut mmap: MmapMut, path: Option<PathBuf>) -> Self {
        let base = mmap.as_mut_ptr();
        ShmRegion { mmap, base, path }
    }

    /// Fill in an unpublished header and publish it.
    fn write_header(&self, capacity: u32, buckets: u32) {
        let data_bytes = (self.mmap.len() - SPAN_HEADER_SIZE) as u64;
        let header = self.base as *mut SpanHeader;
        // SAFETY: `version` is still 0, so no opener reads the plain fields
        // yet; the atomics are only ever accessed atomically.
        unsafe {
            ptr::addr_of_mut!((*header).magic).write(MAGIC);
            ptr::addr_of_mut!((*header).data_bytes).write(data_bytes);
            ptr::addr_of_mut!((*header).capacity).write(capacity);
            ptr::addr_of_mut!((*header).buckets).write(buckets);
            ShmSpinLock::init(ptr::addr_of!((*header).lock));
            (*header).attach_count.store(0, Ordering::Relaxed);
            (*header).initialized.store(0, Ordering::Relaxed);
            // last: openers check the version before anything else
            (*header).version.store(FORMAT_VERSION, Ordering::Release);
        }
    }

    pub fn header(&self) -> &SpanHeader {
        unsafe { &*(self.base as *const SpanHeader) }
    }

    pub fn lock(&self) -> ShmSpinLock {
        unsafe { ShmSpinLock::from_existing(&self.header().lock as *const AtomicU32) }
    }

    /// Whether the hash set has been laid out. Check under the span lock.
    pub fn is_initialized(&self) -> bool {
        self.header().initialized.load(Ordering::Acquire) != 0
    }

    /// Record that the hash set has been laid out. Call under the span lock.
    pub fn mark_initialized(&self) {
        self.header().initialized.store(1, Ordering::Release);
    }

    /// Start of the hash-set segment.
    pub fn segment_ptr(&self) -> *mut u8 {
        unsafe { self.base.add(SPAN_HEADER_SIZE) }
    }

    /// Length of the hash-set segment in bytes.
    pub fn segment_len(&self) -> usize {
        self.mmap.len() - SPAN_HEADER_SIZE
    }

    /// Register this process as a user. Returns the new count.
    pub fn attach(&self) -> u32 {
        self.header().attach_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Unregister. Returns the remaining count.
    pub fn detach(&self) -> u32 {
        let counter = &self.header().attach_count;
        let mut current = counter.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return 0;
            }
            match counter.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current - 1,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn attach_count(&self) -> u32 {
        self.header().attach_count.load(Ordering::Acquire)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }

    /// Remove the backing file. The mapping stays valid until dropped.
    pub fn unlink(&self) -> Result<()> {
        if let Some(path) = &self.path {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn check_shape(capacity: u32, buckets: u32) -> Result<()> {
    if capacity == 0 {
        return Err(Error::InvalidParameter("capacity must be positive"));
    }
    if capacity >= SENTINEL {
        return Err(Error::InvalidParameter("capacity collides with the sentinel index"));
    }
    if buckets == 0 {
        return Err(Error::InvalidParameter("bucket count must be positive"));
    }
    Ok(())
}
