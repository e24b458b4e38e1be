//! Shared-memory metrics backend.
//!
//! Provides `ShmZone`, a fixed-capacity table of named 64-bit cells that
//! several processes map at once, and that outlives any one of them (hot
//! upgrades keep their counters). The span (header, entry array, meta,
//! bucket heads) lives in a single memory-mapped file.
//!
//! Registration and release take the span lock; value updates are plain
//! atomics on the entry's cell and never lock.
//!
//! `layout` and `hashset` only see a byte slice and build everywhere; the
//! mapping, the lock and the zone need mmap.
pub mod hashset;
pub mod layout;
#[cfg(not(target_os = "windows"))]
pub mod lock;
#[cfg(not(target_os = "windows"))]
pub mod region;
#[cfg(not(target_os = "windows"))]
mod zone;

#[cfg(not(target_os = "windows"))]
pub use zone::ShmZone;
