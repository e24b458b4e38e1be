//! Metric name hashing and normalization.
//!
//! Names are plain byte strings. Anything longer than [`MAX_NAME_LEN`] is
//! rewritten to exactly `MAX_NAME_LEN` bytes: the decimal FNV-1a hash of the
//! full name, followed by as many trailing bytes of the name as still fit.
//! Both stores normalize with the same rule, so a long name resolves to the
//! same entry no matter which backend holds it.
use std::borrow::Cow;

/// Longest name stored verbatim in an entry record.
pub const MAX_NAME_LEN: usize = 100;

/// FNV-1a 32-bit offset basis.
const OFFSET32: u32 = 2_166_136_261;

/// FNV-1a 32-bit prime.
const PRIME32: u32 = 16_777_619;

/// 32-bit FNV-1a over raw bytes.
#[inline]
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash = OFFSET32;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(PRIME32);
    }
    hash
}

/// The bytes actually stored (and compared) for `name`.
///
/// Borrowed when the name fits, otherwise the hash-prefixed tail.
pub fn storage_name(name: &[u8]) -> Cow<'_, [u8]> {
    if name.len() <= MAX_NAME_LEN {
        return Cow::Borrowed(name);
    }

    let prefix = fnv1a(name).to_string();
    // prefix is at most 10 digits, so the cut is always inside `name`
    let cut = prefix.len() + name.len() - MAX_NAME_LEN;

    let mut out = Vec::with_capacity(MAX_NAME_LEN);
    out.extend_from_slice(prefix.as_bytes());
    out.extend_from_slice(&name[cut..]);
    Cow::Owned(out)
}

/// Bucket for an already-normalized name.
#[inline]
pub fn bucket_of(stored: &[u8], buckets: u32) -> u32 {
    fnv1a(stored) % buckets
}
