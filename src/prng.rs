//! Pseudo-random payload pools.
//!
//! Traffic payloads are pseudo-random bytes shaped to resemble gaming/video/
//! streaming envelopes — never real media. A fast, seedable PRNG (xoshiro
//! family) fills size-bucketed pools once; the hot path only copies out of a
//! pool entry, since entropy generation must never sit on the critical path
//! between cleanup and send.

use bytes::Bytes;
use rand::Rng;
use rand_core::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

/// Bucket sizes kept pre-filled, from the smallest real-time packet up
/// through the largest upload-tiering chunk size (6 MB).
const BUCKET_SIZES: [usize; 6] = [
    1024,          // small headers / gamer-ish spare bucket
    128 * 1024,    // typical download_chunk slice
    1024 * 1024,   // 1 MB upload-tiering chunk
    2 * 1024 * 1024,
    6 * 1024 * 1024,
    8 * 1024 * 1024,
];

/// Pool of immutable, pre-filled pseudo-random byte buffers.
///
/// Buffers are filled once at construction time from a fast, non-cryptographic
/// PRNG and never mutated afterward; callers slice out of them with
/// [`PayloadPool::take`], which is a cheap [`Bytes::slice`] (refcounted, no
/// copy) plus, when `len` doesn't land on a bucket boundary, a final memcpy
/// of at most one bucket's worth of bytes.
pub struct PayloadPool {
    buckets: Vec<Bytes>,
}

impl PayloadPool {
    /// Build a pool seeded from `seed`. Same seed -> same bytes, which keeps
    /// test assertions about payload shape deterministic.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let buckets = BUCKET_SIZES
            .iter()
            .map(|&sz| {
                let mut buf = vec![0u8; sz];
                rng.fill_bytes(&mut buf);
                Bytes::from(buf)
            })
            .collect();
        Self { buckets }
    }

    /// Build a pool seeded from OS entropy, for normal (non-test) use.
    #[must_use]
    pub fn from_os_entropy() -> Self {
        Self::new(rand::thread_rng().gen())
    }

    /// Return `len` bytes of pseudo-random payload.
    ///
    /// Picks the smallest bucket that covers `len` and slices it; if `len`
    /// exceeds the largest bucket, falls back to concatenating whole buckets
    /// (only relevant for payloads far larger than any envelope this crate
    /// ever emits in one frame).
    #[must_use]
    pub fn take(&self, len: usize) -> Bytes {
        if let Some(bucket) = self.buckets.iter().find(|b| b.len() >= len) {
            return bucket.slice(0..len);
        }
        // len exceeds every bucket: tile the largest one. This keeps the
        // "never call the crypto RNG on the hot path" guarantee even for
        // unreasonably large requests, at the cost of a copy.
        let largest = self.buckets.last().expect("buckets is non-empty");
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let need = len - out.len();
            out.extend_from_slice(&largest[..need.min(largest.len())]);
        }
        Bytes::from(out)
    }

    /// Generate a small amount of jitter-worthy entropy directly (e.g. packet
    /// size within an envelope's `[min,max]` range). Not pool-backed since
    /// it's a handful of bytes of state, not a payload.
    #[must_use]
    pub fn random_size_in(min: u16, max: u16, seed_rng: &mut impl RngCore) -> u16 {
        if min >= max {
            return min;
        }
        min + (seed_rng.next_u32() % u32::from(max - min + 1)) as u16
    }
}

impl Default for PayloadPool {
    fn default() -> Self {
        Self::from_os_entropy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_returns_requested_length() {
        let pool = PayloadPool::new(42);
        for len in [64usize, 128, 4096, 1_500_000] {
            assert_eq!(pool.take(len).len(), len);
        }
    }

    #[test]
    fn same_seed_is_deterministic() {
        let a = PayloadPool::new(7);
        let b = PayloadPool::new(7);
        assert_eq!(a.take(256), b.take(256));
    }

    #[test]
    fn oversized_request_tiles_largest_bucket() {
        let pool = PayloadPool::new(1);
        let len = 20 * 1024 * 1024;
        assert_eq!(pool.take(len).len(), len);
    }

    #[test]
    fn random_size_in_respects_bounds() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(5);
        for _ in 0..1000 {
            let sz = PayloadPool::random_size_in(64, 128, &mut rng);
            assert!((64..=128).contains(&sz));
        }
    }
}
