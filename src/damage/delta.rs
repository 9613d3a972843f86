//! Delta cache.
//!
//! The last few transmitted frames of a surface are fingerprinted and
//! kept; when a new frame differs from a cached one in only a small part
//! of its bytes, the XOR goes out instead of the pixels. Zeros dominate
//! the XOR, so the chunk compressor collapses it. The client keeps the
//! same cache keyed by the fingerprints it was told to store.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::encode::image::fnv1a;

/// How many recent frames to keep per surface.
pub const DELTA_CACHE_SIZE: usize = 5;

/// A delta pays off only when at most this percentage of bytes changed.
const MAX_CHANGED_PERCENT: usize = 20;

#[derive(Debug, Clone)]
struct CachedFrame {
    hash: u64,
    data: Bytes,
}

#[derive(Debug, Default)]
pub struct DeltaCache {
    frames: VecDeque<CachedFrame>,
}

/// A computed delta against a cached frame.
#[derive(Debug)]
pub struct Delta {
    /// Fingerprint of the reference frame the client must XOR against.
    pub reference: u64,
    /// Fingerprint the client stores the reconstructed frame under.
    pub store: u64,
    pub xor: Bytes,
}

impl DeltaCache {
    pub fn new() -> DeltaCache {
        DeltaCache::default()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// True when the exact frame was already transmitted; the caller may
    /// skip the emission entirely.
    pub fn contains(&self, hash: u64) -> bool {
        self.frames.iter().any(|f| f.hash == hash)
    }

    /// Remembers a transmitted frame, evicting the oldest beyond
    /// [`DELTA_CACHE_SIZE`].
    pub fn insert(&mut self, data: Bytes) -> u64 {
        let hash = fnv1a(&data);
        if self.contains(hash) {
            return hash;
        }
        self.frames.push_back(CachedFrame { hash, data });
        while self.frames.len() > DELTA_CACHE_SIZE {
            self.frames.pop_front();
        }
        hash
    }

    /// Finds the cached frame yielding the cheapest XOR against `data`,
    /// if any pays off.
    pub fn best_delta(&self, data: &[u8]) -> Option<Delta> {
        let store = fnv1a(data);
        let mut best: Option<(usize, &CachedFrame)> = None;
        for frame in &self.frames {
            if frame.data.len() != data.len() || frame.hash == store {
                continue;
            }
            let changed = frame
                .data
                .iter()
                .zip(data.iter())
                .filter(|(a, b)| a != b)
                .count();
            if changed * 100 <= data.len() * MAX_CHANGED_PERCENT
                && best.map_or(true, |(c, _)| changed < c)
            {
                best = Some((changed, frame));
            }
        }
        let (_, reference) = best?;
        let xor: Vec<u8> = reference
            .data
            .iter()
            .zip(data.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        Some(Delta {
            reference: reference.hash,
            store,
            xor: Bytes::from(xor),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn frame(len: usize, tweak: &[(usize, u8)]) -> Bytes {
        let mut data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        for (pos, val) in tweak {
            data[*pos] = *val;
        }
        Bytes::from(data)
    }

    #[test]
    fn test_eviction_keeps_latest() {
        let mut cache = DeltaCache::new();
        let mut hashes = Vec::new();
        for i in 0..7 {
            hashes.push(cache.insert(frame(64, &[(0, i as u8)])));
        }
        assert_eq!(cache.len(), DELTA_CACHE_SIZE);
        assert!(!cache.contains(hashes[0]));
        assert!(!cache.contains(hashes[1]));
        assert!(cache.contains(hashes[6]));
    }

    #[test]
    fn test_small_change_produces_delta() {
        let mut cache = DeltaCache::new();
        let base = frame(1000, &[]);
        let base_hash = cache.insert(base.clone());

        let changed = frame(1000, &[(10, 0xff), (11, 0xfe)]);
        let delta = cache.best_delta(&changed).unwrap();
        assert_eq!(delta.reference, base_hash);
        assert_eq!(delta.xor.len(), 1000);
        // The XOR reconstructs the new frame from the old one.
        let rebuilt: Vec<u8> = base
            .iter()
            .zip(delta.xor.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        assert_eq!(&rebuilt[..], &changed[..]);
        // Almost everything is zero.
        assert_eq!(delta.xor.iter().filter(|b| **b != 0).count(), 2);
    }

    #[test]
    fn test_large_change_is_rejected() {
        let mut cache = DeltaCache::new();
        cache.insert(frame(100, &[]));
        let noise: Bytes = Bytes::from((0..100).map(|i| (i * 7 + 3) as u8).collect::<Vec<_>>());
        assert!(cache.best_delta(&noise).is_none());
    }

    #[test]
    fn test_size_mismatch_is_rejected() {
        let mut cache = DeltaCache::new();
        cache.insert(frame(100, &[]));
        assert!(cache.best_delta(&frame(200, &[])).is_none());
    }

    #[test]
    fn test_identical_frame_detected() {
        let mut cache = DeltaCache::new();
        let data = frame(128, &[]);
        let hash = cache.insert(data.clone());
        assert!(cache.contains(hash));
        // Identical content is not offered as a delta of itself.
        assert!(cache.best_delta(&data).is_none());
    }
}
