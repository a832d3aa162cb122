//! Runtime bloom filters built from join build sides.
//!
//! Filters are built at partition level 0 only and published through a
//! [`FilterBank`]. A filter whose expected false-positive rate is too high
//! for the observed build cardinality is published as always-true, which
//! costs nothing at the consumer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Runtime-filter query option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeFilterMode {
    /// Build and publish no filters.
    Off,
    /// Build filters for local consumers only.
    Local,
    /// Build filters for global aggregation at the coordinator.
    Global,
}

const BLOOM_HASHES: u32 = 4;

/// Fixed-size blocked bloom filter over 32-bit key hashes.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    words: Vec<u64>,
    mask: u64,
    always_true: bool,
}

impl BloomFilter {
    /// Create a filter with `1 << log2_bits` bits.
    pub fn with_log2_bits(log2_bits: u32) -> Self {
        let bits = 1u64 << log2_bits.clamp(6, 30);
        Self {
            words: vec![0; (bits / 64) as usize],
            mask: bits - 1,
            always_true: false,
        }
    }

    /// Total bits in the filter.
    pub fn num_bits(&self) -> u64 {
        self.mask + 1
    }

    fn bit_positions(&self, hash: u32) -> impl Iterator<Item = u64> + '_ {
        // Double hashing: derive the probe sequence from two halves of a
        // 64-bit remix of the key hash.
        let mut h = hash as u64;
        h ^= h >> 33;
        h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
        h ^= h >> 33;
        let h1 = h;
        let h2 = (h >> 32) | 1;
        (0..BLOOM_HASHES as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) & self.mask)
    }

    /// Insert a key hash.
    pub fn insert(&mut self, hash: u32) {
        if self.always_true {
            return;
        }
        let mask = self.mask;
        let mut h = hash as u64;
        h ^= h >> 33;
        h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
        h ^= h >> 33;
        let h1 = h;
        let h2 = (h >> 32) | 1;
        for i in 0..BLOOM_HASHES as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) & mask;
            self.words[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    /// Whether a key hash may be present.
    pub fn may_contain(&self, hash: u32) -> bool {
        if self.always_true {
            return true;
        }
        self.bit_positions(hash)
            .all(|bit| self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0)
    }

    /// Degrade to an always-true filter.
    pub fn set_always_true(&mut self) {
        self.always_true = true;
        self.words = Vec::new();
    }

    /// Whether the filter passes everything.
    pub fn is_always_true(&self) -> bool {
        self.always_true
    }
}

/// Expected false-positive rate of a filter of `num_bits` holding
/// `num_entries` keys.
pub fn expected_fp_rate(num_bits: u64, num_entries: u64) -> f64 {
    if num_bits == 0 {
        return 1.0;
    }
    let k = BLOOM_HASHES as f64;
    let load = num_entries as f64 * k / num_bits as f64;
    (1.0 - (-load).exp()).powf(k)
}

const FP_RATE_PUBLISH_CEILING: f64 = 0.75;

/// Whether a filter of `num_bits` is worthless for `num_entries` build rows
/// and should be published always-true instead.
pub fn fp_rate_too_high(num_bits: u64, num_entries: u64) -> bool {
    expected_fp_rate(num_bits, num_entries) > FP_RATE_PUBLISH_CEILING
}

/// Registration for one runtime filter: its id and bit width.
#[derive(Debug, Clone, Copy)]
pub struct FilterSpec {
    /// Stable filter id shared with consumers.
    pub filter_id: u32,
    /// log2 of the filter size in bits.
    pub log2_bits: u32,
}

/// Publish/consume rendezvous for runtime filters.
#[derive(Debug, Default)]
pub struct FilterBank {
    published: Mutex<HashMap<u32, Arc<BloomFilter>>>,
}

impl FilterBank {
    /// Create an empty bank.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocate a scratch filter for a producer.
    pub fn allocate_scratch(&self, spec: FilterSpec) -> BloomFilter {
        BloomFilter::with_log2_bits(spec.log2_bits)
    }

    /// Publish a completed filter. Passing an always-true filter is the
    /// producer's signal that the filter was not worth keeping.
    pub fn publish(&self, filter_id: u32, filter: BloomFilter) {
        self.published
            .lock()
            .expect("filter bank poisoned")
            .insert(filter_id, Arc::new(filter));
    }

    /// Fetch a published filter, if any.
    pub fn consume(&self, filter_id: u32) -> Option<Arc<BloomFilter>> {
        self.published
            .lock()
            .expect("filter bank poisoned")
            .get(&filter_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserted_hashes_are_found() {
        let mut f = BloomFilter::with_log2_bits(16);
        for h in (0..1000u32).map(|i| i.wrapping_mul(2654435761)) {
            f.insert(h);
        }
        for h in (0..1000u32).map(|i| i.wrapping_mul(2654435761)) {
            assert!(f.may_contain(h));
        }
    }

    #[test]
    fn absent_hashes_are_mostly_rejected() {
        let mut f = BloomFilter::with_log2_bits(16);
        for h in 0..500u32 {
            f.insert(h.wrapping_mul(2654435761));
        }
        let fp = (10_000..20_000u32)
            .filter(|h| f.may_contain(h.wrapping_mul(0x9e3779b9)))
            .count();
        assert!(fp < 1_000, "false positive count too high: {fp}");
    }

    #[test]
    fn overloaded_filters_are_flagged() {
        assert!(fp_rate_too_high(64, 1_000_000));
        assert!(!fp_rate_too_high(1 << 20, 1_000));
    }

    #[test]
    fn bank_round_trips_published_filters() {
        let bank = FilterBank::new();
        let spec = FilterSpec {
            filter_id: 3,
            log2_bits: 10,
        };
        let mut f = bank.allocate_scratch(spec);
        f.insert(42);
        bank.publish(3, f);
        let got = bank.consume(3).expect("published");
        assert!(got.may_contain(42));
        assert!(bank.consume(4).is_none());
    }
}
