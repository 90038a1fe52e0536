//! Golomb-coded set.
//!
//! Compact probabilistic membership structure for the server setup message.
//! Elements are 64-bit hashes reduced into a range sized from the target
//! false-positive rate, sorted, and delta-encoded with Rice coding. No false
//! negatives; false positives bounded by the configured rate.

use serde::{Deserialize, Serialize};

/// Maximum Rice parameter we will ever pick. 2^58 per-element range keeps
/// `count << rice_param` comfortably inside u64 for realistic set sizes.
const MAX_RICE_PARAM: u8 = 58;

/// A Golomb-coded set over reduced 64-bit element hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GolombCodedSet {
    rice_param: u8,
    num_elements: u32,
    hash_range: u64,
    bit_len: u64,
    data: Vec<u8>,
}

impl GolombCodedSet {
    /// Build from full 64-bit element hashes and a per-probe false-positive
    /// rate. The rate must be in (0, 1).
    pub fn build(element_hashes: &[u64], false_positive_rate: f64) -> Self {
        let rice_param = rice_param_for(false_positive_rate);
        // Range sized so the expected gap between sorted values is 2^k,
        // which is where Rice coding with parameter k is optimal.
        let count = element_hashes.len().max(1) as u64;
        let hash_range = count.saturating_mul(1u64 << rice_param).max(1);

        let mut values: Vec<u64> = element_hashes.iter().map(|h| h % hash_range).collect();
        values.sort_unstable();
        values.dedup();

        let mut writer = BitWriter::new();
        let mut previous = 0u64;
        for &value in &values {
            writer.write_rice(value - previous, rice_param);
            previous = value;
        }
        let (data, bit_len) = writer.finish();

        Self {
            rice_param,
            num_elements: values.len() as u32,
            hash_range,
            bit_len,
            data,
        }
    }

    /// Range the stored hashes were reduced into. Queries must reduce their
    /// candidate hash by the same modulus.
    pub fn hash_range(&self) -> u64 {
        self.hash_range
    }

    /// Number of encoded elements.
    pub fn num_elements(&self) -> usize {
        self.num_elements as usize
    }

    /// Decode every stored value. Callers doing repeated membership tests
    /// should decode once and query a set.
    pub fn values(&self) -> Vec<u64> {
        let mut reader = BitReader::new(&self.data, self.bit_len);
        let mut values = Vec::with_capacity(self.num_elements as usize);
        let mut previous = 0u64;
        for _ in 0..self.num_elements {
            match reader.read_rice(self.rice_param) {
                Some(delta) => {
                    previous += delta;
                    values.push(previous);
                }
                // Truncated data: surface what decoded cleanly rather than
                // inventing values.
                None => break,
            }
        }
        values
    }

    /// Membership test for a full 64-bit element hash.
    pub fn contains(&self, element_hash: u64) -> bool {
        let reduced = element_hash % self.hash_range;
        self.values().binary_search(&reduced).is_ok()
    }
}

/// Rice parameter closest to the target rate: k such that 2^-k <= rate.
fn rice_param_for(false_positive_rate: f64) -> u8 {
    let rate = false_positive_rate.clamp(f64::MIN_POSITIVE, 0.5);
    let k = (1.0 / rate).log2().ceil() as u8;
    k.clamp(1, MAX_RICE_PARAM)
}

struct BitWriter {
    data: Vec<u8>,
    bit_len: u64,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            bit_len: 0,
        }
    }

    fn write_bit(&mut self, bit: bool) {
        let byte_index = (self.bit_len / 8) as usize;
        if byte_index == self.data.len() {
            self.data.push(0);
        }
        if bit {
            self.data[byte_index] |= 1 << (self.bit_len % 8);
        }
        self.bit_len += 1;
    }

    /// Rice code: quotient in unary (q ones, then a zero), remainder in
    /// `param` binary bits, least-significant first.
    fn write_rice(&mut self, value: u64, param: u8) {
        let quotient = value >> param;
        for _ in 0..quotient {
            self.write_bit(true);
        }
        self.write_bit(false);
        for bit in 0..param {
            self.write_bit(value & (1 << bit) != 0);
        }
    }

    fn finish(self) -> (Vec<u8>, u64) {
        (self.data, self.bit_len)
    }
}

struct BitReader<'a> {
    data: &'a [u8],
    bit_len: u64,
    position: u64,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8], bit_len: u64) -> Self {
        Self {
            data,
            bit_len: bit_len.min(data.len() as u64 * 8),
            position: 0,
        }
    }

    fn read_bit(&mut self) -> Option<bool> {
        if self.position >= self.bit_len {
            return None;
        }
        let byte = self.data[(self.position / 8) as usize];
        let bit = byte & (1 << (self.position % 8)) != 0;
        self.position += 1;
        Some(bit)
    }

    fn read_rice(&mut self, param: u8) -> Option<u64> {
        let mut quotient = 0u64;
        while self.read_bit()? {
            quotient += 1;
        }
        let mut remainder = 0u64;
        for bit in 0..param {
            if self.read_bit()? {
                remainder |= 1 << bit;
            }
        }
        Some((quotient << param) | remainder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_set() {
        let gcs = GolombCodedSet::build(&[], 0.001);
        assert_eq!(gcs.num_elements(), 0);
        assert!(gcs.values().is_empty());
        assert!(!gcs.contains(42));
    }

    #[test]
    fn test_members_always_found() {
        let hashes = vec![u64::MAX, 0, 17, 123_456_789, 17];
        let gcs = GolombCodedSet::build(&hashes, 0.001);

        for &h in &hashes {
            assert!(gcs.contains(h), "member {} must be found", h);
        }
    }

    #[test]
    fn test_values_sorted_and_deduplicated() {
        let gcs = GolombCodedSet::build(&[900, 4, 4, 250], 0.001);
        let values = gcs.values();

        let mut sorted = values.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(values, sorted);
    }

    #[test]
    fn test_rice_param_tracks_rate() {
        assert_eq!(rice_param_for(0.5), 1);
        assert_eq!(rice_param_for(0.001), 10);
        assert_eq!(rice_param_for(0.000001), 20);
        // Degenerate rates clamp instead of exploding
        assert_eq!(rice_param_for(0.0), MAX_RICE_PARAM);
    }

    #[test]
    fn test_false_positive_rate_plausible() {
        // 1000 members at 1% rate: non-members should mostly miss.
        let members: Vec<u64> = (0..1000u64).map(|i| i.wrapping_mul(0x9E3779B97F4A7C15)).collect();
        let gcs = GolombCodedSet::build(&members, 0.01);

        let probes = 10_000u64;
        let false_positives = (0..probes)
            .map(|i| (i + 1).wrapping_mul(0xD1B54A32D192ED03))
            .filter(|h| gcs.contains(*h))
            .count();

        // Expected ~100; 400 would mean the structure is broken
        assert!(
            false_positives < 400,
            "false positive count {} way above target",
            false_positives
        );
    }

    proptest! {
        /// Property: no false negatives, for any hash set and rate
        #[test]
        fn no_false_negatives(
            hashes in prop::collection::vec(any::<u64>(), 0..200),
            rate_exp in 1u32..20,
        ) {
            let rate = 2f64.powi(-(rate_exp as i32));
            let gcs = GolombCodedSet::build(&hashes, rate);
            for &h in &hashes {
                prop_assert!(gcs.contains(h));
            }
        }

        /// Property: decoded element count matches distinct reduced values
        #[test]
        fn element_count_matches(hashes in prop::collection::vec(any::<u64>(), 0..200)) {
            let gcs = GolombCodedSet::build(&hashes, 0.001);
            prop_assert_eq!(gcs.values().len(), gcs.num_elements());
        }
    }
}
