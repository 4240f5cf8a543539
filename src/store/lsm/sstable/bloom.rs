//! Per-table bloom filter.
//!
//! Built from every user key written into an SSTable and consulted before
//! any index or block work on point lookups: a negative answer proves the
//! key is absent from the table, a positive answer may be wrong at the
//! configured false-positive rate.
//!
//! Uses double hashing (`h1 + i * h2` over two independent 32-bit FNV-1a
//! hashes) with `k = round(bits_per_key * ln 2)` probes.
//!
//! Serialized as `k:u8 | bitset_len:u32 | bitset_bytes`.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

use crate::error::Result;
use crate::Error;

const MIN_BITS: usize = 64;
const MAX_PROBES: u32 = 30;

/// Accumulates key hashes while a table is being written; the bit array is
/// sized from the final key count.
pub struct BloomBuilder {
    bits_per_key: usize,
    hashes: Vec<(u32, u32)>,
}

impl BloomBuilder {
    pub fn new(bits_per_key: usize) -> Self {
        Self {
            bits_per_key,
            hashes: Vec::new(),
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.hashes.push(hash_pair(key));
    }

    pub fn key_count(&self) -> usize {
        self.hashes.len()
    }

    pub fn finish(self) -> BloomFilter {
        let num_bits = (self.hashes.len() * self.bits_per_key).max(MIN_BITS);
        let num_probes = ((self.bits_per_key as f64) * std::f64::consts::LN_2)
            .round()
            .max(1.0)
            .min(MAX_PROBES as f64) as u32;

        let mut bits = vec![0u8; num_bits.div_ceil(8)];
        let num_bits = (bits.len() * 8) as u32;

        for (h1, h2) in &self.hashes {
            for i in 0..num_probes {
                let bit = h1.wrapping_add(i.wrapping_mul(*h2)) % num_bits;
                bits[(bit / 8) as usize] |= 1 << (bit % 8);
            }
        }

        BloomFilter {
            num_probes: num_probes as u8,
            bits,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    num_probes: u8,
    bits: Vec<u8>,
}

impl BloomFilter {
    /// Returns `true` if the key may be in the table, `false` if it is
    /// definitely absent. Never returns a false negative.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let num_bits = (self.bits.len() * 8) as u32;
        if num_bits == 0 {
            return true;
        }
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_probes as u32 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % num_bits;
            if self.bits[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 4 + self.bits.len());
        buf.write_u8(self.num_probes).unwrap();
        buf.write_u32::<BigEndian>(self.bits.len() as u32).unwrap();
        buf.extend_from_slice(&self.bits);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let num_probes = cursor.read_u8()?;
        let bitset_len = cursor.read_u32::<BigEndian>()? as usize;
        if bitset_len != data.len().saturating_sub(5) {
            return Err(Error::Corruption(format!(
                "bloom filter bitset length {} does not match block size {}",
                bitset_len,
                data.len()
            )));
        }
        let mut bits = vec![0u8; bitset_len];
        cursor.read_exact(&mut bits)?;
        Ok(Self { num_probes, bits })
    }
}

/// Two independent 32-bit FNV-1a hashes with different bases.
fn hash_pair(key: &[u8]) -> (u32, u32) {
    (fnv1a_32(key, 0x811c9dc5), fnv1a_32(key, 0x517cc1b7))
}

fn fnv1a_32(data: &[u8], basis: u32) -> u32 {
    const FNV_PRIME: u32 = 0x01000193;
    let mut hash = basis;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(keys: &[&[u8]], bits_per_key: usize) -> BloomFilter {
        let mut builder = BloomBuilder::new(bits_per_key);
        for key in keys {
            builder.add_key(key);
        }
        builder.finish()
    }

    #[test]
    fn test_no_false_negatives() {
        let keys: Vec<Vec<u8>> = (0..1000).map(|i| format!("key_{i:05}").into_bytes()).collect();
        let mut builder = BloomBuilder::new(10);
        for key in &keys {
            builder.add_key(key);
        }
        let filter = builder.finish();

        for key in &keys {
            assert!(filter.may_contain(key), "inserted key reported absent");
        }
    }

    #[test]
    fn test_false_positive_rate_is_low() {
        let mut builder = BloomBuilder::new(10);
        for i in 0..10_000 {
            builder.add_key(format!("present_{i}").as_bytes());
        }
        let filter = builder.finish();

        let mut false_positives = 0;
        for i in 0..10_000 {
            if filter.may_contain(format!("absent_{i}").as_bytes()) {
                false_positives += 1;
            }
        }
        // ~1% expected at 10 bits/key; 3% leaves headroom for hash quality.
        assert!(
            false_positives < 300,
            "false positive rate too high: {false_positives}/10000"
        );
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let filter = build(&[b"apple", b"banana", b"cherry"], 10);
        let encoded = filter.encode();
        let decoded = BloomFilter::decode(&encoded).expect("Failed to decode");
        assert_eq!(decoded, filter);
        assert!(decoded.may_contain(b"apple"));
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        let filter = build(&[b"apple"], 10);
        let mut encoded = filter.encode();
        encoded.truncate(encoded.len() - 1);
        assert!(matches!(
            BloomFilter::decode(&encoded),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_empty_filter() {
        let filter = build(&[], 10);
        // An empty table's filter answers "maybe" without panicking.
        let encoded = filter.encode();
        let decoded = BloomFilter::decode(&encoded).unwrap();
        let _ = decoded.may_contain(b"anything");
    }
}
