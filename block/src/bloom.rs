//! The sharded bloom filter.
//!
//! A monolithic bloom for a large block can run to tens of megabytes; a
//! point lookup would fetch all of it. Sharding by id lets a reader fetch
//! `1/N` of the filter per probe, at the cost of per-shard overhead. The
//! shard-key function is part of the on-disk contract: writer and readers
//! must agree, and the shard count is recorded in the block manifest.
//!
//! Hashing is double-hashed FNV-1a over the id bytes so membership is
//! stable across platforms.

use crate::{Error, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use data_types::TraceId;

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

fn fnv1a64(bytes: &[u8], basis: u64) -> u64 {
    let mut hash = basis;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// The shard an id belongs to: `first 4 bytes (BE) mod shard_count`.
pub fn shard_of(id: &TraceId, shard_count: u32) -> u32 {
    BigEndian::read_u32(&id.as_bytes()[..4]) % shard_count
}

/// A classical bit-array bloom filter.
#[derive(Debug, Clone, PartialEq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    hash_count: u32,
}

impl BloomFilter {
    /// Size a filter for `expected_items` at `false_positive` rate.
    pub fn with_capacity(expected_items: usize, false_positive: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;

        let m_bits = (-n * p.ln() / (ln2 * ln2)).ceil().max(8.0) as usize;
        let k = ((m_bits as f64 / n) * ln2).round().max(1.0) as u32;

        Self {
            bits: vec![0u8; (m_bits + 7) / 8],
            hash_count: k,
        }
    }

    fn bit_positions(&self, id: &TraceId) -> impl Iterator<Item = usize> + '_ {
        let m = self.bits.len() * 8;
        let h1 = fnv1a64(id.as_bytes(), FNV_OFFSET_BASIS);
        // a second independent hash from a shifted basis
        let h2 = fnv1a64(id.as_bytes(), FNV_OFFSET_BASIS ^ 0xa5a5a5a5a5a5a5a5) | 1;
        (0..self.hash_count).map(move |i| {
            (h1.wrapping_add(u64::from(i).wrapping_mul(h2)) % m as u64) as usize
        })
    }

    /// Record `id` as a member.
    pub fn add(&mut self, id: &TraceId) {
        let positions: Vec<usize> = self.bit_positions(id).collect();
        for pos in positions {
            self.bits[pos / 8] |= 1 << (pos % 8);
        }
    }

    /// Probe for `id`. False positives possible, false negatives not.
    pub fn contains(&self, id: &TraceId) -> bool {
        self.bit_positions(id)
            .all(|pos| self.bits[pos / 8] & (1 << (pos % 8)) != 0)
    }

    /// Serialize: `u32 hash_count | u32 bits_len | bits`.
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.bits.len());
        let mut header = [0u8; 8];
        LittleEndian::write_u32(&mut header[0..4], self.hash_count);
        LittleEndian::write_u32(&mut header[4..8], self.bits.len() as u32);
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.bits);
        out
    }

    /// Parse a serialized shard.
    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(Error::BloomCorrupt {
                reason: format!("too short: {} bytes", bytes.len()),
            });
        }
        let hash_count = LittleEndian::read_u32(&bytes[0..4]);
        let bits_len = LittleEndian::read_u32(&bytes[4..8]) as usize;
        if bytes.len() != 8 + bits_len || hash_count == 0 || bits_len == 0 {
            return Err(Error::BloomCorrupt {
                reason: format!(
                    "inconsistent header: hash_count={hash_count} bits_len={bits_len} total={}",
                    bytes.len()
                ),
            });
        }
        Ok(Self {
            bits: bytes[8..].to_vec(),
            hash_count,
        })
    }
}

/// The write-side sharded filter.
#[derive(Debug)]
pub struct ShardedBloomFilter {
    shards: Vec<BloomFilter>,
}

impl ShardedBloomFilter {
    /// Create `shard_count` shards collectively sized for
    /// `expected_items` at `false_positive`.
    pub fn new(shard_count: u32, expected_items: usize, false_positive: f64) -> Self {
        let shard_count = shard_count.max(1);
        let per_shard = (expected_items / shard_count as usize).max(1);
        Self {
            shards: (0..shard_count)
                .map(|_| BloomFilter::with_capacity(per_shard, false_positive))
                .collect(),
        }
    }

    /// Number of shards.
    pub fn shard_count(&self) -> u32 {
        self.shards.len() as u32
    }

    /// Record `id` in its shard.
    pub fn add(&mut self, id: &TraceId) {
        let shard = shard_of(id, self.shard_count()) as usize;
        self.shards[shard].add(id);
    }

    /// Probe `id` against its shard.
    pub fn contains(&self, id: &TraceId) -> bool {
        let shard = shard_of(id, self.shard_count()) as usize;
        self.shards[shard].contains(id)
    }

    /// Serialize every shard, in shard order.
    pub fn marshal_shards(&self) -> Vec<Vec<u8>> {
        self.shards.iter().map(|s| s.marshal()).collect()
    }
}
