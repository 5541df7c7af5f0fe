//! Hash-derived bucket addressing.
//!
//! An item's identifier is hashed with BLAKE3 and the digest is consumed as
//! lowercase hex from the most significant nibble. Bit widths are multiples
//! of four, so every addressing level is a whole number of hex characters
//! and a bucket's cache-key is always a prefix of the hex digest of every
//! item it owns.

use std::fmt;

use crate::error::{PackerError, PackerResult};

/// Width of the item hash in bits.
pub const HASH_BITS: u32 = 256;

/// 256-bit digest of an item identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemHash([u8; 32]);

impl ItemHash {
    pub fn of(id: &str) -> Self {
        Self(*blake3::hash(id.as_bytes()).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Hex rendering of `width_bits` bits starting `offset_bits` from the top.
    ///
    /// Returns `None` when the range runs past the end of the digest. Both
    /// arguments must be multiples of four.
    pub fn hex_range(&self, offset_bits: u32, width_bits: u32) -> Option<String> {
        if offset_bits + width_bits > HASH_BITS || offset_bits % 4 != 0 || width_bits % 4 != 0 {
            return None;
        }
        let start = (offset_bits / 4) as usize;
        let end = ((offset_bits + width_bits) / 4) as usize;
        let mut out = String::with_capacity(end - start);
        for nibble in start..end {
            let byte = self.0[nibble / 2];
            let value = if nibble % 2 == 0 { byte >> 4 } else { byte & 0x0f };
            out.push(char::from_digit(value as u32, 16).unwrap_or('0'));
        }
        Some(out)
    }
}

impl fmt::Debug for ItemHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ItemHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Maps identifiers to primary-bucket and shard indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HashAddresser {
    base_bits: u32,
    shard_bits: u32,
}

impl HashAddresser {
    pub fn new(base_bits: u32, shard_bits: u32) -> PackerResult<Self> {
        for (name, bits) in [("base bits", base_bits), ("shard bits", shard_bits)] {
            if bits < 4 {
                return Err(PackerError::InvalidArgument(format!(
                    "{name} should be at least 4, got {bits}"
                )));
            }
            if bits % 4 != 0 {
                return Err(PackerError::InvalidArgument(format!(
                    "{name} {bits} is not a multiple of 4"
                )));
            }
        }
        if base_bits + shard_bits > HASH_BITS {
            return Err(PackerError::InvalidArgument(format!(
                "base bits {base_bits} plus shard bits {shard_bits} exceed the {HASH_BITS}-bit hash"
            )));
        }
        Ok(Self {
            base_bits,
            shard_bits,
        })
    }

    pub fn base_bits(&self) -> u32 {
        self.base_bits
    }

    pub fn shard_bits(&self) -> u32 {
        self.shard_bits
    }

    pub fn hash(&self, id: &str) -> ItemHash {
        ItemHash::of(id)
    }

    /// Address of the primary bucket owning `id`, relative to the storage prefix.
    pub fn primary_index(&self, id: &str) -> String {
        self.primary_of(&ItemHash::of(id))
    }

    pub fn primary_of(&self, hash: &ItemHash) -> String {
        // base_bits <= HASH_BITS is checked at construction.
        hash.hex_range(0, self.base_bits).unwrap_or_default()
    }

    /// Shard index of `id` below a bucket at `depth`, or `None` once the hash
    /// is exhausted.
    pub fn shard_index(&self, id: &str, depth: u32) -> Option<String> {
        let offset = self.base_bits + depth * self.shard_bits;
        ItemHash::of(id).hex_range(offset, self.shard_bits)
    }

    /// Greatest depth a bucket can reach with these widths.
    pub fn max_depth(&self) -> u32 {
        (HASH_BITS - self.base_bits) / self.shard_bits
    }
}
