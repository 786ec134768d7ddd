use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::{double_sha256, H256};
use crate::u256::U256;

pub type Target = U256;

/// Number of headers in one difficulty window.
pub const RETARGET_INTERVAL: u64 = 2016;
/// Seconds a full difficulty window is expected to take (14 days).
pub const TARGET_TIMESPAN_SECS: i64 = 14 * 24 * 60 * 60;
/// Retarget clamp: the measured timespan may deviate from the expected one
/// by at most this factor in either direction.
pub const MAX_ADJUSTMENT_FACTOR: i64 = 4;
/// Compact encoding of the proof-of-work limit.
pub const MAX_BITS: u32 = 0x1d00_ffff;
/// The proof-of-work limit, `0x00000000ffff0000...0000`.
pub const MAX_TARGET: U256 = U256::new(0x0000_0000_ffff_0000_0000_0000_0000_0000, 0);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("header must be 80 bytes, got {0}")]
    MalformedHeader(usize),
    #[error("compact target {0:#010x} has the sign bit set")]
    NegativeTarget(u32),
}

/// An 80-byte Bitcoin block header.
///
/// Hash fields are held in display byte order; `encode` reverses them into
/// the little-endian wire layout.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// Block version, repurposed for soft fork signalling.
    pub version: u32,
    /// Hash of the previous block in the chain.
    pub prev_block_hash: H256,
    /// Root of the block's transaction merkle tree.
    pub merkle_root: H256,
    /// Miner-claimed timestamp, Unix seconds.
    #[serde(rename = "timestamp")]
    pub time: u32,
    /// Compact encoding of the target this block's hash must lie below.
    pub bits: u32,
    /// Selected by the miner to bring the hash below the target.
    pub nonce: u32,
}

impl Header {
    /// Serialized length: version, prev_block_hash, merkle_root, time, bits, nonce.
    pub const SIZE: usize = 4 + 32 + 32 + 4 + 4 + 4; // 80

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(&self.prev_block_hash.reversed().0);
        out[36..68].copy_from_slice(&self.merkle_root.reversed().0);
        out[68..72].copy_from_slice(&self.time.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() != Self::SIZE {
            return Err(CodecError::MalformedHeader(data.len()));
        }

        let le_u32 = |range: std::ops::Range<usize>| {
            u32::from_le_bytes(data[range].try_into().expect("4-byte slice"))
        };
        let hash = |range: std::ops::Range<usize>| {
            let bytes: [u8; 32] = data[range].try_into().expect("32-byte slice");
            H256(bytes).reversed()
        };

        Ok(Header {
            version: le_u32(0..4),
            prev_block_hash: hash(4..36),
            merkle_root: hash(36..68),
            time: le_u32(68..72),
            bits: le_u32(72..76),
            nonce: le_u32(76..80),
        })
    }

    /// Double SHA-256 of the serialized header, in display byte order.
    #[must_use]
    pub fn block_hash(&self) -> H256 {
        double_sha256(&self.encode()).reversed()
    }

    /// The 256-bit target this header's hash must lie below.
    pub fn target(&self) -> Result<Target, CodecError> {
        bits_to_target(self.bits)
    }
}

/// Decodes a compact "bits" value into its 256-bit target.
///
/// This keeps the OpenSSL bignum quirk of the original consensus code: a
/// mantissa below `0x8000` is renormalized by one byte without touching the
/// exponent. A set sign bit is rejected; a shift past 256 bits saturates.
pub fn bits_to_target(bits: u32) -> Result<Target, CodecError> {
    if bits & 0x0080_0000 != 0 {
        return Err(CodecError::NegativeTarget(bits));
    }

    let exponent = bits >> 24;
    let mut mantissa = u64::from(bits & 0x00ff_ffff);
    if mantissa < 0x8000 {
        mantissa *= 256;
    }

    let value = U256::from(mantissa);
    let target = if exponent >= 3 {
        value.checked_shl(8 * (exponent - 3)).unwrap_or(U256::MAX)
    } else {
        value >> (8 * (3 - exponent))
    };
    Ok(target)
}

/// A header annotated with its position in the chain.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ExtendedHeader {
    pub block_header: Header,
    pub block_hash: H256,
    pub block_height: u64,
}

impl ExtendedHeader {
    pub fn from_header(block_header: Header, block_height: u64) -> Self {
        let block_hash = block_header.block_hash();
        Self {
            block_header,
            block_hash,
            block_height,
        }
    }
}
