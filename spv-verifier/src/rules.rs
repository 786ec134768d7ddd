use std::sync::Arc;

use log::debug;
use spv_types::{
    bits_to_target, ExtendedHeader, Header, Target, H256, MAX_ADJUSTMENT_FACTOR, MAX_BITS,
    MAX_TARGET, RETARGET_INTERVAL, TARGET_TIMESPAN_SECS, U256,
};

use crate::error::{ChainError, StoreError};
use crate::store::{HeaderStore, CHUNK_BYTES};

/// Consensus checks for candidate headers against the local store.
///
/// `skip_pow` drops only the hash-below-target check and exists for tests;
/// linkage and difficulty bits are always enforced.
#[derive(Clone)]
pub struct Rules {
    store: Arc<HeaderStore>,
    skip_pow: bool,
}

impl Rules {
    pub fn new(store: Arc<HeaderStore>, skip_pow: bool) -> Self {
        Self { store, skip_pow }
    }

    /// Expected compact bits and full-precision target for an epoch.
    ///
    /// Epoch 0 is pinned to the proof-of-work limit. Later epochs scale the
    /// previous target by the time the previous window actually took,
    /// clamped to a factor of four, with truncating integer division.
    pub fn expected_target(&self, epoch: u64) -> Result<(u32, Target), ChainError> {
        if epoch == 0 {
            return Ok((MAX_BITS, MAX_TARGET));
        }

        let first = self.read_required(RETARGET_INTERVAL * (epoch - 1))?;
        let last = self.read_required(RETARGET_INTERVAL * epoch - 1)?;

        let span = TARGET_TIMESPAN_SECS;
        let actual = (i64::from(last.time) - i64::from(first.time))
            .clamp(span / MAX_ADJUSTMENT_FACTOR, span * MAX_ADJUSTMENT_FACTOR);

        let prev_target = bits_to_target(last.bits)?;
        let (scaled, overflow) = prev_target.overflowing_mul(actual as u64);
        let mut new_target = if overflow {
            MAX_TARGET
        } else {
            scaled / U256::from(span as u64)
        };
        if new_target > MAX_TARGET {
            new_target = MAX_TARGET;
        }

        Ok((new_target.target_to_bits(), new_target))
    }

    /// A header is acceptable iff it links to its predecessor, carries the
    /// epoch's expected bits, and hashes below its own target.
    pub fn validate_header(
        &self,
        header: &Header,
        height: u64,
        prev_hash: &H256,
    ) -> Result<(), ChainError> {
        if header.prev_block_hash != *prev_hash {
            return Err(ChainError::LinkMismatch(height));
        }

        let (expected_bits, _) = self.expected_target(height / RETARGET_INTERVAL)?;
        if header.bits != expected_bits {
            return Err(ChainError::BadBits {
                height,
                expected: expected_bits,
                actual: header.bits,
            });
        }

        self.check_pow(header, height, &bits_to_target(header.bits)?)
    }

    /// Validates an assembled chain front to back. The first predecessor is
    /// read from the store; a chain rooted at height 0 must hang off the
    /// all-zero hash.
    pub fn validate_chain(&self, chain: &[ExtendedHeader]) -> Result<(), ChainError> {
        let Some(first) = chain.first() else {
            return Ok(());
        };
        let mut prev_hash = if first.block_height == 0 {
            H256::ZERO
        } else {
            self.read_required(first.block_height - 1)?.block_hash()
        };
        for entry in chain {
            self.validate_header(&entry.block_header, entry.block_height, &prev_hash)?;
            prev_hash = entry.block_hash.clone();
        }
        Ok(())
    }

    /// Validates a full difficulty window with the epoch's single
    /// bits/target pair, rejecting the whole chunk on the first failure.
    pub fn validate_chunk(&self, epoch: u64, data: &[u8]) -> Result<(), ChainError> {
        if data.len() != CHUNK_BYTES {
            return Err(StoreError::ChunkSize {
                expected: CHUNK_BYTES,
                actual: data.len(),
            }
            .into());
        }

        debug!(target: "verifier", "validating headers {}", RETARGET_INTERVAL * epoch);
        let mut prev_hash = if epoch == 0 {
            H256::ZERO
        } else {
            self.read_required(RETARGET_INTERVAL * epoch - 1)?.block_hash()
        };
        let (bits, target) = self.expected_target(epoch)?;

        for (i, raw) in data.chunks_exact(Header::SIZE).enumerate() {
            let height = RETARGET_INTERVAL * epoch + i as u64;
            let header = Header::decode(raw)?;
            if header.prev_block_hash != prev_hash {
                return Err(ChainError::LinkMismatch(height));
            }
            if header.bits != bits {
                return Err(ChainError::BadBits {
                    height,
                    expected: bits,
                    actual: header.bits,
                });
            }
            self.check_pow(&header, height, &target)?;
            prev_hash = header.block_hash();
        }
        Ok(())
    }

    fn check_pow(&self, header: &Header, height: u64, target: &Target) -> Result<(), ChainError> {
        if self.skip_pow {
            return Ok(());
        }
        let hash_value = U256::from_be_bytes(&header.block_hash().0);
        if hash_value < *target {
            Ok(())
        } else {
            Err(ChainError::InsufficientWork(height))
        }
    }

    fn read_required(&self, height: u64) -> Result<Header, ChainError> {
        self.store
            .read_header(height)?
            .ok_or(ChainError::MissingHeader(height))
    }
}
