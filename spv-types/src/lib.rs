pub mod hash;
pub mod header;
mod u256;

pub use hash::{double_sha256, H256};
pub use header::{
    bits_to_target, CodecError, ExtendedHeader, Header, Target, MAX_ADJUSTMENT_FACTOR, MAX_BITS,
    MAX_TARGET, RETARGET_INTERVAL, TARGET_TIMESPAN_SECS,
};
pub use u256::U256;
