use spv_types::CodecError;
use thiserror::Error;

/// Faults of the header file itself. Unlike peer-level errors these are not
/// recoverable: the engine stops rather than keep serving a broken store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("header store i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("header file length {0} is not a multiple of 80")]
    Corrupt(u64),
    #[error("chunk must be {expected} bytes, got {actual}")]
    ChunkSize { expected: usize, actual: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("peer timed out")]
    Timeout,
    #[error("peer channel closed")]
    Disconnected,
    #[error("engine stopping")]
    Stopped,
}

/// Everything that can end a chain-extension attempt.
#[derive(Error, Debug)]
pub enum ChainError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("header at height {0} does not link to its predecessor")]
    LinkMismatch(u64),
    #[error("header at height {height} carries bits {actual:#010x}, expected {expected:#010x}")]
    BadBits {
        height: u64,
        expected: u32,
        actual: u32,
    },
    #[error("header at height {0} does not meet its target")]
    InsufficientWork(u64),
    #[error("no stored header at height {0} to retarget against")]
    MissingHeader(u64),
    #[error("peer answered with height {got}, requested {want}")]
    WrongHeader { want: u64, got: u64 },
    #[error("reorg walked back more than {0} headers")]
    ReorgTooDeep(u64),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ChainError {
    /// Store faults are unrecoverable; everything else is a per-peer
    /// problem the engine survives.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChainError::Store(_))
    }

    /// Whether the peer that triggered the attempt should be flagged.
    /// Missing local retarget data and engine shutdown are not its fault.
    pub fn flags_peer(&self) -> bool {
        !matches!(
            self,
            ChainError::Store(_)
                | ChainError::MissingHeader(_)
                | ChainError::Peer(PeerError::Stopped)
        )
    }
}
