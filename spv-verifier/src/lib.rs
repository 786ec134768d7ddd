//! SPV header-chain verification engine.
//!
//! Maintains a flat file of 80-byte Bitcoin block headers, extends it from
//! untrusted Electrum-style peers, and validates every accepted header
//! against the proof-of-work and difficulty-retarget consensus rules. Peer
//! transports are external: they register through [`Verifier::add_peer`] and
//! speak to the engine over typed queues.

pub mod bootstrap;
pub mod config;
pub mod engine;
pub mod error;
pub mod extender;
pub mod peers;
pub mod rules;
pub mod store;

pub use config::Config;
pub use engine::{StopSignal, Verifier, VerifierHandle};
pub use error::{ChainError, PeerError, StoreError};
pub use peers::{HeaderRecord, HeaderReply, PeerChannels, PeerRequest, RpcError};
pub use rules::Rules;
pub use store::HeaderStore;
