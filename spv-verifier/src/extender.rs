use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, info};
use spv_types::ExtendedHeader;

use crate::engine::StopSignal;
use crate::error::ChainError;
use crate::peers::{PeerId, PeerPool};
use crate::rules::Rules;
use crate::store::HeaderStore;

/// Assembles candidate chains announced by peers and commits them.
///
/// One extension attempt runs at a time; the verifier loop calls `extend`
/// and other peers' notifications wait in their queues meanwhile.
pub struct Extender {
    store: Arc<HeaderStore>,
    rules: Rules,
    max_reorg_depth: u64,
}

impl Extender {
    pub fn new(store: Arc<HeaderStore>, rules: Rules, max_reorg_depth: u64) -> Self {
        Self {
            store,
            rules,
            max_reorg_depth,
        }
    }

    /// Walks back from a candidate tip, requesting ancestors from the
    /// announcing peer, until the chain connects to the store; validates it
    /// end to end; commits it in one store transaction.
    ///
    /// A stored header whose hash disagrees with the candidate's ancestry is
    /// a reorg: the walk continues past it and the commit later overwrites
    /// it. `Ok(None)` means the attempt was abandoned because the engine is
    /// stopping; nothing was written.
    pub async fn extend(
        &self,
        pool: &mut PeerPool,
        peer: PeerId,
        candidate: ExtendedHeader,
        stop: &StopSignal,
    ) -> Result<Option<u64>, ChainError> {
        let mut chain = VecDeque::from([candidate]);
        let mut need_parent = false;

        loop {
            if stop.is_stopped() {
                return Ok(None);
            }

            if need_parent {
                if chain.len() as u64 > self.max_reorg_depth {
                    return Err(ChainError::ReorgTooDeep(self.max_reorg_depth));
                }
                let want = chain.front().expect("chain is never empty").block_height - 1;
                let record = pool.fetch_header(peer, want, stop).await?;
                if record.block_height != want {
                    return Err(ChainError::WrongHeader {
                        want,
                        got: record.block_height,
                    });
                }
                chain.push_front(record.into_extended());
                need_parent = false;
            }

            let first = chain.front().expect("chain is never empty");
            if first.block_height == 0 {
                // Rooted at genesis; nothing earlier to connect to.
                break;
            }
            match self.store.read_header(first.block_height - 1)? {
                None => need_parent = true,
                Some(prev) => {
                    if prev.block_hash() == first.block_header.prev_block_hash {
                        break;
                    }
                    debug!(
                        target: "verifier",
                        "reorg: stored height {} disagrees with {}",
                        first.block_height - 1,
                        pool.name(peer)
                    );
                    need_parent = true;
                }
            }
        }

        let chain = chain.make_contiguous();
        self.rules.validate_chain(chain)?;

        let tip = self.store.commit(chain)?;
        info!(
            target: "verifier",
            "committed {} headers from {}, tip {:?}",
            chain.len(),
            pool.name(peer),
            tip
        );
        Ok(tip)
    }
}
