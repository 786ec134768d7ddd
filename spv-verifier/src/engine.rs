use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info, trace, warn};
use spv_types::Header;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bootstrap;
use crate::config::Config;
use crate::error::{ChainError, StoreError};
use crate::extender::Extender;
use crate::peers::{HeaderRecord, PeerChannels, PeerPool};
use crate::rules::Rules;
use crate::store::HeaderStore;

/// Cooperative cancellation flag, checked between polls. In-flight I/O is
/// never interrupted; the next polling boundary ends the task.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The verifier: owns the header store and the peer pool, and drives chain
/// extension from peer tip notifications.
pub struct Verifier {
    store: Arc<HeaderStore>,
    pool: PeerPool,
    extender: Extender,
    stop: StopSignal,
    tip_tx: watch::Sender<Option<u64>>,
    tip_rx: watch::Receiver<Option<u64>>,
}

impl Verifier {
    /// Fetches the bootstrap archive if the header file is missing, opens
    /// the store, and prepares an empty peer pool.
    pub async fn bootstrap(config: Config) -> Result<Self, ChainError> {
        let path = config.headers_path();
        bootstrap::init_headers_file(&path, &config).await?;

        let store = Arc::new(HeaderStore::open(&path)?);
        let rules = Rules::new(Arc::clone(&store), config.skip_pow_verification);
        if config.validate_archive {
            bootstrap::validate_archive(&store, &rules)?;
        }
        info!(target: "verifier", "blocks: {:?}", store.tip_height());

        let extender = Extender::new(Arc::clone(&store), rules, config.max_reorg_depth);
        let (tip_tx, tip_rx) = watch::channel(store.tip_height());

        Ok(Self {
            pool: PeerPool::new(&config),
            store,
            extender,
            stop: StopSignal::default(),
            tip_tx,
            tip_rx,
        })
    }

    /// Registers a peer before start, handing back the channel ends its
    /// transport task drives.
    pub fn add_peer(&mut self, name: impl Into<String>) -> PeerChannels {
        self.pool.register(name)
    }

    pub fn tip_height(&self) -> Option<u64> {
        self.store.tip_height()
    }

    /// Spawns the verifier loop.
    pub fn start(self) -> VerifierHandle {
        let store = Arc::clone(&self.store);
        let stop = self.stop.clone();
        let tip_rx = self.tip_rx.clone();
        let task = tokio::spawn(self.run());
        VerifierHandle {
            store,
            stop,
            tip_rx,
            task,
        }
    }

    async fn run(mut self) -> Result<(), ChainError> {
        info!(target: "verifier", "verifier running with {} peers", self.pool.len());

        while !self.stop.is_stopped() {
            let Some((peer, record)) = self.pool.next_tip(&self.stop).await else {
                break;
            };

            match self.is_stale(&record) {
                Ok(false) => {}
                Ok(true) => {
                    trace!(
                        target: "verifier",
                        "tip {} from {} is not news",
                        record.block_height,
                        self.pool.name(peer)
                    );
                    continue;
                }
                Err(err) => {
                    error!(target: "verifier", "stopping on store failure: {err}");
                    self.stop.stop();
                    return Err(err.into());
                }
            }

            match self
                .extender
                .extend(&mut self.pool, peer, record.into_extended(), &self.stop)
                .await
            {
                Ok(Some(new_tip)) => {
                    info!(
                        target: "verifier",
                        "height: {new_tip} via {}",
                        self.pool.name(peer)
                    );
                    self.tip_tx.send_replace(Some(new_tip));
                }
                Ok(None) => {}
                Err(err) if err.is_fatal() => {
                    error!(target: "verifier", "stopping on store failure: {err}");
                    self.stop.stop();
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        target: "verifier",
                        "discarding chain from {}: {err}",
                        self.pool.name(peer)
                    );
                    if err.flags_peer() {
                        self.pool.flag(peer);
                    }
                }
            }
        }

        info!(target: "verifier", "verifier stopped");
        Ok(())
    }

    /// A candidate is stale when it sits below the local tip, or at the tip
    /// with the hash the store already has. An equal-height candidate with a
    /// different hash is a competing branch and is worth a walk.
    fn is_stale(&self, record: &HeaderRecord) -> Result<bool, StoreError> {
        let Some(tip) = self.store.tip_height() else {
            return Ok(false);
        };
        let height = record.block_height;
        if height != tip {
            return Ok(height < tip);
        }
        Ok(self
            .store
            .read_header(height)?
            .is_some_and(|stored| stored.block_hash() == record.header.block_hash()))
    }
}

/// Handle onto a running verifier.
pub struct VerifierHandle {
    store: Arc<HeaderStore>,
    stop: StopSignal,
    tip_rx: watch::Receiver<Option<u64>>,
    task: JoinHandle<Result<(), ChainError>>,
}

impl VerifierHandle {
    /// Asks the verifier to stop; it exits at its next polling boundary.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn is_running(&self) -> bool {
        !self.stop.is_stopped() && !self.task.is_finished()
    }

    pub fn tip_height(&self) -> Option<u64> {
        self.store.tip_height()
    }

    pub fn read_header(&self, height: u64) -> Result<Option<Header>, StoreError> {
        self.store.read_header(height)
    }

    /// Watch channel carrying every committed tip height.
    pub fn tip_events(&self) -> watch::Receiver<Option<u64>> {
        self.tip_rx.clone()
    }

    /// Waits for the verifier task; surfaces a fatal store error.
    pub async fn join(self) -> Result<(), ChainError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Ok(()),
            Err(err) => std::panic::resume_unwind(err.into_panic()),
        }
    }
}
