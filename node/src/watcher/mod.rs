//! Chain watchers.
//!
//! The polling loop, cursor handling and reobservation plumbing are shared by every chain. A
//! chain only provides a [`ChainSource`]: how to find the final height, and how to turn one
//! block into the bridge events it contains.

pub mod near;

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use guardian_vaa::Chain;
use log::*;
use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    time::MissedTickBehavior,
};

use crate::{
    common::{MessagePublication, ReobservationError, ReobservationRequest},
    stats::NetworkStats,
};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("http request failed")]
    Http(#[from] reqwest::Error),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("response carried neither a result nor an error")]
    EmptyResponse,

    #[error("unexpected response shape")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("observation channel closed")]
    ChannelClosed,
}

/// Chain specific half of a watcher.
#[async_trait]
pub trait ChainSource: Send {
    fn chain(&self) -> Chain;

    /// Address of the bridge contract being watched.
    fn contract(&self) -> String;

    /// Height of the latest final block.
    async fn final_height(&mut self) -> Result<u64, RpcError>;

    /// Bridge events in the block at `height`, in emission order. Events that fail to decode
    /// are logged and left out.
    async fn observations_at(&mut self, height: u64) -> Result<Vec<MessagePublication>, RpcError>;

    /// Locates `tx_hash` and extracts its bridge events again.
    async fn reobserve(
        &mut self,
        tx_hash: &[u8],
    ) -> Result<Vec<MessagePublication>, ReobservationError>;
}

pub struct Watcher<S> {
    source: S,
    chain: Chain,
    /// Next block to process. Starts at the final height when unset.
    next_height: Option<u64>,
    interval: Duration,
    observations: mpsc::Sender<MessagePublication>,
    requests: mpsc::Receiver<ReobservationRequest>,
    stats: Arc<NetworkStats>,
}

impl<S: ChainSource> Watcher<S> {
    pub fn new(
        source: S,
        observations: mpsc::Sender<MessagePublication>,
        requests: mpsc::Receiver<ReobservationRequest>,
        stats: Arc<NetworkStats>,
    ) -> Watcher<S> {
        let chain = source.chain();
        Watcher {
            source,
            chain,
            next_height: None,
            interval: Duration::from_secs(1),
            observations,
            requests,
            stats,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Watcher<S> {
        self.interval = interval;
        self
    }

    /// Resumes from a previously persisted cursor.
    pub fn starting_at(mut self, height: u64) -> Watcher<S> {
        self.next_height = Some(height);
        self
    }

    pub fn next_height(&self) -> Option<u64> {
        self.next_height
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Processes every block from the cursor up to the final height, returning how many
    /// observations were emitted. The cursor only moves past a block once all of its events
    /// were handed off.
    pub async fn poll(&mut self) -> Result<usize, WatcherError> {
        let chain = self.chain;
        let final_height = match self.source.final_height().await {
            Ok(h) => h,
            Err(e) => {
                self.stats.add_error_count(chain, 1);
                return Err(e.into());
            }
        };

        let mut next = self.next_height.unwrap_or(final_height);
        let mut emitted = 0;
        while next <= final_height {
            let found = match self.source.observations_at(next).await {
                Ok(found) => found,
                Err(e) => {
                    self.stats.add_error_count(chain, 1);
                    return Err(e.into());
                }
            };

            for msg in found {
                info!(
                    "{} message observed in block {}: {} tx {} nonce {} payload {} bytes",
                    chain,
                    next,
                    msg.message_id(),
                    hex::encode(&msg.tx_hash),
                    msg.nonce,
                    msg.payload.len()
                );
                self.observations
                    .send(msg)
                    .await
                    .map_err(|_| WatcherError::ChannelClosed)?;
                emitted += 1;
            }

            next += 1;
            self.next_height = Some(next);
        }
        self.next_height = Some(next);

        self.stats.set_height(chain, next.saturating_sub(1));
        self.stats.add_observed(chain, emitted as u64);
        self.stats.set_ready(chain, true);
        Ok(emitted)
    }

    /// Serves one reobservation request. Only a closed observation channel is an error for
    /// the watcher itself; anything else goes back to the requester.
    pub async fn handle_request(&mut self, req: ReobservationRequest) -> Result<(), WatcherError> {
        if req.chain != self.chain {
            let chain = req.chain;
            req.respond(Err(ReobservationError::UnknownChain(chain)));
            return Ok(());
        }

        let tx = hex::encode(&req.tx_hash);
        match self.source.reobserve(&req.tx_hash).await {
            Ok(found) => {
                let n = found.len();
                for msg in found {
                    self.observations
                        .send(msg)
                        .await
                        .map_err(|_| WatcherError::ChannelClosed)?;
                }
                info!("reobserved {} messages in {} tx {}", n, self.chain, tx);
                req.respond(Ok(n));
            }
            Err(e) => {
                warn!("reobservation of {} tx {} failed: {}", self.chain, tx, e);
                req.respond(Err(e));
            }
        }
        Ok(())
    }

    /// Polls on every tick and serves reobservation requests in between. Returns on shutdown or
    /// on the first RPC failure, leaving the cursor where it was. Shutdown abandons an
    /// in-flight poll or request; the cursor only covers blocks that were fully handed off.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), WatcherError> {
        self.stats.set_contract(self.chain, &self.source.contract());
        info!(
            "{} watcher watching {} from {:?}",
            self.chain,
            self.source.contract(),
            self.next_height
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                Some(req) = self.requests.recv() => tokio::select! {
                    _ = shutdown.changed() => return Ok(()),
                    res = self.handle_request(req) => res?,
                },
                _ = ticker.tick() => tokio::select! {
                    _ = shutdown.changed() => return Ok(()),
                    res = self.poll() => {
                        let _ = res?;
                    }
                },
            }
        }
    }
}

/// Runs `watcher` until shutdown, restarting it after `delay` whenever it fails. The cursor
/// survives restarts.
pub async fn supervise<S: ChainSource>(
    mut watcher: Watcher<S>,
    mut shutdown: watch::Receiver<bool>,
    delay: Duration,
) {
    let chain = watcher.chain;
    loop {
        match watcher.run(shutdown.clone()).await {
            Ok(()) => break,
            Err(WatcherError::ChannelClosed) => {
                error!("{} watcher stopped, observation channel closed", chain);
                break;
            }
            Err(e) => {
                error!("{} watcher failed: {}, restarting in {:?}", chain, e, delay);
                watcher.stats.set_ready(chain, false);
            }
        }

        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    info!("{} watcher stopped at {:?}", chain, watcher.next_height);
}

/// Hands reobservation requests to the watcher of the chain they name.
#[derive(Debug, Default, Clone)]
pub struct RequestRouter {
    routes: HashMap<Chain, mpsc::Sender<ReobservationRequest>>,
}

impl RequestRouter {
    pub fn new() -> RequestRouter {
        RequestRouter::default()
    }

    pub fn register(&mut self, chain: Chain, requests: mpsc::Sender<ReobservationRequest>) {
        let _ = self.routes.insert(chain, requests);
    }

    pub fn chains(&self) -> impl Iterator<Item = Chain> + '_ {
        self.routes.keys().copied()
    }

    /// Queues `req` without waiting. Failures are also reported on the request's reply
    /// channel.
    pub fn route(&self, req: ReobservationRequest) -> Result<(), ReobservationError> {
        let chain = req.chain;
        let Some(tx) = self.routes.get(&chain) else {
            req.respond(Err(ReobservationError::UnknownChain(chain)));
            return Err(ReobservationError::UnknownChain(chain));
        };

        match tx.try_send(req) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(req)) | Err(TrySendError::Closed(req)) => {
                req.respond(Err(ReobservationError::Unavailable(chain)));
                Err(ReobservationError::Unavailable(chain))
            }
        }
    }
}
