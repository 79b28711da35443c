//! Chain watcher
//!
//! One watcher runs per RPC endpoint. It follows the endpoint's block subscription, holds transfers from blocks that
//! are not final yet, and hands finalized transfers to accounts in the [`AccountIndex`] over to the engine.
//!
//! Delivery is at-least-once. After every finalized block whose transfers have all been processed, the block height
//! is saved as the endpoint's watermark. On a reconnect (or a restart) the subscription resumes from the block after
//! the watermark, so a block may be delivered twice but never skipped. The engine absorbs duplicates by transfer id.
//!
//! An endpoint seen for the first time has no watermark. The watcher then records the current finalized head as one
//! before it subscribes, so even the first reconnect has a block to resume from.
use std::{collections::BTreeMap, sync::Arc};

use futures_util::StreamExt;
use log::*;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    chain::{
        client::{BlockRef, ChainClient, ChainError, ChainEvent, ChainEventStream, ChainTransfer},
        AccountIndex,
        WatcherHealth,
    },
    db::traits::OrderStore,
    db_types::{AssetRef, OrderId},
    helpers::Backoff,
};

/// A transfer to a tracked payment account, normalised for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedTransfer {
    pub tx_id: String,
    pub chain_name: String,
    pub to_address: String,
    pub asset: AssetRef,
    pub raw_amount: u128,
    pub block_ref: BlockRef,
    pub event_index: u32,
    pub finalized: bool,
}

impl ObservedTransfer {
    pub fn new(chain_name: &str, block: &BlockRef, transfer: ChainTransfer, finalized: bool) -> Self {
        Self {
            tx_id: transfer.tx_id,
            chain_name: chain_name.to_string(),
            to_address: transfer.to,
            asset: transfer.asset,
            raw_amount: transfer.amount,
            block_ref: block.clone(),
            event_index: transfer.event_index,
            finalized,
        }
    }
}

/// A transfer on its way to the engine. The engine completes `ack` once the outcome of the transfer has been stored,
/// and drops it if processing failed in a way that a replay could fix.
#[derive(Debug)]
pub struct Delivery {
    pub order_id: OrderId,
    pub transfer: ObservedTransfer,
    pub ack: oneshot::Sender<()>,
}

pub struct ChainWatcher<C, B> {
    chain_name: String,
    client: Arc<C>,
    db: B,
    index: AccountIndex,
    deliveries: mpsc::Sender<Delivery>,
    health: watch::Sender<WatcherHealth>,
    backoff: Backoff,
    last_finalized: Option<u64>,
    held: BTreeMap<u64, (BlockRef, Vec<ChainTransfer>)>,
}

impl<C, B> ChainWatcher<C, B>
where
    C: ChainClient,
    B: OrderStore,
{
    pub fn new(
        chain_name: &str,
        client: Arc<C>,
        db: B,
        index: AccountIndex,
        deliveries: mpsc::Sender<Delivery>,
        health: watch::Sender<WatcherHealth>,
    ) -> Self {
        Self {
            chain_name: chain_name.to_string(),
            client,
            db,
            index,
            deliveries,
            health,
            backoff: Backoff::default(),
            last_finalized: None,
            held: BTreeMap::new(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Follows the chain until `shutdown` is cancelled. Connection failures are retried forever with exponential
    /// backoff and reported on the health channel; they never end the watcher.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let endpoint = self.client.endpoint().to_string();
        self.last_finalized = match self.db.fetch_watermark(&endpoint).await {
            Ok(w) => w,
            Err(e) => {
                warn!("🔭️ Could not read the watermark for {endpoint}: {e}. Starting from the chain head.");
                None
            },
        };
        info!("🔭️ Watching {} at {endpoint}. Resuming after block {:?}", self.chain_name, self.last_finalized);
        loop {
            self.health.send_replace(WatcherHealth::Connecting);
            let subscription = tokio::select! {
                _ = shutdown.cancelled() => break,
                s = self.subscribe() => s,
            };
            let error = match subscription {
                Ok(stream) => match self.follow(stream, &shutdown).await {
                    Ok(()) => break,
                    Err(e) => e,
                },
                Err(e) => e,
            };
            let delay = self.backoff.next_delay();
            warn!(
                "🔭️ Lost the {} subscription ({error}). Attempt {} to reconnect in {delay:?}",
                self.chain_name,
                self.backoff.failures()
            );
            self.health
                .send_replace(WatcherHealth::Degraded { failures: self.backoff.failures(), last_error: error.to_string() });
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {},
            }
        }
        self.health.send_replace(WatcherHealth::Stopped);
        info!("🔭️ Watcher for {} has stopped", self.chain_name);
    }

    async fn subscribe(&mut self) -> Result<ChainEventStream, ChainError> {
        let resume_from = match self.last_finalized {
            Some(n) => n + 1,
            None => {
                let head = self.client.finalized_head().await?;
                info!("🔭️ First start on {}. Following it from finalized block {head}", self.chain_name);
                self.db
                    .save_watermark(self.client.endpoint(), head)
                    .await
                    .map_err(|e| ChainError::ProcessingFailed(format!("could not save the watermark: {e}")))?;
                self.last_finalized = Some(head);
                head + 1
            },
        };
        self.client.subscribe(Some(resume_from)).await
    }

    /// Consumes the subscription until it fails (`Err`) or shutdown is requested (`Ok`). The stream is dropped on
    /// return, which closes the RPC session.
    async fn follow(&mut self, mut stream: ChainEventStream, shutdown: &CancellationToken) -> Result<(), ChainError> {
        // Blocks that were not final on the old subscription will be announced again.
        self.held.clear();
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                n = stream.next() => n,
            };
            match next {
                Some(Ok(event)) => self.handle_event(event).await?,
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(ChainError::ChainUnavailable(
                        self.client.endpoint().to_string(),
                        "the subscription ended".into(),
                    ))
                },
            }
        }
    }

    async fn handle_event(&mut self, event: ChainEvent) -> Result<(), ChainError> {
        let height = event.block().number;
        if self.last_finalized.is_some_and(|n| height <= n) {
            trace!("🔭️ Block {height} on {} has already been processed", self.chain_name);
            return Ok(());
        }
        match event {
            ChainEvent::InBlock { block, transfers } => {
                trace!("🔭️ Holding block {height} ({}) on {} until it is final", block.hash, self.chain_name);
                if let Some((old, _)) = self.held.insert(height, (block.clone(), transfers)) {
                    if old.hash != block.hash {
                        debug!("🔭️ Block {height} on {} was replaced by a fork: {} → {}", self.chain_name, old.hash, block.hash);
                    }
                }
                Ok(())
            },
            ChainEvent::Finalized { block, transfers } => {
                if let Some(last) = self.last_finalized {
                    if height > last + 1 {
                        return Err(ChainError::ProtocolError(format!(
                            "finalized block {height} does not follow block {last}"
                        )));
                    }
                }
                let held = self.held.remove(&height);
                // Anything held below the finalized height belongs to an abandoned fork.
                self.held = self.held.split_off(&height);
                let transfers = match (transfers, held) {
                    (Some(transfers), Some((h, _))) if h.hash != block.hash => {
                        debug!("🔭️ Discarding fork block {} at height {height} on {}", h.hash, self.chain_name);
                        transfers
                    },
                    (Some(transfers), _) => transfers,
                    (None, Some((h, transfers))) if h.hash == block.hash => transfers,
                    (None, _) => {
                        return Err(ChainError::ProtocolError(format!(
                            "transfers of finalized block {height} ({}) are unknown",
                            block.hash
                        )))
                    },
                };
                self.release(&block, transfers).await?;
                self.last_finalized = Some(height);
                if let Err(e) = self.db.save_watermark(self.client.endpoint(), height).await {
                    warn!("🔭️ Could not save the watermark for {}: {e}", self.chain_name);
                }
                self.backoff.reset();
                self.health.send_replace(WatcherHealth::Healthy { last_finalized: Some(height) });
                Ok(())
            },
        }
    }

    /// Sends the block's transfers to tracked accounts to the engine, in event order, and waits until the engine has
    /// processed all of them.
    async fn release(&self, block: &BlockRef, mut transfers: Vec<ChainTransfer>) -> Result<(), ChainError> {
        transfers.sort_by_key(|t| t.event_index);
        let mut pending = Vec::new();
        for transfer in transfers {
            let Some(order_id) = self.index.lookup(&transfer.to) else {
                continue;
            };
            let observed = ObservedTransfer::new(&self.chain_name, block, transfer, true);
            debug!(
                "🔭️ Finalized transfer {} of {} to {} (order {order_id}) in block {}",
                observed.tx_id, observed.raw_amount, observed.to_address, block.number
            );
            let tx_id = observed.tx_id.clone();
            let (ack, done) = oneshot::channel();
            self.deliveries
                .send(Delivery { order_id, transfer: observed, ack })
                .await
                .map_err(|_| ChainError::ProcessingFailed("the engine is not accepting transfers".into()))?;
            pending.push((tx_id, done));
        }
        for (tx_id, done) in pending {
            done.await.map_err(|_| ChainError::ProcessingFailed(tx_id))?;
        }
        Ok(())
    }
}
