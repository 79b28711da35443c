use log::*;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    chain::{ChainClient, ChainWatcher, HealthBoard},
    db::traits::OrderStore,
    helpers::Backoff,
    kpe_api::{dispatcher::TransferDispatcher, reconciliation::ReconciliationEngine},
};

const DELIVERY_BUFFER: usize = 1024;

/// The background tasks that feed the engine: one watcher per chain endpoint and the transfer dispatcher.
pub struct WatcherSet {
    pub health: HealthBoard,
    handles: Vec<JoinHandle<()>>,
}

impl WatcherSet {
    /// Starts a watcher for every endpoint the engine has a client for. The watchers stop when `shutdown` is
    /// cancelled; the dispatcher stops once the watchers are gone and it has drained its queues.
    pub fn start<B, C>(engine: &ReconciliationEngine<B, C>, shutdown: CancellationToken) -> Self
    where
        B: OrderStore,
        C: ChainClient,
    {
        let (deliveries, receiver) = mpsc::channel(DELIVERY_BUFFER);
        let mut handles = vec![tokio::spawn(TransferDispatcher::new(engine.clone()).run(receiver))];
        let mut health = HealthBoard::new();
        let config = engine.config();
        let endpoints = engine.registry().endpoints();
        for (endpoint, client) in engine.clients() {
            let chain_name = endpoints
                .get(endpoint)
                .and_then(|currencies| currencies.first())
                .map(|c| c.chain_name.clone())
                .unwrap_or_else(|| endpoint.clone());
            let watcher = ChainWatcher::new(
                &chain_name,
                client.clone(),
                engine.db().clone(),
                engine.account_index(),
                deliveries.clone(),
                health.register(&chain_name),
            )
            .with_backoff(Backoff::new(config.retry_delay, config.max_retry_delay));
            handles.push(tokio::spawn(watcher.run(shutdown.clone())));
        }
        info!("🔭️ {} chain watchers started", handles.len() - 1);
        Self { health, handles }
    }

    /// Waits for all watchers and the dispatcher to finish.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("🔭️ A watcher task ended abnormally: {e}");
            }
        }
    }
}
