//! An in-memory chain for tests.
//!
//! `FakeChain` implements [`ChainClient`]. Tests drive it by producing blocks, and can inject disconnects and
//! withdrawal failures. Balances are tracked per `(address, asset)`: finalized transfers credit them and
//! `transfer_all` sweeps them to the recipient.
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use futures_util::{stream, StreamExt};
use kalatori_common::{BaseUnits, Secret};
use tokio::sync::mpsc;

use crate::{
    chain::{BlockRef, ChainClient, ChainError, ChainEvent, ChainEventStream, ChainTransfer, TxFinality},
    currency::Currency,
    db_types::AssetRef,
    derivation::address_from_seed,
};

type Subscriber = mpsc::UnboundedSender<Result<ChainEvent, ChainError>>;

/// A withdrawal that was submitted to the fake chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub tx_id: String,
    pub from: String,
    pub recipient: String,
    pub asset: AssetRef,
    pub amount: u128,
}

#[derive(Default)]
struct FakeChainState {
    chain_name: String,
    head: u64,
    finalized: Vec<(BlockRef, Vec<ChainTransfer>)>,
    subscribers: Vec<Subscriber>,
    subscriptions: usize,
    balances: HashMap<(String, AssetRef), u128>,
    submissions: Vec<Submission>,
    tx_status: HashMap<String, TxFinality>,
    default_finality: Option<TxFinality>,
    failing_subscriptions: u32,
    failing_submissions: VecDeque<ChainError>,
    next_id: u64,
}

#[derive(Clone)]
pub struct FakeChain {
    endpoint: String,
    state: Arc<Mutex<FakeChainState>>,
}

impl FakeChain {
    pub fn new(chain_name: &str, endpoint: &str) -> Self {
        let state = FakeChainState { chain_name: chain_name.to_string(), ..Default::default() };
        Self { endpoint: endpoint.to_string(), state: Arc::new(Mutex::new(state)) }
    }

    fn state(&self) -> MutexGuard<'_, FakeChainState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn chain_name(&self) -> String {
        self.state().chain_name.clone()
    }

    /// Builds a transfer with a fresh transaction id. Nothing happens on chain until it is included in a block.
    pub fn transfer(&self, to: &str, asset: AssetRef, amount: u128) -> ChainTransfer {
        let mut state = self.state();
        state.next_id += 1;
        ChainTransfer {
            tx_id: format!("0x{}{:08x}", state.chain_name, state.next_id),
            event_index: state.next_id as u32,
            to: to.to_string(),
            asset,
            amount,
        }
    }

    /// Announces a block that is not final yet.
    pub fn in_block(&self, number: u64, hash: &str, transfers: Vec<ChainTransfer>) {
        let block = BlockRef { number, hash: hash.to_string() };
        self.broadcast(ChainEvent::InBlock { block, transfers });
    }

    /// Finalizes a block. With `announced = true`, the finality event does not repeat the transfers, as if the block
    /// had been announced on the subscription before.
    pub fn finalize_block(&self, number: u64, hash: &str, transfers: Vec<ChainTransfer>, announced: bool) {
        let block = BlockRef { number, hash: hash.to_string() };
        {
            let mut state = self.state();
            for t in &transfers {
                *state.balances.entry((t.to.clone(), t.asset)).or_default() += t.amount;
            }
            state.head = state.head.max(number);
            state.finalized.push((block.clone(), transfers.clone()));
        }
        let transfers = if announced { None } else { Some(transfers) };
        self.broadcast(ChainEvent::Finalized { block, transfers });
    }

    /// Produces and immediately finalizes the next block, containing `transfers`. Returns the block height.
    pub fn produce_block(&self, transfers: Vec<ChainTransfer>) -> u64 {
        let number = self.state().head + 1;
        self.finalize_block(number, &format!("0xblock{number}"), transfers, false);
        number
    }

    /// Fails every open subscription, as if the node had dropped the connection.
    pub fn disconnect(&self) {
        let subscribers = std::mem::take(&mut self.state().subscribers);
        for s in subscribers {
            let _ = s.send(Err(ChainError::ChainUnavailable("fake".into(), "connection reset".into())));
        }
    }

    /// The next `count` connection attempts fail. Head queries count as connection attempts too.
    pub fn fail_next_subscriptions(&self, count: u32) {
        self.state().failing_subscriptions = count;
    }

    /// The next `transfer_all` calls fail with these errors, in order.
    pub fn fail_next_submissions(&self, errors: Vec<ChainError>) {
        self.state().failing_submissions.extend(errors);
    }

    /// The finality reported for transactions submitted from now on. Defaults to `Finalized`.
    pub fn set_default_finality(&self, finality: TxFinality) {
        self.state().default_finality = Some(finality);
    }

    pub fn set_finality(&self, tx_id: &str, finality: TxFinality) {
        self.state().tx_status.insert(tx_id.to_string(), finality);
    }

    pub fn set_balance(&self, address: &str, asset: AssetRef, amount: u128) {
        self.state().balances.insert((address.to_string(), asset), amount);
    }

    pub fn balance_of(&self, address: &str, asset: AssetRef) -> u128 {
        self.state().balances.get(&(address.to_string(), asset)).copied().unwrap_or_default()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state().submissions.clone()
    }

    /// The number of subscriptions opened so far
    pub fn subscriptions(&self) -> usize {
        self.state().subscriptions
    }

    pub fn live_subscribers(&self) -> usize {
        let mut state = self.state();
        state.subscribers.retain(|s| !s.is_closed());
        state.subscribers.len()
    }

    fn broadcast(&self, event: ChainEvent) {
        let mut state = self.state();
        state.subscribers.retain(|s| s.send(Ok(event.clone())).is_ok());
    }
}

impl ChainClient for FakeChain {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn finalized_head(&self) -> Result<u64, ChainError> {
        let mut state = self.state();
        if state.failing_subscriptions > 0 {
            state.failing_subscriptions -= 1;
            return Err(ChainError::ChainUnavailable(self.endpoint.clone(), "connection refused".into()));
        }
        Ok(state.head)
    }

    async fn subscribe(&self, resume_from: Option<u64>) -> Result<ChainEventStream, ChainError> {
        let mut state = self.state();
        if state.failing_subscriptions > 0 {
            state.failing_subscriptions -= 1;
            return Err(ChainError::ChainUnavailable(self.endpoint.clone(), "connection refused".into()));
        }
        state.subscriptions += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(from) = resume_from {
            for (block, transfers) in state.finalized.iter().filter(|(b, _)| b.number >= from) {
                let event = ChainEvent::Finalized { block: block.clone(), transfers: Some(transfers.clone()) };
                let _ = tx.send(Ok(event));
            }
        }
        state.subscribers.push(tx);
        let events = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) });
        Ok(events.boxed())
    }

    async fn balance(&self, account: &str, currency: &Currency) -> Result<BaseUnits, ChainError> {
        let balance = self.balance_of(account, currency.asset_ref());
        BaseUnits::try_from(balance).map_err(|e| ChainError::ProtocolError(e.to_string()))
    }

    async fn transfer_all(
        &self,
        signer: &Secret<[u8; 32]>,
        recipient: &str,
        currency: &Currency,
    ) -> Result<String, ChainError> {
        let from = address_from_seed(signer.reveal(), currency.ss58.unwrap_or_default())
            .map_err(|e| ChainError::Rejected(e.to_string()))?;
        let mut state = self.state();
        if let Some(e) = state.failing_submissions.pop_front() {
            return Err(e);
        }
        let asset = currency.asset_ref();
        let amount = state.balances.insert((from.clone(), asset), 0).unwrap_or_default();
        if amount == 0 {
            return Err(ChainError::InsufficientBalance);
        }
        *state.balances.entry((recipient.to_string(), asset)).or_default() += amount;
        state.next_id += 1;
        let tx_id = format!("0xwithdrawal{:08x}", state.next_id);
        let finality = state.default_finality.unwrap_or(TxFinality::Finalized);
        state.tx_status.insert(tx_id.clone(), finality);
        state.submissions.push(Submission { tx_id: tx_id.clone(), from, recipient: recipient.to_string(), asset, amount });
        Ok(tx_id)
    }

    async fn finality(&self, tx_id: &str) -> Result<TxFinality, ChainError> {
        Ok(self.state().tx_status.get(tx_id).copied().unwrap_or(TxFinality::Pending))
    }
}
