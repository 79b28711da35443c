use std::future::Future;

use futures_util::stream::BoxStream;
use kalatori_common::{BaseUnits, Secret};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{currency::Currency, db_types::AssetRef};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("Chain endpoint {0} is unavailable: {1}")]
    ChainUnavailable(String, String),
    #[error("Unexpected response from the chain endpoint: {0}")]
    ProtocolError(String),
    #[error("Could not submit the transaction: {0}")]
    SubmissionFailed(String),
    #[error("The chain rejected the transaction: {0}")]
    Rejected(String),
    #[error("The account does not hold enough funds to pay for the transfer")]
    InsufficientBalance,
    #[error("Transfer could not be processed by the engine: {0}")]
    ProcessingFailed(String),
}

impl ChainError {
    /// Whether trying again later has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::ChainUnavailable(..) | ChainError::SubmissionFailed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: u64,
    pub hash: String,
}

/// A balance transfer as decoded from a block's events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTransfer {
    pub tx_id: String,
    /// Position of the transfer event within its block.
    pub event_index: u32,
    pub to: String,
    pub asset: AssetRef,
    pub amount: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    /// A block has been imported, but it is not final and may still be replaced by a fork.
    InBlock { block: BlockRef, transfers: Vec<ChainTransfer> },
    /// The block is final. `transfers` is `None` if the client already announced the block with an
    /// [`ChainEvent::InBlock`] event on this subscription and did not repeat its transfers.
    Finalized { block: BlockRef, transfers: Option<Vec<ChainTransfer>> },
}

impl ChainEvent {
    pub fn block(&self) -> &BlockRef {
        match self {
            ChainEvent::InBlock { block, .. } | ChainEvent::Finalized { block, .. } => block,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxFinality {
    Pending,
    Finalized,
    /// The transaction was dropped or reverted after submission.
    Failed,
}

pub type ChainEventStream = BoxStream<'static, Result<ChainEvent, ChainError>>;

/// The capability the engine needs from a chain node client: a block subscription, balance queries and the ability
/// to sweep an account. Address encoding and signing happen behind this interface.
pub trait ChainClient: Send + Sync + 'static {
    /// The RPC endpoint this client talks to.
    fn endpoint(&self) -> &str;

    /// The height of the latest finalized block.
    fn finalized_head(&self) -> impl Future<Output = Result<u64, ChainError>> + Send;

    /// Opens a new subscription. If `resume_from` is given, every block from that height onwards is replayed before
    /// new blocks are delivered. Otherwise the subscription starts at the current finalized head.
    ///
    /// The stream is not restartable. When it ends or yields an error, a new subscription must be opened.
    fn subscribe(&self, resume_from: Option<u64>) -> impl Future<Output = Result<ChainEventStream, ChainError>> + Send;

    fn balance(&self, account: &str, currency: &Currency) -> impl Future<Output = Result<BaseUnits, ChainError>> + Send;

    /// Transfers the entire balance of the account controlled by `signer` to `recipient`, paying fees from the
    /// balance. Returns the hash of the submitted transaction.
    fn transfer_all(
        &self,
        signer: &Secret<[u8; 32]>,
        recipient: &str,
        currency: &Currency,
    ) -> impl Future<Output = Result<String, ChainError>> + Send;

    fn finality(&self, tx_id: &str) -> impl Future<Output = Result<TxFinality, ChainError>> + Send;
}
