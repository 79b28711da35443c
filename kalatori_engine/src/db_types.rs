use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use kalatori_common::BaseUnits;
use log::error;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("Invalid value: {0}")]
pub struct ConversionError(String);

//--------------------------------------        OrderId        ---------------------------------------------------------
/// The caller-assigned order identifier. Opaque to the engine, and unique for the lifetime of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Type, Serialize, Deserialize)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct OrderId(pub String);

impl FromStr for OrderId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<String> for OrderId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OrderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl OrderId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

//--------------------------------------   PaymentStatus     ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    /// Less than the requested amount has been credited to the order.
    Pending,
    /// At least the requested amount has been credited to the order.
    Paid,
}

impl Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentStatus::Pending => write!(f, "pending"),
            PaymentStatus::Paid => write!(f, "paid"),
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "paid" => Ok(Self::Paid),
            s => Err(ConversionError(format!("Invalid payment status: {s}"))),
        }
    }
}

//--------------------------------------  WithdrawalStatus    ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalStatus {
    /// No withdrawal has been attempted, or a deferred attempt will be retried.
    Waiting,
    /// A withdrawal has been initiated and its outcome is not yet known.
    Withdrawing,
    /// The balance has been forwarded to the recipient and the transfer is final.
    Completed,
    /// The chain declined the withdrawal. Requires a forced withdrawal to resolve.
    Failed,
}

impl Display for WithdrawalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WithdrawalStatus::Waiting => write!(f, "waiting"),
            WithdrawalStatus::Withdrawing => write!(f, "withdrawing"),
            WithdrawalStatus::Completed => write!(f, "completed"),
            WithdrawalStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for WithdrawalStatus {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "withdrawing" => Ok(Self::Withdrawing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            s => Err(ConversionError(format!("Invalid withdrawal status: {s}"))),
        }
    }
}

//--------------------------------------      OrderState       ---------------------------------------------------------
/// The position of an order in the reconciliation state machine, derived from its stored statuses.
///
/// ```text
///   Pending ──► Paid ──► Withdrawing ──► Completed
///      │                     │
///      ▼                     ▼
///   Expired               Failed ──(forced withdrawal)──► Withdrawing
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    Pending,
    Paid,
    Withdrawing,
    Completed,
    Failed,
    Expired,
}

impl Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderState::Pending => "pending",
            OrderState::Paid => "paid",
            OrderState::Withdrawing => "withdrawing",
            OrderState::Completed => "completed",
            OrderState::Failed => "failed",
            OrderState::Expired => "expired",
        };
        f.write_str(s)
    }
}

//--------------------------------------       AssetRef        ---------------------------------------------------------
/// Identifies what was moved by a transfer on a given chain: the chain's native token, or an asset by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetRef {
    Native,
    Asset(u32),
}

impl Display for AssetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssetRef::Native => write!(f, "native"),
            AssetRef::Asset(id) => write!(f, "{id}"),
        }
    }
}

impl FromStr for AssetRef {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "native" => Ok(Self::Native),
            s => s.parse::<u32>().map(Self::Asset).map_err(|e| ConversionError(format!("Invalid asset {s}: {e}"))),
        }
    }
}

impl From<String> for AssetRef {
    fn from(value: String) -> Self {
        value.parse().unwrap_or_else(|e| {
            error!("Invalid asset reference in storage: {e}. But this conversion cannot fail. Defaulting to native");
            AssetRef::Native
        })
    }
}

//--------------------------------------       Transfer        ---------------------------------------------------------
/// A finalized on-chain transfer that has been recorded against an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub tx_id: String,
    pub chain_name: String,
    pub asset: AssetRef,
    /// The exact amount moved on chain, in base units of `asset`. For credited transfers this is also the amount
    /// added to the order's total.
    pub amount: u128,
    pub block_number: i64,
    pub block_hash: String,
    /// False for transfers that were kept for reference only, e.g. those in the wrong currency.
    pub credited: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct TransferRow {
    pub tx_id: String,
    pub chain_name: String,
    pub asset: String,
    pub raw_amount: String,
    pub block_number: i64,
    pub block_hash: String,
    pub credited: bool,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<TransferRow> for Transfer {
    type Error = ConversionError;

    fn try_from(row: TransferRow) -> Result<Self, Self::Error> {
        let amount = row
            .raw_amount
            .parse::<u128>()
            .map_err(|e| ConversionError(format!("Invalid amount {} for transfer {}: {e}", row.raw_amount, row.tx_id)))?;
        Ok(Self {
            tx_id: row.tx_id,
            chain_name: row.chain_name,
            asset: AssetRef::from(row.asset),
            amount,
            block_number: row.block_number,
            block_hash: row.block_hash,
            credited: row.credited,
            created_at: row.created_at,
        })
    }
}

/// A transfer that is about to be recorded against an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransfer {
    pub tx_id: String,
    pub chain_name: String,
    pub asset: AssetRef,
    pub amount: u128,
    pub block_number: i64,
    pub block_hash: String,
}

//--------------------------------------        Order       ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub order_id: OrderId,
    /// The requested amount, in base units of `currency`
    pub amount: BaseUnits,
    /// The currency symbol, as listed in the currency registry
    pub currency: String,
    pub callback: String,
    pub payment_account: String,
    pub recipient: String,
    /// Credited transfers, in the order they were credited.
    pub transactions: Vec<Transfer>,
    pub repaid_amount: BaseUnits,
    pub payment_status: PaymentStatus,
    pub withdrawal_status: WithdrawalStatus,
    /// The hash of the forwarding transaction, once one has been submitted.
    pub withdrawal_tx: Option<String>,
    pub expired: bool,
    /// Operator-facing status text, e.g. the last withdrawal error
    pub message: String,
    pub death: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Incremented on every write. Used for compare-and-swap updates in the order store.
    pub version: i64,
}

impl Order {
    pub fn state(&self) -> OrderState {
        match (self.payment_status, self.withdrawal_status) {
            (_, WithdrawalStatus::Completed) => OrderState::Completed,
            (_, WithdrawalStatus::Failed) => OrderState::Failed,
            (_, WithdrawalStatus::Withdrawing) => OrderState::Withdrawing,
            (PaymentStatus::Paid, WithdrawalStatus::Waiting) => OrderState::Paid,
            (PaymentStatus::Pending, WithdrawalStatus::Waiting) if self.expired => OrderState::Expired,
            (PaymentStatus::Pending, WithdrawalStatus::Waiting) => OrderState::Pending,
        }
    }

    pub fn is_paid(&self) -> bool {
        self.payment_status == PaymentStatus::Paid
    }

    /// Whether the order's account still needs to be watched for incoming transfers.
    pub fn is_monitored(&self) -> bool {
        !self.expired && self.withdrawal_status != WithdrawalStatus::Completed
    }

    pub fn has_transfer(&self, tx_id: &str) -> bool {
        self.transactions.iter().any(|t| t.tx_id == tx_id)
    }

    /// The stored repaid amount must always equal the sum of the credited transactions.
    pub fn is_consistent(&self) -> bool {
        let sum = self.transactions.iter().filter(|t| t.credited).try_fold(0u128, |sum, t| sum.checked_add(t.amount));
        let paid = self.repaid_amount >= self.amount;
        let repaid = u128::try_from(self.repaid_amount.value()).ok();
        sum.is_some() && sum == repaid && paid == self.is_paid()
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct OrderRow {
    pub order_id: OrderId,
    pub amount: BaseUnits,
    pub currency: String,
    pub callback: String,
    pub payment_account: String,
    pub recipient: String,
    pub repaid_amount: BaseUnits,
    pub payment_status: PaymentStatus,
    pub withdrawal_status: WithdrawalStatus,
    pub withdrawal_tx: Option<String>,
    pub expired: bool,
    pub message: String,
    pub death: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl OrderRow {
    pub fn into_order(self, transactions: Vec<Transfer>) -> Order {
        Order {
            order_id: self.order_id,
            amount: self.amount,
            currency: self.currency,
            callback: self.callback,
            payment_account: self.payment_account,
            recipient: self.recipient,
            transactions,
            repaid_amount: self.repaid_amount,
            payment_status: self.payment_status,
            withdrawal_status: self.withdrawal_status,
            withdrawal_tx: self.withdrawal_tx,
            expired: self.expired,
            message: self.message,
            death: self.death,
            created_at: self.created_at,
            updated_at: self.updated_at,
            version: self.version,
        }
    }
}

//--------------------------------------        NewOrder       ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    pub order_id: OrderId,
    /// The requested amount in base units
    pub amount: BaseUnits,
    pub currency: String,
    pub callback: String,
    /// The derived receiving address. Assigned once, never changed.
    pub payment_account: String,
    pub recipient: String,
    pub death: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl NewOrder {
    /// True if the caller-supplied parameters of this request match those of an existing order.
    pub fn is_equivalent(&self, order: &Order) -> bool {
        self.order_id == order.order_id &&
            self.amount == order.amount &&
            self.currency == order.currency &&
            self.callback == order.callback
    }
}

//--------------------------------------   WithdrawalUpdate    ---------------------------------------------------------
/// A compare-and-swap transition of an order's withdrawal status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalUpdate {
    pub expected_version: i64,
    pub status: WithdrawalStatus,
    pub withdrawal_tx: WithdrawalTx,
    pub message: String,
}

/// What a [`WithdrawalUpdate`] does to the order's recorded withdrawal transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WithdrawalTx {
    Keep,
    Record(String),
    /// Forget the recorded transaction. Used when a new withdrawal attempt starts.
    Clear,
}
