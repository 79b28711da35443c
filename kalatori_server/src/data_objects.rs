//! The JSON representations served by the HTTP API and posted to merchant callbacks.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kalatori_common::raw_to_human;
use kalatori_engine::{
    chain::WatcherHealth,
    currency::{Currency, CurrencyRegistry},
    db_types::{AssetRef, Order, PaymentStatus, Transfer, WithdrawalStatus},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    pub instance_id: String,
    pub debug: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferResponse {
    pub tx_id: String,
    pub chain_name: String,
    pub asset: AssetRef,
    /// The symbol of the transferred currency. `None` if the asset is not configured on this gateway.
    pub currency: Option<String>,
    /// In human units of the transferred currency, or in base units if the currency is unknown
    pub amount: f64,
    /// The exact amount in base units of the transferred asset
    pub raw_amount: String,
    pub block_number: i64,
    pub block_hash: String,
    pub credited: bool,
    pub created_at: DateTime<Utc>,
}

impl TransferResponse {
    pub fn new(transfer: Transfer, registry: &CurrencyRegistry) -> Self {
        let currency = registry.find(&transfer.chain_name, transfer.asset);
        Self {
            currency: currency.map(|c| c.symbol.clone()),
            amount: raw_to_human(transfer.amount, currency.map_or(0, |c| c.decimals)),
            raw_amount: transfer.amount.to_string(),
            tx_id: transfer.tx_id,
            chain_name: transfer.chain_name,
            asset: transfer.asset,
            block_number: transfer.block_number,
            block_hash: transfer.block_hash,
            credited: transfer.credited,
            created_at: transfer.created_at,
        }
    }
}

/// The order representation. Amounts are in human units of the order's currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResponse {
    pub order: String,
    pub amount: f64,
    pub currency: Currency,
    pub callback: String,
    pub payment_account: String,
    pub recipient: String,
    pub transactions: Vec<TransferResponse>,
    pub payment_status: PaymentStatus,
    pub withdrawal_status: WithdrawalStatus,
    pub repaid_amount: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub withdrawal_tx: Option<String>,
    pub death: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub message: String,
    pub payment_page: String,
    pub redirect_url: String,
    pub server_info: ServerInfo,
}

impl OrderResponse {
    pub fn new(order: Order, currency: &Currency, registry: &CurrencyRegistry, server_info: &ServerInfo) -> Self {
        let decimals = currency.decimals;
        Self {
            order: order.order_id.0,
            amount: order.amount.to_human(decimals),
            currency: currency.clone(),
            callback: order.callback,
            payment_account: order.payment_account,
            recipient: order.recipient,
            transactions: order.transactions.into_iter().map(|t| TransferResponse::new(t, registry)).collect(),
            payment_status: order.payment_status,
            withdrawal_status: order.withdrawal_status,
            repaid_amount: order.repaid_amount.to_human(decimals),
            withdrawal_tx: order.withdrawal_tx,
            death: order.death,
            created_at: order.created_at,
            message: order.message,
            payment_page: String::new(),
            redirect_url: String::new(),
            server_info: server_info.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub description: String,
    pub server_info: ServerInfo,
    pub supported_currencies: BTreeMap<String, Currency>,
    pub chains: BTreeMap<String, WatcherHealth>,
}
