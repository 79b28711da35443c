//! The reconciliation engine
//!
//! `ReconciliationEngine` owns the order lifecycle. It creates orders, credits finalized transfers to them, and
//! withdraws paid orders to the merchant:
//!
//! ```text
//!   pending ──(credited ≥ amount)──► paid ──► withdrawing ──► completed
//!      │                                          │
//!      ▼                                          ▼
//!   expired                                     failed ──(forced withdrawal)──► withdrawing
//! ```
//!
//! All mutations of one order are serialised with a lock keyed by order id; different orders proceed in parallel. On
//! top of that, every write is a compare-and-swap on the order's version in the [`OrderStore`], so the store never
//! accepts a write based on stale state.
//!
//! Only a `waiting → withdrawing` transition can start a withdrawal, which guarantees at most one withdrawal per
//! order no matter how often a transfer is replayed.
use std::{collections::HashMap, fmt::Debug, fmt::Display, sync::Arc};

use chrono::Utc;
use kalatori_common::BaseUnits;
use log::*;

use crate::{
    chain::{AccountIndex, ChainClient, ObservedTransfer, TxFinality},
    currency::{Currency, CurrencyRegistry, Recipients},
    db::traits::{CreditResult, InsertOrderResult, OrderStore},
    db_types::{NewOrder, NewTransfer, Order, OrderId, WithdrawalStatus, WithdrawalTx, WithdrawalUpdate},
    derivation::AccountDeriver,
    events::{EventProducers, OrderPaidEvent, OrderSettledEvent, WithdrawalFailedEvent},
    helpers::KeyedLock,
    kpe_api::{
        errors::{EngineError, WithdrawalError},
        order_objects::{EngineConfig, OrderCreation, OrderRequest},
        withdrawal::WithdrawalExecutor,
    },
};

fn db_err<E: Display>(e: E) -> EngineError {
    EngineError::DatabaseError(e.to_string())
}

pub struct ReconciliationEngine<B, C> {
    db: B,
    registry: Arc<CurrencyRegistry>,
    recipients: Arc<Recipients>,
    deriver: AccountDeriver,
    clients: Arc<HashMap<String, Arc<C>>>,
    executor: WithdrawalExecutor<C>,
    index: AccountIndex,
    locks: KeyedLock<OrderId>,
    config: EngineConfig,
    producers: EventProducers,
}

impl<B: Clone, C> Clone for ReconciliationEngine<B, C> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            registry: Arc::clone(&self.registry),
            recipients: Arc::clone(&self.recipients),
            deriver: self.deriver.clone(),
            clients: Arc::clone(&self.clients),
            executor: self.executor.clone(),
            index: self.index.clone(),
            locks: self.locks.clone(),
            config: self.config.clone(),
            producers: self.producers.clone(),
        }
    }
}

impl<B, C> Debug for ReconciliationEngine<B, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReconciliationEngine ({} currencies)", self.registry.currencies().len())
    }
}

impl<B, C> ReconciliationEngine<B, C>
where
    B: OrderStore,
    C: ChainClient,
{
    pub fn new(
        db: B,
        registry: CurrencyRegistry,
        recipients: Recipients,
        deriver: AccountDeriver,
        clients: HashMap<String, Arc<C>>,
        config: EngineConfig,
        producers: EventProducers,
    ) -> Self {
        let clients = Arc::new(clients);
        let executor = WithdrawalExecutor::new(Arc::clone(&clients), &config);
        Self {
            db,
            registry: Arc::new(registry),
            recipients: Arc::new(recipients),
            deriver,
            clients,
            executor,
            index: AccountIndex::new(),
            locks: KeyedLock::new(),
            config,
            producers,
        }
    }

    pub fn db(&self) -> &B {
        &self.db
    }

    pub fn registry(&self) -> &CurrencyRegistry {
        &self.registry
    }

    /// Chain clients, keyed by RPC endpoint
    pub fn clients(&self) -> &HashMap<String, Arc<C>> {
        &self.clients
    }

    pub fn account_index(&self) -> AccountIndex {
        self.index.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn currency_of(&self, order: &Order) -> Result<&Currency, EngineError> {
        self.registry.get(&order.currency).ok_or_else(|| EngineError::UnsupportedCurrency(order.currency.clone()))
    }

    /// Creates a new order and derives its payment account.
    ///
    /// Creating an order that already exists with the same amount, currency and callback returns the existing order
    /// unchanged. Different parameters are refused with [`EngineError::DuplicateOrderMismatch`]. The currency is
    /// validated before anything is derived or stored.
    pub async fn create_order(&self, order_id: OrderId, request: OrderRequest) -> Result<OrderCreation, EngineError> {
        let currency = self
            .registry
            .get(&request.currency)
            .ok_or_else(|| EngineError::UnsupportedCurrency(request.currency.clone()))?;
        let amount = BaseUnits::from_human(request.amount, currency.decimals)
            .map_err(|e| EngineError::InvalidAmount(e.to_string()))?;
        if amount.is_zero() {
            return Err(EngineError::InvalidAmount("the order amount must be positive".into()));
        }
        let recipient = self
            .recipients
            .get(&currency.symbol)
            .ok_or_else(|| EngineError::UnsupportedCurrency(currency.symbol.clone()))?
            .clone();
        let _guard = self.locks.lock(&order_id).await;
        let account = self.deriver.derive(&order_id, currency)?;
        let now = Utc::now();
        let new_order = NewOrder {
            order_id: order_id.clone(),
            amount,
            currency: currency.symbol.clone(),
            callback: request.callback,
            payment_account: account.address,
            recipient,
            death: now + self.config.order_lifetime,
            created_at: now,
        };
        match self.db.insert_order(new_order.clone()).await.map_err(db_err)? {
            InsertOrderResult::Inserted(order) => {
                self.index.insert(&order.payment_account, &order.order_id);
                info!(
                    "🧾️ Order {order_id} created. Awaiting {} {} at {}",
                    order.amount, order.currency, order.payment_account
                );
                Ok(OrderCreation::Created(order))
            },
            InsertOrderResult::AlreadyExists(order) if new_order.is_equivalent(&order) => {
                debug!("🧾️ Order {order_id} already exists with the same parameters");
                Ok(OrderCreation::Existing(order))
            },
            InsertOrderResult::AlreadyExists(_) => {
                warn!("🧾️ Order {order_id} already exists with different parameters");
                Err(EngineError::DuplicateOrderMismatch(order_id))
            },
        }
    }

    pub async fn fetch_order(&self, order_id: &OrderId) -> Result<Order, EngineError> {
        self.db
            .fetch_order(order_id)
            .await
            .map_err(db_err)?
            .ok_or_else(|| EngineError::OrderNotFound(order_id.clone()))
    }

    /// Credits an observed transfer to the order, and starts the withdrawal if the transfer made the order paid. The
    /// withdrawal has run (or been deferred) by the time this call returns.
    ///
    /// See [`Self::record_transfer`] and [`Self::withdraw_if_paid`] for the two steps.
    pub async fn process_transfer(
        &self,
        order_id: &OrderId,
        transfer: ObservedTransfer,
    ) -> Result<Order, EngineError> {
        let order = self.record_transfer(order_id, transfer).await?;
        if needs_withdrawal(&order) {
            return self.withdraw_if_paid(order_id).await;
        }
        Ok(order)
    }

    /// Records an observed transfer against the order. Once this returns `Ok`, the outcome is durable.
    ///
    /// * Transfers that are not finalized are ignored.
    /// * A transfer that was already recorded (same `tx_id`) changes nothing.
    /// * A transfer in a currency other than the order's, or one arriving after the order expired, is recorded for
    ///   reference but not credited. So is a transfer whose amount would take the order's total out of range.
    /// * Nothing is credited to an order whose withdrawal has completed.
    ///
    /// This never starts a withdrawal.
    pub async fn record_transfer(&self, order_id: &OrderId, transfer: ObservedTransfer) -> Result<Order, EngineError> {
        let _guard = self.locks.lock(order_id).await;
        let order = self.fetch_order(order_id).await?;
        if !transfer.finalized {
            trace!("🧾️ Transfer {} to order {order_id} is not final yet. Ignoring it.", transfer.tx_id);
            return Ok(order);
        }
        if order.payment_account != transfer.to_address {
            warn!("🧾️ Transfer {} is addressed to {}, not order {order_id}", transfer.tx_id, transfer.to_address);
            return Ok(order);
        }
        if order.has_transfer(&transfer.tx_id) {
            debug!("🧾️ Transfer {} has already been recorded for order {order_id}", transfer.tx_id);
            return Ok(order);
        }
        if order.withdrawal_status == WithdrawalStatus::Completed {
            warn!(
                "🧾️ Order {order_id} has already been settled. Transfer {} of {} will not be credited.",
                transfer.tx_id, transfer.raw_amount
            );
            return Ok(order);
        }
        let new_transfer = NewTransfer {
            tx_id: transfer.tx_id.clone(),
            chain_name: transfer.chain_name.clone(),
            asset: transfer.asset,
            amount: transfer.raw_amount,
            block_number: i64::try_from(transfer.block_ref.number).unwrap_or(i64::MAX),
            block_hash: transfer.block_ref.hash.clone(),
        };
        let Some(credit) = self.creditable_amount(&order, &transfer) else {
            self.db.record_foreign_transfer(order_id, new_transfer).await.map_err(db_err)?;
            return self.fetch_order(order_id).await;
        };
        let was_paid = order.is_paid();
        let order = match self.db.credit_transfer(order_id, order.version, new_transfer).await.map_err(db_err)? {
            CreditResult::Credited(order) => order,
            CreditResult::Duplicate => return self.fetch_order(order_id).await,
            CreditResult::VersionConflict => {
                return Err(EngineError::DatabaseError(format!("Order {order_id} was modified concurrently")))
            },
        };
        info!("🧾️ Credited {credit} to order {order_id}. {} of {} received.", order.repaid_amount, order.amount);
        if !was_paid && order.is_paid() {
            info!("🧾️ Order {order_id} is paid");
            for producer in &self.producers.order_paid_producer {
                producer.publish_event(OrderPaidEvent::new(order.clone())).await;
            }
        }
        Ok(order)
    }

    /// The amount `transfer` adds to the order's total, or `None` if it must only be kept for reference.
    fn creditable_amount(&self, order: &Order, transfer: &ObservedTransfer) -> Option<BaseUnits> {
        let order_id = &order.order_id;
        if order.expired {
            warn!("🧾️ Transfer {} arrived after order {order_id} expired. Not crediting it.", transfer.tx_id);
            return None;
        }
        let Some(currency) = self.registry.get(&order.currency) else {
            warn!("🧾️ Order {order_id} is in {}, which is no longer configured. Not crediting it.", order.currency);
            return None;
        };
        if !currency.matches(&transfer.chain_name, transfer.asset) {
            warn!(
                "🧾️ Transfer {} to order {order_id} is in {}/{}, but the order is in {}. Not crediting it.",
                transfer.tx_id, transfer.chain_name, transfer.asset, currency.symbol
            );
            return None;
        }
        let credit = BaseUnits::try_from(transfer.raw_amount)
            .ok()
            .filter(|amount| order.repaid_amount.checked_add(*amount).is_some());
        if credit.is_none() {
            warn!(
                "🧾️ Transfer {} of {} would overflow the total of order {order_id}. Not crediting it.",
                transfer.tx_id, transfer.raw_amount
            );
        }
        credit
    }

    /// Starts the withdrawal of the order if it is paid and no withdrawal has been attempted yet, or the last attempt
    /// was deferred. Otherwise the order is returned unchanged.
    pub async fn withdraw_if_paid(&self, order_id: &OrderId) -> Result<Order, EngineError> {
        let _guard = self.locks.lock(order_id).await;
        let order = self.fetch_order(order_id).await?;
        if needs_withdrawal(&order) {
            return self.start_withdrawal(order).await;
        }
        Ok(order)
    }

    /// Retries the withdrawal of a paid order, whatever happened to earlier attempts.
    ///
    /// A completed order is returned unchanged. An order whose withdrawal transaction is already on chain is only
    /// checked for finality, so funds that have already been forwarded are never sent again.
    pub async fn force_withdrawal(&self, order_id: &OrderId) -> Result<Order, EngineError> {
        let _guard = self.locks.lock(order_id).await;
        let order = self.fetch_order(order_id).await?;
        if order.withdrawal_status == WithdrawalStatus::Completed {
            info!("💸️ Order {order_id} has already been withdrawn");
            return Ok(order);
        }
        if !order.is_paid() {
            return Err(EngineError::WithdrawalNotAllowed(format!("order {} has not been paid", order_id.as_str())));
        }
        info!("💸️ Forced withdrawal of order {order_id} from state {}", order.state());
        match (order.withdrawal_status, order.withdrawal_tx.is_some()) {
            (WithdrawalStatus::Withdrawing, true) => self.settle(order).await,
            (WithdrawalStatus::Withdrawing, false) => self.run_withdrawal(order).await,
            _ => self.start_withdrawal(order).await,
        }
    }

    /// Marks unpaid orders whose `death` has passed as expired and stops watching their accounts. Any funds already
    /// at those accounts stay there.
    pub async fn expire_orders(&self) -> Result<Vec<Order>, EngineError> {
        let now = Utc::now();
        let candidates = self.db.fetch_monitored_orders().await.map_err(db_err)?;
        let mut expired = Vec::new();
        for candidate in candidates.into_iter().filter(|o| is_expirable(o, now)) {
            let _guard = self.locks.lock(&candidate.order_id).await;
            let order = self.fetch_order(&candidate.order_id).await?;
            if !is_expirable(&order, now) {
                continue;
            }
            let message = "Order expired";
            if let Some(order) = self.db.mark_expired(&order.order_id, order.version, message).await.map_err(db_err)? {
                self.index.remove(&order.payment_account);
                info!("🧾️ Order {} expired with {} of {} received", order.order_id, order.repaid_amount, order.amount);
                expired.push(order);
            }
        }
        Ok(expired)
    }

    /// Drives every withdrawal that is not settled yet:
    /// * paid orders still `waiting` (e.g. after a deferred submission) are withdrawn,
    /// * `withdrawing` orders with a recorded transaction are checked for finality,
    /// * `withdrawing` orders without one (the process stopped mid-submission) are withdrawn again.
    ///
    /// Failures are logged and do not stop the sweep. Returns the orders that were looked at.
    pub async fn resume_withdrawals(&self) -> Result<Vec<Order>, EngineError> {
        let mut orders = self.db.fetch_orders_by_withdrawal_status(WithdrawalStatus::Withdrawing).await.map_err(db_err)?;
        let waiting = self.db.fetch_orders_by_withdrawal_status(WithdrawalStatus::Waiting).await.map_err(db_err)?;
        orders.extend(waiting.into_iter().filter(|o| o.is_paid()));
        let mut result = Vec::with_capacity(orders.len());
        for candidate in orders {
            let order_id = candidate.order_id.clone();
            match self.resume_withdrawal(&order_id).await {
                Ok(order) => result.push(order),
                Err(e) => error!("💸️ Could not resume the withdrawal of order {order_id}: {e}"),
            }
        }
        Ok(result)
    }

    async fn resume_withdrawal(&self, order_id: &OrderId) -> Result<Order, EngineError> {
        let _guard = self.locks.lock(order_id).await;
        let order = self.fetch_order(order_id).await?;
        match (order.withdrawal_status, order.withdrawal_tx.is_some()) {
            (WithdrawalStatus::Withdrawing, true) => self.settle(order).await,
            (WithdrawalStatus::Withdrawing, false) => {
                info!("💸️ Resuming the interrupted withdrawal of order {order_id}");
                self.run_withdrawal(order).await
            },
            (WithdrawalStatus::Waiting, _) if order.is_paid() => self.start_withdrawal(order).await,
            _ => Ok(order),
        }
    }

    /// Rebuilds the account index from the store. Call once at startup, before the watchers start.
    pub async fn load_tracked_accounts(&self) -> Result<usize, EngineError> {
        let orders = self.db.fetch_monitored_orders().await.map_err(db_err)?;
        self.index.rebuild(&orders);
        Ok(self.index.len())
    }

    /// Startup recovery: restores the account index and picks up withdrawals that were interrupted.
    pub async fn recover(&self) -> Result<(), EngineError> {
        let tracked = self.load_tracked_accounts().await?;
        let resumed = self.resume_withdrawals().await?;
        info!("🧾️ Recovery complete. {tracked} accounts tracked, {} withdrawals resumed", resumed.len());
        Ok(())
    }

    // ---------------------------------------------------------------------------------------------------------------
    // The methods below expect the caller to hold the order's lock.

    async fn start_withdrawal(&self, order: Order) -> Result<Order, EngineError> {
        let update = WithdrawalUpdate {
            expected_version: order.version,
            status: WithdrawalStatus::Withdrawing,
            withdrawal_tx: WithdrawalTx::Clear,
            message: "Withdrawal in progress".into(),
        };
        match self.db.update_withdrawal(&order.order_id, update).await.map_err(db_err)? {
            Some(order) => self.run_withdrawal(order).await,
            None => {
                debug!("💸️ Order {} changed before its withdrawal could start", order.order_id);
                self.fetch_order(&order.order_id).await
            },
        }
    }

    async fn run_withdrawal(&self, order: Order) -> Result<Order, EngineError> {
        let currency = self.currency_of(&order)?;
        let submission = match self.deriver.derive(&order.order_id, currency) {
            Ok(account) => self.executor.submit(&account, &order.recipient, currency, order.repaid_amount).await,
            Err(e) => Err(WithdrawalError::Derivation(e)),
        };
        match submission {
            Ok(tx_id) => {
                let message = format!("Withdrawal submitted in {tx_id}");
                let tx = WithdrawalTx::Record(tx_id);
                let order = self.set_withdrawal(order, WithdrawalStatus::Withdrawing, tx, message).await?;
                self.settle(order).await
            },
            Err(WithdrawalError::SubmissionError(e)) => {
                warn!("💸️ Withdrawal of order {} deferred: {e}", order.order_id);
                let message = format!("Withdrawal deferred: {e}");
                self.set_withdrawal(order, WithdrawalStatus::Waiting, WithdrawalTx::Keep, message).await
            },
            // An earlier attempt already swept the account. Its transaction decides the outcome.
            Err(WithdrawalError::InsufficientBalance) if order.withdrawal_tx.is_some() => self.settle(order).await,
            Err(e) => self.fail_withdrawal(order, e.to_string()).await,
        }
    }

    /// Checks the finality of the order's withdrawal transaction and completes or fails the order accordingly. If the
    /// transaction is not final yet, the order stays `withdrawing` and is checked again by the next sweep.
    async fn settle(&self, order: Order) -> Result<Order, EngineError> {
        let Some(tx_id) = order.withdrawal_tx.clone() else {
            return Ok(order);
        };
        let currency = self.currency_of(&order)?;
        match self.executor.await_finality(currency, &tx_id).await {
            Ok(TxFinality::Finalized) => {
                let message = format!("Withdrawn in {tx_id}");
                let order = self.set_withdrawal(order, WithdrawalStatus::Completed, WithdrawalTx::Keep, message).await?;
                self.index.remove(&order.payment_account);
                info!("💸️ Order {} settled. Funds forwarded to {} in {tx_id}", order.order_id, order.recipient);
                for producer in &self.producers.order_settled_producer {
                    producer.publish_event(OrderSettledEvent::new(order.clone(), tx_id.clone())).await;
                }
                Ok(order)
            },
            Ok(TxFinality::Failed) => self.fail_withdrawal(order, format!("Withdrawal transaction {tx_id} failed")).await,
            Ok(TxFinality::Pending) => {
                info!("💸️ Withdrawal {tx_id} of order {} is not final yet. Will check again later.", order.order_id);
                Ok(order)
            },
            Err(e) => {
                warn!("💸️ Could not confirm withdrawal {tx_id} of order {}: {e}", order.order_id);
                Ok(order)
            },
        }
    }

    async fn fail_withdrawal(&self, order: Order, reason: String) -> Result<Order, EngineError> {
        error!("💸️ Withdrawal of order {} failed: {reason}. A forced withdrawal is required.", order.order_id);
        let order = self.set_withdrawal(order, WithdrawalStatus::Failed, WithdrawalTx::Keep, reason.clone()).await?;
        for producer in &self.producers.withdrawal_failed_producer {
            producer.publish_event(WithdrawalFailedEvent::new(order.clone(), reason.clone())).await;
        }
        Ok(order)
    }

    async fn set_withdrawal(
        &self,
        order: Order,
        status: WithdrawalStatus,
        withdrawal_tx: WithdrawalTx,
        message: String,
    ) -> Result<Order, EngineError> {
        let update = WithdrawalUpdate { expected_version: order.version, status, withdrawal_tx, message };
        self.db.update_withdrawal(&order.order_id, update).await.map_err(db_err)?.ok_or_else(|| {
            EngineError::DatabaseError(format!("Order {} was modified during its withdrawal", order.order_id))
        })
    }
}

fn needs_withdrawal(order: &Order) -> bool {
    order.is_paid() && order.withdrawal_status == WithdrawalStatus::Waiting
}

fn is_expirable(order: &Order, now: chrono::DateTime<Utc>) -> bool {
    !order.expired && !order.is_paid() && order.withdrawal_status == WithdrawalStatus::Waiting && order.death < now
}
