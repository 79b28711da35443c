//! Withdrawal executor
//!
//! Sweeps a paid order's payment account to the merchant. The whole balance present at the account is sent, not
//! just the order amount, so overpayments are forwarded too. Because the balance is read at withdrawal time, running
//! a withdrawal again after the funds have left is harmless: it fails with
//! [`WithdrawalError::InsufficientBalance`] instead of sending anything twice.
//!
//! A withdrawal takes two steps: [`WithdrawalExecutor::submit`] returns the transaction hash, and
//! [`WithdrawalExecutor::await_finality`] reports whether that transaction is final. The engine stores the hash in
//! between, so an interrupted withdrawal is settled from its transaction instead of being submitted again.
use std::{collections::HashMap, sync::Arc};

use kalatori_common::BaseUnits;
use log::*;

use crate::{
    chain::{ChainClient, ChainError, TxFinality},
    currency::Currency,
    derivation::PaymentAccount,
    helpers::Backoff,
    kpe_api::{errors::WithdrawalError, order_objects::EngineConfig},
};

pub struct WithdrawalExecutor<C> {
    clients: Arc<HashMap<String, Arc<C>>>,
    attempts: u32,
    backoff: Backoff,
    finality_checks: u32,
    finality_interval: std::time::Duration,
}

impl<C> Clone for WithdrawalExecutor<C> {
    fn clone(&self) -> Self {
        Self {
            clients: Arc::clone(&self.clients),
            attempts: self.attempts,
            backoff: self.backoff.clone(),
            finality_checks: self.finality_checks,
            finality_interval: self.finality_interval,
        }
    }
}

impl<C: ChainClient> WithdrawalExecutor<C> {
    pub fn new(clients: Arc<HashMap<String, Arc<C>>>, config: &EngineConfig) -> Self {
        Self {
            clients,
            attempts: config.withdrawal_attempts.max(1),
            backoff: Backoff::new(config.retry_delay, config.max_retry_delay),
            finality_checks: config.finality_checks.max(1),
            finality_interval: config.finality_interval,
        }
    }

    fn client(&self, currency: &Currency) -> Result<&Arc<C>, WithdrawalError> {
        self.clients
            .get(&currency.rpc_url)
            .ok_or_else(|| WithdrawalError::SubmissionError(format!("No chain client for {}", currency.rpc_url)))
    }

    /// Submits the transfer of the account's full balance to `recipient` and returns the transaction hash.
    ///
    /// Transient failures are retried with backoff, up to the configured number of attempts.
    pub async fn submit(
        &self,
        account: &PaymentAccount,
        recipient: &str,
        currency: &Currency,
        amount_hint: BaseUnits,
    ) -> Result<String, WithdrawalError> {
        let client = self.client(currency)?;
        let mut backoff = self.backoff.clone();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match client.balance(&account.address, currency).await {
                Ok(balance) if balance.is_zero() => return Err(WithdrawalError::InsufficientBalance),
                Ok(balance) => {
                    if balance < amount_hint {
                        warn!("💸️ {} holds {balance}, less than the {amount_hint} credited to it", account.address);
                    } else if balance > amount_hint {
                        info!("💸️ {} holds {balance}. The excess over {amount_hint} is forwarded too", account.address);
                    }
                    client.transfer_all(&account.signer, recipient, currency).await
                },
                Err(e) => Err(e),
            };
            match outcome {
                Ok(tx_id) => {
                    info!("💸️ Withdrawal from {} to {recipient} submitted in {tx_id}", account.address);
                    return Ok(tx_id);
                },
                Err(ChainError::InsufficientBalance) => return Err(WithdrawalError::InsufficientBalance),
                Err(ChainError::Rejected(reason)) => return Err(WithdrawalError::Rejected(reason)),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    let delay = backoff.next_delay();
                    warn!("💸️ Withdrawal attempt {attempt} from {} failed: {e}. Retrying in {delay:?}", account.address);
                    tokio::time::sleep(delay).await;
                },
                Err(e) => return Err(WithdrawalError::SubmissionError(e.to_string())),
            }
        }
    }

    /// Polls the chain until the transaction is final or has failed. If neither happens within the configured number
    /// of checks, [`TxFinality::Pending`] is returned and the caller should check again later.
    pub async fn await_finality(&self, currency: &Currency, tx_id: &str) -> Result<TxFinality, WithdrawalError> {
        let client = self.client(currency)?;
        for check in 1..=self.finality_checks {
            match client.finality(tx_id).await {
                Ok(TxFinality::Pending) => trace!("💸️ {tx_id} is not final yet (check {check})"),
                Ok(finality) => return Ok(finality),
                Err(e) if e.is_transient() => debug!("💸️ Could not check the finality of {tx_id}: {e}"),
                Err(e) => return Err(WithdrawalError::SubmissionError(e.to_string())),
            }
            if check < self.finality_checks {
                tokio::time::sleep(self.finality_interval).await;
            }
        }
        Ok(TxFinality::Pending)
    }
}

#[cfg(test)]
mod test {
    use kalatori_common::Secret;

    use super::*;
    use crate::{
        db_types::{AssetRef, OrderId},
        derivation::AccountDeriver,
        test_utils::{test_config, test_registry, FakeChain, MERCHANT, POLKADOT_RPC, TEST_SEED},
    };

    fn setup() -> (WithdrawalExecutor<FakeChain>, FakeChain, Currency, PaymentAccount) {
        let chain = FakeChain::new("polkadot", POLKADOT_RPC);
        let clients = Arc::new(HashMap::from([(POLKADOT_RPC.to_string(), Arc::new(chain.clone()))]));
        let (registry, _) = test_registry();
        let dot = registry.get("DOT").unwrap().clone();
        let deriver = AccountDeriver::new(Secret::new(TEST_SEED.to_string())).unwrap();
        let account = deriver.derive(&OrderId::from("withdrawal-1"), &dot).unwrap();
        (WithdrawalExecutor::new(clients, &test_config()), chain, dot, account)
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (executor, chain, dot, account) = setup();
        chain.set_balance(&account.address, AssetRef::Native, 500);
        chain.fail_next_submissions(vec![ChainError::SubmissionFailed("timeout".into()); 2]);
        let tx_id = executor.submit(&account, MERCHANT, &dot, BaseUnits::from(400)).await.unwrap();
        let submissions = chain.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].tx_id, tx_id);
        // The whole balance is swept, not just the amount that was asked for
        assert_eq!(submissions[0].amount, 500);
        assert_eq!(chain.balance_of(MERCHANT, AssetRef::Native), 500);
    }

    #[tokio::test]
    async fn submission_gives_up_after_the_configured_attempts() {
        let (executor, chain, dot, account) = setup();
        chain.set_balance(&account.address, AssetRef::Native, 500);
        chain.fail_next_submissions(vec![ChainError::SubmissionFailed("timeout".into()); 3]);
        let err = executor.submit(&account, MERCHANT, &dot, BaseUnits::from(500)).await.unwrap_err();
        assert!(matches!(err, WithdrawalError::SubmissionError(_)));
        assert!(chain.submissions().is_empty());
        assert_eq!(chain.balance_of(&account.address, AssetRef::Native), 500);
    }

    #[tokio::test]
    async fn rejections_and_empty_accounts_are_final() {
        let (executor, chain, dot, account) = setup();
        chain.set_balance(&account.address, AssetRef::Native, 500);
        chain.fail_next_submissions(vec![ChainError::Rejected("bad origin".into())]);
        let err = executor.submit(&account, MERCHANT, &dot, BaseUnits::from(500)).await.unwrap_err();
        assert_eq!(err, WithdrawalError::Rejected("bad origin".into()));

        chain.set_balance(&account.address, AssetRef::Native, 0);
        let err = executor.submit(&account, MERCHANT, &dot, BaseUnits::from(500)).await.unwrap_err();
        assert_eq!(err, WithdrawalError::InsufficientBalance);
        assert!(chain.submissions().is_empty());
    }

    #[tokio::test]
    async fn finality_checks_are_bounded() {
        let (executor, chain, dot, account) = setup();
        chain.set_balance(&account.address, AssetRef::Native, 500);
        chain.set_default_finality(TxFinality::Pending);
        let tx_id = executor.submit(&account, MERCHANT, &dot, BaseUnits::from(500)).await.unwrap();
        assert_eq!(executor.await_finality(&dot, &tx_id).await, Ok(TxFinality::Pending));
        chain.set_finality(&tx_id, TxFinality::Failed);
        assert_eq!(executor.await_finality(&dot, &tx_id).await, Ok(TxFinality::Failed));
        chain.set_finality(&tx_id, TxFinality::Finalized);
        assert_eq!(executor.await_finality(&dot, &tx_id).await, Ok(TxFinality::Finalized));
    }

    #[tokio::test]
    async fn currencies_without_a_client_cannot_be_withdrawn() {
        let (executor, _chain, mut dot, account) = setup();
        dot.rpc_url = "fake://elsewhere".into();
        let err = executor.submit(&account, MERCHANT, &dot, BaseUnits::from(500)).await.unwrap_err();
        assert!(matches!(err, WithdrawalError::SubmissionError(_)));
        assert!(executor.await_finality(&dot, "0x00").await.is_err());
    }
}
