//! A [`ChainClient`] that talks JSON over HTTP to a chain bridge sidecar.
//!
//! The sidecar owns the node connection, event decoding and extrinsic signing. This client only speaks its small REST
//! protocol:
//!
//! * `GET  {endpoint}/head` returns the latest finalized block.
//! * `GET  {endpoint}/blocks?from={n}` lists blocks from height `n` (or from the finalized head if `from` is omitted).
//! * `GET  {endpoint}/balance/{account}?asset={native|id}` returns the transferable balance of an account.
//! * `POST {endpoint}/transfer_all` sweeps an account and returns the transaction hash.
//! * `GET  {endpoint}/tx/{tx_id}` reports the finality of a submitted transaction.
//!
//! Block subscriptions are implemented by polling.
use std::{collections::VecDeque, time::Duration};

use futures_util::{stream, StreamExt};
use kalatori_common::{BaseUnits, Secret};
use log::*;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::{
    chain::client::{BlockRef, ChainClient, ChainError, ChainEvent, ChainEventStream, ChainTransfer, TxFinality},
    currency::Currency,
    db_types::AssetRef,
};

#[derive(Debug, Clone, Deserialize)]
struct BlockDto {
    number: u64,
    hash: String,
    finalized: bool,
    #[serde(default)]
    transfers: Vec<ChainTransfer>,
}

#[derive(Debug, Deserialize)]
struct HeadDto {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct BalanceDto {
    balance: u128,
}

#[derive(Debug, Serialize)]
struct TransferAllRequest<'a> {
    chain: &'a str,
    asset: AssetRef,
    /// Hex-encoded signing seed of the payment account
    seed: String,
    recipient: &'a str,
}

#[derive(Debug, Deserialize)]
struct TransferAllResponse {
    tx_id: String,
}

#[derive(Debug, Deserialize)]
struct TxStatusDto {
    status: TxFinality,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDto {
    #[serde(default)]
    error: String,
    #[serde(default)]
    code: String,
}

#[derive(Debug, Clone)]
pub struct HttpChainClient {
    endpoint: String,
    client: Client,
    poll_interval: Duration,
}

impl HttpChainClient {
    pub fn new(endpoint: &str) -> Result<Self, ChainError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ChainError::ChainUnavailable(endpoint.to_string(), e.to_string()))?;
        Ok(Self { endpoint: endpoint.trim_end_matches('/').to_string(), client, poll_interval: Duration::from_secs(3) })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn unavailable(&self, e: reqwest::Error) -> ChainError {
        ChainError::ChainUnavailable(self.endpoint.clone(), e.to_string())
    }
}

struct PollState {
    client: Client,
    endpoint: String,
    poll_interval: Duration,
    next: Option<u64>,
    queue: VecDeque<ChainEvent>,
    failed: bool,
}

impl PollState {
    /// Fetches the next batch of blocks and turns them into events. Non-final blocks are fetched again on the next
    /// poll, until they are final.
    async fn poll(&mut self) -> Result<(), ChainError> {
        let url = format!("{}/blocks", self.endpoint);
        let mut request = self.client.get(url);
        if let Some(from) = self.next {
            request = request.query(&[("from", from)]);
        }
        let unavailable = |e: reqwest::Error| ChainError::ChainUnavailable(self.endpoint.clone(), e.to_string());
        let response = request.send().await.map_err(unavailable)?.error_for_status().map_err(unavailable)?;
        let mut blocks = response.json::<Vec<BlockDto>>().await.map_err(|e| ChainError::ProtocolError(e.to_string()))?;
        blocks.sort_by_key(|b| b.number);
        for b in blocks {
            let block = BlockRef { number: b.number, hash: b.hash };
            if b.finalized {
                self.next = Some(b.number + 1);
                self.queue.push_back(ChainEvent::Finalized { block, transfers: Some(b.transfers) });
            } else {
                self.queue.push_back(ChainEvent::InBlock { block, transfers: b.transfers });
            }
        }
        Ok(())
    }
}

impl ChainClient for HttpChainClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn finalized_head(&self) -> Result<u64, ChainError> {
        let url = format!("{}/head", self.endpoint);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.unavailable(e))?
            .error_for_status()
            .map_err(|e| self.unavailable(e))?;
        let dto = response.json::<HeadDto>().await.map_err(|e| ChainError::ProtocolError(e.to_string()))?;
        Ok(dto.number)
    }

    async fn subscribe(&self, resume_from: Option<u64>) -> Result<ChainEventStream, ChainError> {
        let mut state = PollState {
            client: self.client.clone(),
            endpoint: self.endpoint.clone(),
            poll_interval: self.poll_interval,
            next: resume_from,
            queue: VecDeque::new(),
            failed: false,
        };
        // Surface connection problems to the caller rather than on the stream.
        state.poll().await?;
        debug!("🔭️ Subscribed to {} from block {resume_from:?}", self.endpoint);
        let events = stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.queue.pop_front() {
                    return Some((Ok(event), state));
                }
                if state.failed {
                    return None;
                }
                tokio::time::sleep(state.poll_interval).await;
                if let Err(e) = state.poll().await {
                    state.failed = true;
                    return Some((Err(e), state));
                }
            }
        });
        Ok(events.boxed())
    }

    async fn balance(&self, account: &str, currency: &Currency) -> Result<BaseUnits, ChainError> {
        let url = format!("{}/balance/{account}", self.endpoint);
        let response = self
            .client
            .get(url)
            .query(&[("asset", currency.asset_ref().to_string())])
            .send()
            .await
            .map_err(|e| self.unavailable(e))?
            .error_for_status()
            .map_err(|e| self.unavailable(e))?;
        let dto = response.json::<BalanceDto>().await.map_err(|e| ChainError::ProtocolError(e.to_string()))?;
        BaseUnits::try_from(dto.balance).map_err(|e| ChainError::ProtocolError(e.to_string()))
    }

    async fn transfer_all(
        &self,
        signer: &Secret<[u8; 32]>,
        recipient: &str,
        currency: &Currency,
    ) -> Result<String, ChainError> {
        let url = format!("{}/transfer_all", self.endpoint);
        let body = TransferAllRequest {
            chain: &currency.chain_name,
            asset: currency.asset_ref(),
            seed: hex::encode(signer.reveal()),
            recipient,
        };
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChainError::SubmissionFailed(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            let dto = response.json::<TransferAllResponse>().await.map_err(|e| ChainError::ProtocolError(e.to_string()))?;
            return Ok(dto.tx_id);
        }
        let err = response.json::<ErrorDto>().await.unwrap_or_default();
        Err(match (status, err.code.as_str()) {
            (_, "insufficient_balance") => ChainError::InsufficientBalance,
            (StatusCode::UNPROCESSABLE_ENTITY, _) | (_, "rejected") => ChainError::Rejected(err.error),
            _ => ChainError::SubmissionFailed(format!("{status}: {}", err.error)),
        })
    }

    async fn finality(&self, tx_id: &str) -> Result<TxFinality, ChainError> {
        let url = format!("{}/tx/{tx_id}", self.endpoint);
        let response = self.client.get(url).send().await.map_err(|e| self.unavailable(e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(TxFinality::Pending);
        }
        let response = response.error_for_status().map_err(|e| self.unavailable(e))?;
        let dto = response.json::<TxStatusDto>().await.map_err(|e| ChainError::ProtocolError(e.to_string()))?;
        Ok(dto.status)
    }
}
