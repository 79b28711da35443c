//! Helpers for testing the engine against a real SQLite database and in-memory chains.
pub mod fake_chain;
pub mod prepare_env;

use std::{collections::HashMap, sync::Arc, time::Duration};

use kalatori_common::Secret;

pub use fake_chain::{FakeChain, Submission};
use prepare_env::{prepare_test_env, random_db_path};

use crate::{
    currency::{Currency, CurrencyKind, CurrencyRegistry, Recipients},
    derivation::AccountDeriver,
    events::EventProducers,
    kpe_api::{order_objects::EngineConfig, reconciliation::ReconciliationEngine},
    SqliteDatabase,
};

pub const TEST_SEED: &str = "bottom drive obey lake curtain smoke basket hold race lonely fit walk";
pub const POLKADOT_RPC: &str = "fake://polkadot";
pub const ASSET_HUB_RPC: &str = "fake://asset-hub";
/// Alice's well-known account, on the Polkadot network
pub const MERCHANT: &str = "15oF4uVJwmo4TdGW7VfQxNLavjCXviqxT9S1MgbjMNHr6Sp5";

/// DOT on Polkadot, and USDC (asset 1337) and USDT (asset 1984) on Asset Hub.
pub fn test_registry() -> (CurrencyRegistry, Recipients) {
    let currency = |symbol: &str, chain: &str, rpc: &str, kind: CurrencyKind, decimals: u8, asset_id: Option<u32>| Currency {
        symbol: symbol.to_string(),
        chain_name: chain.to_string(),
        kind,
        decimals,
        rpc_url: rpc.to_string(),
        asset_id,
        ss58: Some(0),
    };
    let currencies = vec![
        currency("DOT", "polkadot", POLKADOT_RPC, CurrencyKind::Native, 10, None),
        currency("USDC", "asset-hub", ASSET_HUB_RPC, CurrencyKind::Asset, 6, Some(1337)),
        currency("USDT", "asset-hub", ASSET_HUB_RPC, CurrencyKind::Asset, 6, Some(1984)),
    ];
    let recipients = currencies.iter().map(|c| (c.symbol.clone(), MERCHANT.to_string())).collect();
    let registry = CurrencyRegistry::new(currencies).expect("Test registry is valid");
    (registry, recipients)
}

/// Timings that keep tests fast.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        withdrawal_attempts: 3,
        retry_delay: Duration::from_millis(10),
        max_retry_delay: Duration::from_millis(50),
        finality_checks: 3,
        finality_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

pub type TestEngine = ReconciliationEngine<SqliteDatabase, FakeChain>;

/// An engine wired to a fresh SQLite database and two fake chains.
pub struct TestHarness {
    pub engine: TestEngine,
    pub db: SqliteDatabase,
    pub db_url: String,
    pub polkadot: FakeChain,
    pub asset_hub: FakeChain,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_config(test_config(), EventProducers::default()).await
    }

    pub async fn with_config(config: EngineConfig, producers: EventProducers) -> Self {
        let db_url = random_db_path();
        prepare_test_env(&db_url).await;
        let polkadot = FakeChain::new("polkadot", POLKADOT_RPC);
        let asset_hub = FakeChain::new("asset-hub", ASSET_HUB_RPC);
        Self::open(db_url, polkadot, asset_hub, config, producers).await
    }

    /// A new engine on the same database and chains, as if the process had been restarted.
    pub async fn restart(&self) -> Self {
        let config = self.engine.config().clone();
        Self::open(self.db_url.clone(), self.polkadot.clone(), self.asset_hub.clone(), config, EventProducers::default())
            .await
    }

    async fn open(
        db_url: String,
        polkadot: FakeChain,
        asset_hub: FakeChain,
        config: EngineConfig,
        producers: EventProducers,
    ) -> Self {
        let db = SqliteDatabase::new_with_url(&db_url, 5).await.expect("Error opening test database");
        let (registry, recipients) = test_registry();
        let deriver = AccountDeriver::new(Secret::new(TEST_SEED.to_string())).expect("Test seed is valid");
        let clients = HashMap::from([
            (POLKADOT_RPC.to_string(), Arc::new(polkadot.clone())),
            (ASSET_HUB_RPC.to_string(), Arc::new(asset_hub.clone())),
        ]);
        let engine = ReconciliationEngine::new(db.clone(), registry, recipients, deriver, clients, config, producers);
        Self { engine, db, db_url, polkadot, asset_hub }
    }
}
