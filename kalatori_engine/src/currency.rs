//! The currency registry.
//!
//! The registry maps currency symbols (`DOT`, `USDC`, ...) to the chain they live on, the RPC endpoint used to
//! reach that chain, their decimal precision and, for non-native assets, the asset id. It is loaded once at startup
//! from the chains file and is immutable thereafter, so it is shared behind an `Arc` without locking.
use std::collections::{BTreeMap, HashMap};

use log::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db_types::AssetRef;
use kalatori_common::MAX_DECIMALS;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Currency {0} is defined more than once")]
    DuplicateSymbol(String),
    #[error("Currency {0} is an asset, but has no asset_id")]
    MissingAssetId(String),
    #[error("Currency {0} has {1} decimals, which is more than the supported maximum")]
    TooManyDecimals(String, u8),
    #[error("No recipient is configured for {0}, and no default recipient was given")]
    MissingRecipient(String),
    #[error("Could not parse the chains configuration. {0}")]
    InvalidConfiguration(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurrencyKind {
    Native,
    Asset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Currency {
    #[serde(rename = "currency")]
    pub symbol: String,
    pub chain_name: String,
    pub kind: CurrencyKind,
    pub decimals: u8,
    pub rpc_url: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub asset_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ss58: Option<u16>,
}

impl Currency {
    pub fn asset_ref(&self) -> AssetRef {
        match (self.kind, self.asset_id) {
            (CurrencyKind::Asset, Some(id)) => AssetRef::Asset(id),
            _ => AssetRef::Native,
        }
    }

    /// A transfer only counts towards an order if both the chain and the asset identity match exactly.
    pub fn matches(&self, chain_name: &str, asset: AssetRef) -> bool {
        self.chain_name == chain_name && self.asset_ref() == asset
    }
}

/// Maps currency symbols to the merchant address that receives withdrawals in that currency.
pub type Recipients = HashMap<String, String>;

#[derive(Debug, Clone, Default)]
pub struct CurrencyRegistry {
    currencies: BTreeMap<String, Currency>,
}

impl CurrencyRegistry {
    pub fn new(currencies: Vec<Currency>) -> Result<Self, RegistryError> {
        let mut map = BTreeMap::new();
        for currency in currencies {
            if currency.kind == CurrencyKind::Asset && currency.asset_id.is_none() {
                return Err(RegistryError::MissingAssetId(currency.symbol));
            }
            if currency.decimals > MAX_DECIMALS {
                return Err(RegistryError::TooManyDecimals(currency.symbol, currency.decimals));
            }
            let symbol = currency.symbol.clone();
            if map.insert(symbol.clone(), currency).is_some() {
                return Err(RegistryError::DuplicateSymbol(symbol));
            }
        }
        Ok(Self { currencies: map })
    }

    pub fn get(&self, symbol: &str) -> Option<&Currency> {
        self.currencies.get(symbol)
    }

    pub fn currencies(&self) -> &BTreeMap<String, Currency> {
        &self.currencies
    }

    /// The currency that `asset` on `chain_name` stands for, if it is configured.
    pub fn find(&self, chain_name: &str, asset: AssetRef) -> Option<&Currency> {
        self.currencies.values().find(|c| c.matches(chain_name, asset))
    }

    pub fn is_empty(&self) -> bool {
        self.currencies.is_empty()
    }

    /// Groups the currencies by RPC endpoint. One chain watcher runs per distinct endpoint.
    pub fn endpoints(&self) -> BTreeMap<String, Vec<Currency>> {
        let mut result: BTreeMap<String, Vec<Currency>> = BTreeMap::new();
        for currency in self.currencies.values() {
            result.entry(currency.rpc_url.clone()).or_default().push(currency.clone());
        }
        result
    }
}

//-------------------------------------------------  Chains file  ------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ChainsConfig {
    #[serde(default, rename = "chain")]
    pub chains: Vec<ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    pub endpoint: String,
    pub ss58: Option<u16>,
    #[serde(default, rename = "currency")]
    pub currencies: Vec<CurrencyConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CurrencyConfig {
    pub symbol: String,
    pub kind: CurrencyKind,
    pub decimals: u8,
    pub asset_id: Option<u32>,
    pub recipient: Option<String>,
}

impl ChainsConfig {
    pub fn from_toml(s: &str) -> Result<Self, RegistryError> {
        toml::from_str(s).map_err(|e| RegistryError::InvalidConfiguration(e.to_string()))
    }

    /// Builds the registry and the recipient table. Every currency must end up with a recipient, either its own or
    /// `default_recipient`.
    pub fn into_registry(
        self,
        default_recipient: Option<&str>,
    ) -> Result<(CurrencyRegistry, Recipients), RegistryError> {
        let mut currencies = Vec::new();
        let mut recipients = Recipients::new();
        for chain in self.chains {
            for c in chain.currencies {
                let recipient = c
                    .recipient
                    .or_else(|| default_recipient.map(String::from))
                    .ok_or_else(|| RegistryError::MissingRecipient(c.symbol.clone()))?;
                recipients.insert(c.symbol.clone(), recipient);
                currencies.push(Currency {
                    symbol: c.symbol,
                    chain_name: chain.name.clone(),
                    kind: c.kind,
                    decimals: c.decimals,
                    rpc_url: chain.endpoint.clone(),
                    asset_id: c.asset_id,
                    ss58: chain.ss58,
                });
            }
        }
        let registry = CurrencyRegistry::new(currencies)?;
        info!("🪛️ Currency registry loaded with {} currencies", registry.currencies().len());
        Ok((registry, recipients))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const CHAINS: &str = r#"
        [[chain]]
        name = "polkadot"
        endpoint = "http://127.0.0.1:9000/polkadot"
        ss58 = 0

        [[chain.currency]]
        symbol = "DOT"
        kind = "native"
        decimals = 10

        [[chain]]
        name = "statemint"
        endpoint = "http://127.0.0.1:9000/statemint"
        ss58 = 0

        [[chain.currency]]
        symbol = "USDC"
        kind = "asset"
        decimals = 6
        asset_id = 1337
        recipient = "13UVJyLnbVp8c4FQeiGCsV4Ydn8ysWSCrX5iXfL9mhHhXtLN"

        [[chain.currency]]
        symbol = "USDT"
        kind = "asset"
        decimals = 6
        asset_id = 1984
    "#;

    #[test]
    fn load_chains_file() {
        let config = ChainsConfig::from_toml(CHAINS).expect("valid toml");
        let (registry, recipients) = config.into_registry(Some("default-recipient")).expect("valid registry");
        assert_eq!(registry.currencies().len(), 3);
        let usdc = registry.get("USDC").unwrap();
        assert_eq!(usdc.asset_ref(), AssetRef::Asset(1337));
        assert_eq!(usdc.chain_name, "statemint");
        assert_eq!(registry.find("statemint", AssetRef::Asset(1984)).map(|c| c.symbol.as_str()), Some("USDT"));
        assert_eq!(registry.find("polkadot", AssetRef::Native).map(|c| c.symbol.as_str()), Some("DOT"));
        assert!(registry.find("polkadot", AssetRef::Asset(1337)).is_none());
        assert_eq!(recipients["USDC"], "13UVJyLnbVp8c4FQeiGCsV4Ydn8ysWSCrX5iXfL9mhHhXtLN");
        assert_eq!(recipients["DOT"], "default-recipient");
        let endpoints = registry.endpoints();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints["http://127.0.0.1:9000/statemint"].len(), 2);
    }

    #[test]
    fn missing_recipient_is_an_error() {
        let config = ChainsConfig::from_toml(CHAINS).unwrap();
        let err = config.into_registry(None).unwrap_err();
        assert!(matches!(err, RegistryError::MissingRecipient(_)));
    }

    #[test]
    fn registry_invariants() {
        let dot = Currency {
            symbol: "DOT".into(),
            chain_name: "polkadot".into(),
            kind: CurrencyKind::Native,
            decimals: 10,
            rpc_url: "ws://localhost".into(),
            asset_id: None,
            ss58: Some(0),
        };
        let err = CurrencyRegistry::new(vec![dot.clone(), dot.clone()]).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateSymbol("DOT".into()));
        let bad_asset = Currency { symbol: "USDC".into(), kind: CurrencyKind::Asset, ..dot.clone() };
        let err = CurrencyRegistry::new(vec![bad_asset]).unwrap_err();
        assert_eq!(err, RegistryError::MissingAssetId("USDC".into()));
    }

    #[test]
    fn currency_matching_requires_chain_and_asset() {
        let usdc = Currency {
            symbol: "USDC".into(),
            chain_name: "statemint".into(),
            kind: CurrencyKind::Asset,
            decimals: 6,
            rpc_url: "ws://localhost".into(),
            asset_id: Some(1337),
            ss58: Some(0),
        };
        assert!(usdc.matches("statemint", AssetRef::Asset(1337)));
        assert!(!usdc.matches("statemint", AssetRef::Asset(1984)));
        assert!(!usdc.matches("statemint", AssetRef::Native));
        assert!(!usdc.matches("polkadot", AssetRef::Asset(1337)));
        let json = serde_json::to_value(&usdc).unwrap();
        assert_eq!(json["currency"], "USDC");
        assert_eq!(json["kind"], "asset");
        assert_eq!(json["asset_id"], 1337);
    }
}
