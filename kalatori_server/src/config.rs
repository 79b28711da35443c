use std::{env, fmt::Display, str::FromStr, time::Duration};

use kalatori_common::{parse_boolean_flag, random_instance_name, Secret};
use kalatori_engine::{
    currency::{ChainsConfig, CurrencyRegistry, Recipients},
    EngineConfig,
};
use log::*;

use crate::{data_objects::ServerInfo, errors::ServerError};

const DEFAULT_KALATORI_HOST: &str = "127.0.0.1";
const DEFAULT_KALATORI_PORT: u16 = 16726;
const DEFAULT_DATABASE_URL: &str = "sqlite://data/kalatori.db";
const DEFAULT_CHAINS_FILE: &str = "configs/chains.toml";
const DEFAULT_ORDER_LIFETIME_HOURS: i64 = 24;
const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 60;
const DEFAULT_WITHDRAWAL_ATTEMPTS: u32 = 5;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// The master secret that every payment account is derived from.
    pub seed: Secret<String>,
    /// The recipient for currencies that do not name their own in the chains file.
    pub default_recipient: Option<String>,
    pub chains_file: String,
    /// The time an unpaid order is watched before it expires.
    pub order_lifetime: chrono::Duration,
    pub maintenance_interval: Duration,
    pub withdrawal_attempts: u32,
    pub debug: bool,
    /// Free text, reported by the status endpoint.
    pub remark: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_KALATORI_HOST.to_string(),
            port: DEFAULT_KALATORI_PORT,
            database_url: DEFAULT_DATABASE_URL.to_string(),
            seed: Secret::default(),
            default_recipient: None,
            chains_file: DEFAULT_CHAINS_FILE.to_string(),
            order_lifetime: chrono::Duration::hours(DEFAULT_ORDER_LIFETIME_HOURS),
            maintenance_interval: Duration::from_secs(DEFAULT_MAINTENANCE_INTERVAL_SECS),
            withdrawal_attempts: DEFAULT_WITHDRAWAL_ATTEMPTS,
            debug: false,
            remark: String::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self { host: host.to_string(), port, ..Default::default() }
    }

    pub fn from_env_or_default() -> Self {
        let host = env::var("KALATORI_HOST").ok().unwrap_or_else(|| DEFAULT_KALATORI_HOST.into());
        let port = parse_env("KALATORI_PORT", DEFAULT_KALATORI_PORT);
        let database_url = env::var("KALATORI_DATABASE_URL").ok().unwrap_or_else(|| {
            info!("🪛️ KALATORI_DATABASE_URL is not set. Using {DEFAULT_DATABASE_URL}.");
            DEFAULT_DATABASE_URL.into()
        });
        let seed = env::var("KALATORI_SEED").ok().unwrap_or_else(|| {
            error!("🪛️ KALATORI_SEED is not set. Please set it to the master secret for payment account derivation.");
            String::default()
        });
        let default_recipient = env::var("KALATORI_RECIPIENT").ok().filter(|s| !s.trim().is_empty());
        if default_recipient.is_none() {
            info!("🪛️ KALATORI_RECIPIENT is not set. Every currency in the chains file must name its own recipient.");
        }
        let chains_file = env::var("KALATORI_CHAINS_FILE").ok().unwrap_or_else(|| {
            info!("🪛️ KALATORI_CHAINS_FILE is not set. Using {DEFAULT_CHAINS_FILE}.");
            DEFAULT_CHAINS_FILE.into()
        });
        let order_lifetime =
            chrono::Duration::hours(parse_env("KALATORI_ORDER_LIFETIME", DEFAULT_ORDER_LIFETIME_HOURS));
        let maintenance_interval =
            Duration::from_secs(parse_env("KALATORI_MAINTENANCE_INTERVAL", DEFAULT_MAINTENANCE_INTERVAL_SECS).max(1));
        let withdrawal_attempts = parse_env("KALATORI_WITHDRAWAL_ATTEMPTS", DEFAULT_WITHDRAWAL_ATTEMPTS);
        let debug = parse_boolean_flag(env::var("KALATORI_DEBUG").ok(), false);
        let remark = env::var("KALATORI_REMARK").unwrap_or_default();
        Self {
            host,
            port,
            database_url,
            seed: Secret::new(seed),
            default_recipient,
            chains_file,
            order_lifetime,
            maintenance_interval,
            withdrawal_attempts,
            debug,
            remark,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            order_lifetime: self.order_lifetime,
            withdrawal_attempts: self.withdrawal_attempts,
            ..Default::default()
        }
    }

    /// Reads the chains file and builds the currency registry. Any invalid entry is fatal.
    pub fn load_registry(&self) -> Result<(CurrencyRegistry, Recipients), ServerError> {
        let contents = std::fs::read_to_string(&self.chains_file).map_err(|e| {
            ServerError::ConfigurationError(format!("Could not read the chains file {}. {e}", self.chains_file))
        })?;
        let (registry, recipients) = ChainsConfig::from_toml(&contents)
            .and_then(|c| c.into_registry(self.default_recipient.as_deref()))
            .map_err(|e| ServerError::ConfigurationError(e.to_string()))?;
        if registry.is_empty() {
            return Err(ServerError::ConfigurationError(format!("{} defines no currencies", self.chains_file)));
        }
        Ok((registry, recipients))
    }
}

fn parse_env<T>(name: &str, default: T) -> T
where
    T: FromStr + Display + Copy,
    T::Err: Display,
{
    match env::var(name) {
        Ok(s) => s.trim().parse::<T>().unwrap_or_else(|e| {
            warn!("🪛️ {s} is not a valid value for {name}. {e} Using the default, {default}, instead.");
            default
        }),
        Err(_) => {
            debug!("🪛️ {name} is not set. Using the default value of {default}.");
            default
        },
    }
}

//-------------------------------------------------  ServerOptions  ----------------------------------------------------
/// The part of the configuration that request handlers see. Contains no secrets.
#[derive(Clone, Debug)]
pub struct ServerOptions {
    pub server_info: ServerInfo,
    pub description: String,
}

impl ServerOptions {
    pub fn from_config(config: &ServerConfig) -> Self {
        let server_info = ServerInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            instance_id: random_instance_name(rand::random()),
            debug: config.debug,
        };
        Self { server_info, description: config.remark.clone() }
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    #[test]
    fn load_registry_from_file() {
        let path = std::env::temp_dir().join(format!("kalatori_chains_{}.toml", rand::random::<u64>()));
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
            [[chain]]
            name = "polkadot"
            endpoint = "http://127.0.0.1:9944"
            ss58 = 0

            [[chain.currency]]
            symbol = "DOT"
            kind = "native"
            decimals = 10
            "#
        )
        .unwrap();
        let config = ServerConfig {
            chains_file: path.display().to_string(),
            default_recipient: Some("15oF4uVJwmo4TdGW7VfQxNLavjCXviqxT9S1MgbjMNHr6Sp5".into()),
            ..Default::default()
        };
        let (registry, recipients) = config.load_registry().unwrap();
        assert_eq!(registry.get("DOT").unwrap().decimals, 10);
        assert_eq!(recipients["DOT"], "15oF4uVJwmo4TdGW7VfQxNLavjCXviqxT9S1MgbjMNHr6Sp5");

        let no_recipient = ServerConfig { default_recipient: None, ..config };
        assert!(matches!(no_recipient.load_registry(), Err(ServerError::ConfigurationError(_))));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_chains_file() {
        let config = ServerConfig { chains_file: "/nonexistent/chains.toml".into(), ..Default::default() };
        let err = config.load_registry().unwrap_err();
        assert!(err.to_string().contains("/nonexistent/chains.toml"));
    }

    #[test]
    fn engine_config_uses_server_settings() {
        let config = ServerConfig {
            order_lifetime: chrono::Duration::hours(2),
            withdrawal_attempts: 9,
            ..ServerConfig::new("0.0.0.0", 8080)
        };
        let engine = config.engine_config();
        assert_eq!(engine.order_lifetime, chrono::Duration::hours(2));
        assert_eq!(engine.withdrawal_attempts, 9);
        assert_eq!(config.port, 8080);
    }
}
