use crate::codec::WireFormat;
use crate::topics::DEFAULT_HALT_KEY;
use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub store: StoreConfig,
    pub risk: RiskConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    /// Embedded redb log; every role runs inside this process.
    #[default]
    Redb,
    /// NATS JetStream; roles may run as separate processes.
    #[serde(alias = "nats")]
    JetStream,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BusConfig {
    pub backend: BusBackend,
    /// Backing-store host for the JetStream backend.
    pub nats_url: String,
    /// Database file for the redb backend.
    pub db_path: String,
    pub block_ms: u64,
    pub claim_idle_ms: u64,
    pub ack_wait_ms: u64,
    pub max_deliveries: u32,
    pub wire_format: WireFormat,
    pub error_backoff_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::Redb,
            nats_url: "nats://localhost:4222".to_string(),
            db_path: "data/trading_firm.redb".to_string(),
            block_ms: 5000,
            claim_idle_ms: 60_000,
            ack_wait_ms: 30_000,
            max_deliveries: 5,
            wire_format: WireFormat::Json,
            error_backoff_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub halt_key: String,
    /// KV bucket used by the JetStream backend.
    pub kv_bucket: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            halt_key: DEFAULT_HALT_KEY.to_string(),
            kv_bucket: "coordination".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RiskConfig {
    /// Ceiling on |net notional| in USD. No default: an agent must be told its limit.
    pub max_notional_usd: Decimal,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Watchdog,
    HoldGate,
    SignalMaker,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub consumer_id: String,
    pub roles: Vec<AgentRole>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "trading-firm".to_string(),
            consumer_id: crate::topics::DEFAULT_CONSUMER.to_string(),
            roles: vec![AgentRole::Watchdog, AgentRole::HoldGate],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 3002,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let home = env::var("HOME").unwrap_or_else(|_| ".".into());

        let builder = Config::builder()
            // 1. Global config from ~/.trading-firm/config.{toml,json,ini}
            .add_source(File::with_name(&format!("{}/.trading-firm/config", home)).required(false))
            // 2. Project config
            .add_source(File::with_name("config/config").required(false))
            // 3. Local overrides (not checked in)
            .add_source(File::with_name("config/local").required(false))
            // 4. Environment, e.g. FIRM_RISK__MAX_NOTIONAL_USD=50000
            .add_source(
                Environment::with_prefix("FIRM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        Self::from_builder(builder)
    }

    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.risk.max_notional_usd <= Decimal::ZERO {
            return Err(ConfigError::Message(format!(
                "risk.max_notional_usd must be positive, got {}",
                self.risk.max_notional_usd
            )));
        }
        if self.bus.block_ms == 0 {
            return Err(ConfigError::Message("bus.block_ms must be non-zero".into()));
        }
        if self.agent.roles.is_empty() {
            return Err(ConfigError::Message("agent.roles is empty".into()));
        }
        if self.store.halt_key.trim().is_empty() {
            return Err(ConfigError::Message("store.halt_key is empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;
    use rust_decimal_macros::dec;

    fn from_toml(raw: &str) -> Result<Settings, ConfigError> {
        Settings::from_builder(Config::builder().add_source(File::from_str(raw, FileFormat::Toml)))
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let settings = from_toml("[risk]\nmax_notional_usd = 50000\n").unwrap();

        assert_eq!(settings.risk.max_notional_usd, dec!(50000));
        assert_eq!(settings.bus.backend, BusBackend::Redb);
        assert_eq!(settings.bus.block_ms, 5000);
        assert_eq!(settings.store.halt_key, "system_halt");
        assert_eq!(settings.agent.consumer_id, "consumer-1");
        assert_eq!(
            settings.agent.roles,
            vec![AgentRole::Watchdog, AgentRole::HoldGate]
        );
        assert_eq!(settings.api.port, 3002);
    }

    #[test]
    fn test_risk_ceiling_is_required() {
        assert!(from_toml("[bus]\nblock_ms = 100\n").is_err());
    }

    #[test]
    fn test_rejects_non_positive_ceiling() {
        assert!(from_toml("[risk]\nmax_notional_usd = 0\n").is_err());
    }

    #[test]
    fn test_partial_sections_merge_with_defaults() {
        let raw = r#"
            [bus]
            backend = "jetstream"
            nats_url = "nats://bus.internal:4222"
            wire_format = "msgpack"

            [store]
            halt_key = "firm:halt"

            [risk]
            max_notional_usd = "125000.50"

            [agent]
            roles = ["watchdog", "signal_maker"]
        "#;
        let settings = from_toml(raw).unwrap();

        assert_eq!(settings.bus.backend, BusBackend::JetStream);
        assert_eq!(settings.bus.nats_url, "nats://bus.internal:4222");
        assert_eq!(settings.bus.wire_format, WireFormat::MsgPack);
        assert_eq!(settings.bus.claim_idle_ms, 60_000);
        assert_eq!(settings.store.halt_key, "firm:halt");
        assert_eq!(settings.store.kv_bucket, "coordination");
        assert_eq!(settings.risk.max_notional_usd, dec!(125000.50));
        assert!(settings.agent.roles.contains(&AgentRole::SignalMaker));
    }
}
