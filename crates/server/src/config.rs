use std::{net::SocketAddr, str::FromStr, time::Duration};

use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid bind address: {0}")]
    InvalidBindAddr(String),
    #[error("invalid gateway setting: {0}")]
    InvalidGateway(String),
    #[error("invalid session setting: {0}")]
    InvalidSession(String),
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind_addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Base64url Ed25519 seed used to mint and verify session tokens.
    pub signing_key: Option<String>,
    /// Previously active verifying keys still honoured during rotation.
    pub fallback_verifying_keys: Vec<String>,
    pub token_ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signing_key: None,
            fallback_verifying_keys: Vec::new(),
            token_ttl_secs: 12 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Pause between the `connected` signal and accepting inbound traffic.
    pub ready_delay_ms: u64,
    pub membership_ttl_secs: u64,
    pub membership_sweep_secs: u64,
    pub ping_ttl_secs: u64,
    pub ping_sweep_secs: u64,
    pub max_connections: usize,
    pub outbound_buffer: usize,
    pub send_timeout_secs: u64,
    pub max_message_length: usize,
    pub history_limit: i64,
    /// Let synthetic identities join and send within their own scope.
    pub permit_unverified_access: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ready_delay_ms: 50,
            membership_ttl_secs: 300,
            membership_sweep_secs: 60,
            ping_ttl_secs: 300,
            ping_sweep_secs: 300,
            max_connections: 256,
            outbound_buffer: 256,
            send_timeout_secs: 10,
            max_message_length: 5000,
            history_limit: 200,
            permit_unverified_access: true,
        }
    }
}

impl GatewayConfig {
    pub fn ready_delay(&self) -> Duration {
        Duration::from_millis(self.ready_delay_ms)
    }

    pub fn membership_ttl(&self) -> Duration {
        Duration::from_secs(self.membership_ttl_secs)
    }

    pub fn membership_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.membership_sweep_secs)
    }

    pub fn ping_ttl(&self) -> Duration {
        Duration::from_secs(self.ping_ttl_secs)
    }

    pub fn ping_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.ping_sweep_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.membership_sweep_secs == 0 || self.ping_sweep_secs == 0 {
            return Err(ConfigError::InvalidGateway(
                "sweep intervals must be non-zero".into(),
            ));
        }
        if self.max_connections == 0 || self.outbound_buffer == 0 {
            return Err(ConfigError::InvalidGateway(
                "connection and buffer limits must be non-zero".into(),
            ));
        }
        if self.max_message_length == 0 {
            return Err(ConfigError::InvalidGateway(
                "max_message_length must be non-zero".into(),
            ));
        }
        if self.history_limit <= 0 {
            return Err(ConfigError::InvalidGateway(
                "history_limit must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: Option<String>,
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub metrics: MetricsConfig,
    pub session: SessionConfig,
    pub gateway: GatewayConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            host: "0.0.0.0".to_string(),
            port: 8080,
            log_format: LogFormat::Compact,
            database_url: None,
            metrics: MetricsConfig::default(),
            session: SessionConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

/// Values supplied on the command line; `None` leaves the loaded value alone.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind_addr: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_format: Option<LogFormat>,
    pub database_url: Option<String>,
    pub metrics_enabled: Option<bool>,
    pub metrics_bind_addr: Option<String>,
    pub session_signing_key: Option<String>,
    pub session_fallback_verifying_keys: Option<Vec<String>>,
    pub ready_delay_ms: Option<u64>,
    pub membership_ttl_secs: Option<u64>,
    pub permit_unverified_access: Option<bool>,
}

impl ServerConfig {
    const ENV_PREFIX: &'static str = "HOMEWARD_SERVER";

    pub fn load() -> Result<Self, ConfigError> {
        let defaults = ServerConfig::default();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/server").required(false))
            .add_source(config::File::with_name("config/server.local").required(false))
            .add_source(
                config::Environment::with_prefix(Self::ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("session.fallback_verifying_keys")
                    .try_parsing(true),
            )
            .set_default("host", defaults.host.clone())?
            .set_default("port", defaults.port as i64)?
            .set_default("log_format", defaults.log_format.as_str())?
            .set_default("metrics.enabled", defaults.metrics.enabled)?;

        let settings: ServerConfig = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Names of `HOMEWARD_SERVER__*` variables present in the environment.
    pub fn environment_override_keys() -> Vec<String> {
        let prefix = format!("{}__", Self::ENV_PREFIX);
        let mut keys: Vec<String> = std::env::vars()
            .filter_map(|(key, _)| key.strip_prefix(&prefix).map(str::to_string))
            .collect();
        keys.sort();
        keys
    }

    pub fn apply_overrides(&mut self, overrides: &CliOverrides) -> Result<(), ConfigError> {
        if let Some(bind_addr) = &overrides.bind_addr {
            self.bind_addr = Some(bind_addr.clone());
        }
        if let Some(host) = &overrides.host {
            self.host = host.clone();
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(format) = overrides.log_format {
            self.log_format = format;
        }
        if let Some(url) = &overrides.database_url {
            self.database_url = Some(url.clone());
        }
        if let Some(enabled) = overrides.metrics_enabled {
            self.metrics.enabled = enabled;
        }
        if let Some(addr) = &overrides.metrics_bind_addr {
            self.metrics.bind_addr = Some(addr.clone());
        }
        if let Some(key) = &overrides.session_signing_key {
            self.session.signing_key = Some(key.clone());
        }
        if let Some(keys) = &overrides.session_fallback_verifying_keys {
            self.session.fallback_verifying_keys = keys.clone();
        }
        if let Some(delay) = overrides.ready_delay_ms {
            self.gateway.ready_delay_ms = delay;
        }
        if let Some(ttl) = overrides.membership_ttl_secs {
            self.gateway.membership_ttl_secs = ttl;
        }
        if let Some(permit) = overrides.permit_unverified_access {
            self.gateway.permit_unverified_access = permit;
        }
        self.validate()
    }

    pub fn listener_addr(&self) -> Result<SocketAddr, ConfigError> {
        if let Some(addr) = &self.bind_addr {
            return addr
                .parse()
                .map_err(|_| ConfigError::InvalidBindAddr(addr.clone()));
        }

        let addr = format!("{}:{}", self.host, self.port);
        addr.parse().map_err(|_| ConfigError::InvalidBindAddr(addr))
    }

    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidBindAddr("port cannot be zero".into()));
        }
        if let Some(addr) = &self.metrics.bind_addr {
            addr.parse::<SocketAddr>()
                .map_err(|_| ConfigError::InvalidBindAddr(addr.clone()))?;
        }
        if self.session.token_ttl_secs == 0 {
            return Err(ConfigError::InvalidSession(
                "token_ttl_secs must be non-zero".into(),
            ));
        }
        self.gateway.validate()
    }
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Compact => "compact",
            LogFormat::Json => "json",
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            other => Err(format!("unsupported log format '{other}'")),
        }
    }
}

impl<'de> Deserialize<'de> for LogFormat {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        LogFormat::from_str(&value).map_err(D::Error::custom)
    }
}
