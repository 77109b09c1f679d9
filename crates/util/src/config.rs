use std::{env, fmt, net::SocketAddr};

use super::{server_bind_address, SecretString};

pub const DEFAULT_DATABASE_URL: &str = "sqlite://data/presence.db?mode=rwc";
pub const DEFAULT_WEBHOOK_PATH: &str = "/api/meraki";
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;
pub const DEFAULT_NAS_PORT: u16 = 5001;
pub const DEFAULT_NAS_ENTRY_ID: &str = "nas";

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// How observation attributes carrying empty values (`""`, `0`, `false`) are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyAttributes {
    #[default]
    Omit,
    Preserve,
}

impl EmptyAttributes {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "omit" => Ok(Self::Omit),
            "preserve" => Ok(Self::Preserve),
            other => Err(ConfigError::InvalidValue {
                var: "MERAKI_EMPTY_ATTRIBUTES",
                value: other.to_string(),
            }),
        }
    }
}

/// Settings for the location webhook endpoint.
#[derive(Debug, Clone)]
pub struct MerakiConfig {
    /// Token echoed back on GET so the vendor can confirm ownership of the URL.
    pub validator: String,
    /// Shared secret every POST body must carry.
    pub secret: SecretString,
    pub webhook_path: String,
    pub empty_attributes: EmptyAttributes,
}

/// Bounds for the presence dispatch queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    pub queue_capacity: usize,
    pub max_in_flight: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

/// Connection settings for the optional Synology DSM entry.
#[derive(Debug, Clone)]
pub struct NasConfig {
    pub entry_id: String,
    pub host: String,
    pub port: u16,
    pub use_https: bool,
    pub username: String,
    pub password: SecretString,
    /// `None` when the setting was never recorded.
    pub verify_ssl: Option<bool>,
    pub macs: Vec<String>,
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub meraki: MerakiConfig,
    pub dispatch: DispatchConfig,
    pub nas: Option<NasConfig>,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;
        let database_url =
            optional("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            meraki: meraki_from_env()?,
            dispatch: dispatch_from_env()?,
            nas: nas_from_env()?,
        })
    }
}

fn meraki_from_env() -> Result<MerakiConfig, ConfigError> {
    let validator = required("MERAKI_VALIDATOR")?;
    let secret = required("MERAKI_SECRET")?;

    let webhook_path =
        optional("MERAKI_WEBHOOK_PATH").unwrap_or_else(|| DEFAULT_WEBHOOK_PATH.to_string());
    if !webhook_path.starts_with('/') {
        return Err(ConfigError::InvalidValue {
            var: "MERAKI_WEBHOOK_PATH",
            value: webhook_path,
        });
    }

    let empty_attributes = match optional("MERAKI_EMPTY_ATTRIBUTES") {
        Some(value) => EmptyAttributes::from_str(&value)?,
        None => EmptyAttributes::default(),
    };

    Ok(MerakiConfig {
        validator,
        secret: SecretString::new(secret),
        webhook_path,
        empty_attributes,
    })
}

fn dispatch_from_env() -> Result<DispatchConfig, ConfigError> {
    Ok(DispatchConfig {
        queue_capacity: positive_usize("PRESENCE_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)?,
        max_in_flight: positive_usize("PRESENCE_MAX_IN_FLIGHT", DEFAULT_MAX_IN_FLIGHT)?,
    })
}

fn nas_from_env() -> Result<Option<NasConfig>, ConfigError> {
    let Some(host) = optional("NAS_HOST") else {
        return Ok(None);
    };

    let port = match optional("NAS_PORT") {
        Some(value) => value.parse::<u16>().map_err(|_| ConfigError::InvalidValue {
            var: "NAS_PORT",
            value,
        })?,
        None => DEFAULT_NAS_PORT,
    };
    let use_https = optional_bool("NAS_USE_HTTPS")?.unwrap_or(true);
    let verify_ssl = optional_bool("NAS_VERIFY_SSL")?;
    let macs = optional("NAS_MAC")
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|mac| !mac.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(Some(NasConfig {
        entry_id: optional("NAS_ENTRY_ID").unwrap_or_else(|| DEFAULT_NAS_ENTRY_ID.to_string()),
        host,
        port,
        use_https,
        username: required("NAS_USERNAME")?,
        password: SecretString::new(required("NAS_PASSWORD")?),
        verify_ssl,
        macs,
    }))
}

fn optional(var: &'static str) -> Option<String> {
    env::var(var).ok().filter(|value| !value.trim().is_empty())
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    optional(var).ok_or(ConfigError::Missing(var))
}

fn optional_bool(var: &'static str) -> Result<Option<bool>, ConfigError> {
    let Some(value) = optional(var) else {
        return Ok(None);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidValue { var, value }),
    }
}

fn positive_usize(var: &'static str, default: usize) -> Result<usize, ConfigError> {
    let Some(value) = optional(var) else {
        return Ok(default);
    };
    match value.parse::<usize>() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(ConfigError::InvalidValue { var, value }),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    Missing(&'static str),
    InvalidValue { var: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::Missing(var) => write!(f, "{var} must be set"),
            Self::InvalidValue { var, value } => write!(f, "invalid {var} value: {value}"),
        }
    }
}

impl std::error::Error for ConfigError {}
