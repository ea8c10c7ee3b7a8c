//! Application configuration module
//!
//! Handles loading and validating configuration from environment variables.
//! Everything the reconciler needs is carried in [`Settings`] and passed
//! explicitly; nothing reads the environment after startup.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::expected::is_valid_identifier;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// Schema (namespace) that is inspected and reconciled
    pub schema: String,
    pub max_pool_size: usize,
    pub use_tls: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            database: "postgres".to_string(),
            schema: "public".to_string(),
            max_pool_size: 2,
            use_tls: false,
        }
    }
}

impl DatabaseConfig {
    /// Connection string with the password masked, safe for logs
    pub fn to_display_string(&self) -> String {
        format!(
            "postgres://{}:****@{}:{}/{}",
            self.user, self.host, self.port, self.database
        )
    }
}

/// Timeouts applied to every connection
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    pub connect: Duration,
    pub pool_wait: Duration,
    pub statement: Duration,
    pub lock: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            pool_wait: Duration::from_secs(15),
            statement: Duration::from_secs(60),
            lock: Duration::from_secs(10),
        }
    }
}

/// Ledger table configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub table: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            table: "schema_reconciliation_ledger".to_string(),
        }
    }
}

/// Advisory lock configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Key passed to `pg_try_advisory_lock`
    pub key: i64,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

impl LockConfig {
    /// Derive a stable lock key from the ledger table name, so every process
    /// reconciling into the same ledger contends for the same lock.
    pub fn key_for_ledger(table: &str) -> i64 {
        let digest = Sha256::digest(format!("schema-reconciler:{table}").as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        i64::from_be_bytes(bytes)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            key: Self::key_for_ledger(&LedgerConfig::default().table),
            retry_attempts: 10,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// Complete application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub timeouts: TimeoutConfig,
    pub ledger: LedgerConfig,
    pub lock: LockConfig,
    pub expected_schema_path: PathBuf,
}

impl Settings {
    /// Load settings from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Try DATABASE_URL first, fall back to individual vars
        let mut database = match lookup("DATABASE_URL") {
            Some(url) => Self::parse_database_url(&url)?,
            None => {
                let database = lookup("DB_NAME")
                    .ok_or_else(|| ConfigError::MissingVar("DATABASE_URL or DB_NAME".to_string()))?;
                DatabaseConfig {
                    host: lookup("DB_HOST").unwrap_or_else(|| "localhost".to_string()),
                    port: parse_or(&lookup, "DB_PORT", 5432)?,
                    user: lookup("DB_USER").unwrap_or_else(|| "postgres".to_string()),
                    password: lookup("DB_PASSWORD").unwrap_or_default(),
                    database,
                    ..DatabaseConfig::default()
                }
            }
        };

        if let Some(schema) = lookup("DB_SCHEMA") {
            database.schema = schema;
        }
        database.max_pool_size = parse_or(&lookup, "DB_MAX_CONNECTIONS", database.max_pool_size)?;
        if let Some(flag) = lookup("DB_SSL") {
            database.use_tls = parse_bool(&flag)
                .ok_or_else(|| ConfigError::InvalidValue(format!("DB_SSL={flag}")))?;
        }

        if !is_valid_identifier(&database.schema) {
            return Err(ConfigError::InvalidValue(format!(
                "DB_SCHEMA '{}' is not a valid identifier",
                database.schema
            )));
        }

        let defaults = TimeoutConfig::default();
        let timeouts = TimeoutConfig {
            connect: Duration::from_secs(parse_or(&lookup, "DB_CONNECT_TIMEOUT_SECS", defaults.connect.as_secs())?),
            pool_wait: Duration::from_secs(parse_or(&lookup, "DB_POOL_WAIT_SECS", defaults.pool_wait.as_secs())?),
            statement: Duration::from_millis(parse_or(
                &lookup,
                "DB_STATEMENT_TIMEOUT_MS",
                millis(defaults.statement),
            )?),
            lock: Duration::from_millis(parse_or(&lookup, "DB_LOCK_TIMEOUT_MS", millis(defaults.lock))?),
        };
        if timeouts.connect.is_zero() || timeouts.statement.is_zero() || timeouts.lock.is_zero() {
            return Err(ConfigError::InvalidValue(
                "timeouts must be greater than zero".to_string(),
            ));
        }

        let ledger = LedgerConfig {
            table: lookup("LEDGER_TABLE").unwrap_or_else(|| LedgerConfig::default().table),
        };
        if !is_valid_identifier(&ledger.table) {
            return Err(ConfigError::InvalidValue(format!(
                "LEDGER_TABLE '{}' is not a valid identifier",
                ledger.table
            )));
        }

        let lock_defaults = LockConfig::default();
        let lock = LockConfig {
            key: match lookup("RECONCILE_LOCK_KEY") {
                Some(raw) => raw
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue(format!("RECONCILE_LOCK_KEY={raw}")))?,
                None => LockConfig::key_for_ledger(&ledger.table),
            },
            retry_attempts: parse_or(&lookup, "RECONCILE_LOCK_ATTEMPTS", lock_defaults.retry_attempts)?
                .max(1),
            retry_delay: Duration::from_millis(parse_or(
                &lookup,
                "RECONCILE_LOCK_RETRY_MS",
                millis(lock_defaults.retry_delay),
            )?),
        };

        let expected_schema_path = lookup("EXPECTED_SCHEMA_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("schema/expected.json"));

        Ok(Self {
            database,
            timeouts,
            ledger,
            lock,
            expected_schema_path,
        })
    }

    /// Parse a DATABASE_URL connection string (postgresql://...)
    fn parse_database_url(raw: &str) -> Result<DatabaseConfig, ConfigError> {
        let parsed = url::Url::parse(raw).map_err(|_| {
            ConfigError::InvalidValue(
                "Invalid DATABASE_URL format (expected postgresql://...)".to_string(),
            )
        })?;

        if parsed.scheme() != "postgres" && parsed.scheme() != "postgresql" {
            return Err(ConfigError::InvalidValue(format!(
                "Unsupported DATABASE_URL scheme '{}'",
                parsed.scheme()
            )));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| ConfigError::InvalidValue("Missing host in DATABASE_URL".to_string()))?
            .to_string();

        let database = parsed.path().trim_start_matches('/').to_string();
        if database.is_empty() {
            return Err(ConfigError::InvalidValue(
                "Missing database name in DATABASE_URL".to_string(),
            ));
        }

        let user = if parsed.username().is_empty() {
            "postgres".to_string()
        } else {
            decode(parsed.username())
        };

        let use_tls = parsed
            .query_pairs()
            .any(|(k, v)| k == "sslmode" && (v == "require" || v == "verify-full" || v == "verify-ca"));

        Ok(DatabaseConfig {
            host,
            port: parsed.port().unwrap_or(5432),
            user,
            password: parsed.password().map(decode).unwrap_or_default(),
            database,
            use_tls,
            ..DatabaseConfig::default()
        })
    }
}

fn decode(raw: &str) -> String {
    url::form_urlencoded::parse(format!("v={}", raw.replace('+', "%2B")).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_else(|| raw.to_string())
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}"))),
        None => Ok(default),
    }
}
