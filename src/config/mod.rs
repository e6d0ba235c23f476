//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values are wrapped in `secrecy::SecretString` so they never
//! end up in logs. Behavioural switches live in [`Policy`], which can be
//! overridden from a TOML file named by `POLICY_FILE`.

pub mod policy;

pub use policy::{NamespacePolicy, OffloadPolicy, Policy, RateLimitPolicy};

use crate::error::{Error, Result};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    /// Postgres URL. Absent when running purely in memory.
    pub database_url: Option<SecretString>,
    /// HS256 key used to sign and verify bearer tokens.
    pub signing_key: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub policy: Policy,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let policy = match std::env::var("POLICY_FILE") {
            Ok(path) => Policy::from_file(&path)?,
            Err(_) => Policy::default(),
        };

        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok().map(SecretString::from),
            signing_key: SecretString::from(required_var("SIGNING_KEY")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            policy,
        })
    }

    /// The database URL, or an error naming the missing variable.
    pub fn require_database_url(&self) -> Result<&SecretString> {
        self.database_url
            .as_ref()
            .ok_or_else(|| Error::Config("required environment variable DATABASE_URL is not set".into()))
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
