//! Environment-driven configuration for the API server.

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string.
    pub database_url: String,
    /// Listen address, e.g. `0.0.0.0:8080`.
    pub bind_address: String,
    /// Server pepper for vendor API key hashing. Rotating it invalidates
    /// every issued key.
    pub api_key_hmac_secret: String,
    /// Shared secret verifying inbound payment-collaborator signatures.
    pub checkout_webhook_secret: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: require("DATABASE_URL")?,
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            api_key_hmac_secret: require("API_KEY_HMAC_SECRET")?,
            checkout_webhook_secret: require("CHECKOUT_WEBHOOK_SECRET")?,
        })
    }
}

fn require(key: &str) -> anyhow::Result<String> {
    let value =
        std::env::var(key).map_err(|_| anyhow::anyhow!("{key} environment variable is not set"))?;
    if value.trim().is_empty() {
        anyhow::bail!("{key} environment variable is empty");
    }
    Ok(value)
}
