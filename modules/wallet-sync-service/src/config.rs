//! Service configuration, read from the environment (and `.env`).

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub db_path: String,
    pub rpc_url: String,
    /// How often the node's block height is checked
    pub block_poll_ms: u64,
    pub request_timeout_secs: u64,
    /// Watch list used when the database holds none
    pub initial_addresses: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 9104,
            db_path: "./wallet_sync.db".to_string(),
            rpc_url: "http://127.0.0.1:8545".to_string(),
            block_poll_ms: 4000,
            request_timeout_secs: 30,
            initial_addresses: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let port = lookup("WALLET_SYNC_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.port);

        let db_path = lookup("WALLET_SYNC_DB_PATH").unwrap_or(defaults.db_path);

        let rpc_url = lookup("WALLET_SYNC_RPC_URL").unwrap_or(defaults.rpc_url);

        let block_poll_ms = lookup("WALLET_SYNC_BLOCK_POLL_MS")
            .and_then(|s| s.parse().ok())
            .filter(|ms| *ms > 0)
            .unwrap_or(defaults.block_poll_ms);

        let request_timeout_secs = lookup("WALLET_SYNC_REQUEST_TIMEOUT_SECS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.request_timeout_secs);

        let initial_addresses = lookup("WALLET_SYNC_ADDRESSES")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            port,
            db_path,
            rpc_url,
            block_poll_ms,
            request_timeout_secs,
            initial_addresses,
        }
    }

    pub fn block_poll_interval(&self) -> Duration {
        Duration::from_millis(self.block_poll_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
