//! Error types for node access and reconciliation.

use ethers::types::Address;
use thiserror::Error;

/// Failure talking to the remote node
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("decode error: {0}")]
    Decode(String),

    /// The node no longer knows the filter (expired or node restarted)
    #[error("filter not found")]
    FilterNotFound,
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// A single address's detail fetch failed; its facets stay stale
    #[error("detail fetch for {address:?} failed: {source}")]
    TransientFetch {
        address: Address,
        #[source]
        source: NodeError,
    },

    /// Filter creation or poll failed; retried on the next tick
    #[error("subscription error: {0}")]
    Subscription(#[source] NodeError),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("reconciler is not running")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, SyncError>;
