//! Shared types for the wallet sync service and its RPC clients.

use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

// =====================================================
// Domain Types
// =====================================================

/// One independently fetchable field of a wallet record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facet {
    Owners,
    Require,
    Transactions,
    Operations,
}

impl Facet {
    pub const ALL: [Facet; 4] = [
        Facet::Owners,
        Facet::Require,
        Facet::Transactions,
        Facet::Operations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Facet::Owners => "owners",
            Facet::Require => "require",
            Facet::Transactions => "transactions",
            Facet::Operations => "operations",
        }
    }
}

/// Known state of a multisig wallet contract.
///
/// Every facet is optional: a record only carries the facets that have been
/// resolved so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRecord {
    pub address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owners: Option<Vec<Address>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations: Option<Vec<H256>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transactions: Option<bool>,
}

impl WalletRecord {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            owners: None,
            require: None,
            operations: None,
            transactions: None,
        }
    }

    /// Facets that currently hold a value
    pub fn resolved_facets(&self) -> Vec<Facet> {
        Facet::ALL
            .into_iter()
            .filter(|facet| match facet {
                Facet::Owners => self.owners.is_some(),
                Facet::Require => self.require.is_some(),
                Facet::Transactions => self.transactions.is_some(),
                Facet::Operations => self.operations.is_some(),
            })
            .collect()
    }
}

// =====================================================
// RPC Request Types
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct SetWatchlistRequest {
    pub addresses: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetWalletRequest {
    pub address: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RefreshRequest {
    /// Addresses to refresh; every tracked address when omitted
    pub addresses: Option<Vec<String>>,
}

// =====================================================
// RPC Response Types
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> RpcResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

// =====================================================
// Service Status
// =====================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub uptime_secs: u64,
    pub tracked_wallets: usize,
    pub resolved_wallets: usize,
    pub subscription: Option<u64>,
    pub last_block: Option<u64>,
    pub last_tick_at: Option<String>,
    pub batches_merged: u64,
    pub batches_discarded: u64,
    pub batches_in_flight: u64,
    pub fetch_failures: u64,
    pub subscription_failures: u64,
    pub last_error: Option<String>,
    pub block_poll_ms: u64,
}
