//! Remote node access.
//!
//! The reconciler only sees two traits: `EventSource` for log filters and
//! block height, and `WalletReader` for contract getters. `JsonRpcNode`
//! implements both over Ethereum JSON-RPC.

use crate::abi;
use crate::error::NodeError;
use async_trait::async_trait;
use ethers::types::{Address, BlockNumber, Bytes, Log, H256, U256, U64};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// The wallet contract refuses more owners than this
const MAX_OWNERS: u64 = 250;

/// Server-side filter id as returned by `eth_newFilter`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterId(pub String);

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A log record returned by a filter poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Bytes,
    pub block_number: Option<u64>,
}

impl From<Log> for LogEvent {
    fn from(log: Log) -> Self {
        Self {
            address: log.address,
            topics: log.topics,
            data: log.data,
            block_number: log.block_number.map(|b| b.as_u64()),
        }
    }
}

#[async_trait]
pub trait EventSource: Send + Sync {
    async fn block_number(&self) -> Result<u64, NodeError>;

    async fn create_filter(
        &self,
        from: BlockNumber,
        to: BlockNumber,
        addresses: &[Address],
    ) -> Result<FilterId, NodeError>;

    /// Events accumulated by the filter since the previous poll
    async fn poll_filter(&self, filter: &FilterId) -> Result<Vec<LogEvent>, NodeError>;

    async fn remove_filter(&self, filter: &FilterId) -> Result<bool, NodeError>;
}

#[async_trait]
pub trait WalletReader: Send + Sync {
    async fn owner_count(&self, wallet: Address) -> Result<u64, NodeError>;

    async fn owner_at(&self, wallet: Address, index: u64) -> Result<Address, NodeError>;

    async fn required(&self, wallet: Address) -> Result<U256, NodeError>;

    /// Whether the contract still holds `operation` awaiting confirmations
    async fn is_pending(&self, wallet: Address, operation: H256) -> Result<bool, NodeError>;

    /// Whether the wallet has ever moved value
    async fn has_transactions(&self, wallet: Address) -> Result<bool, NodeError>;

    /// Ids of every operation that ever asked for confirmation
    async fn confirmation_needed_ids(&self, wallet: Address) -> Result<Vec<H256>, NodeError>;
}

/// Everything the reconciler needs from a node
pub trait Node: EventSource + WalletReader + 'static {}

impl<T: EventSource + WalletReader + 'static> Node for T {}

// =====================================================
// JSON-RPC implementation
// =====================================================

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

pub struct JsonRpcNode {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl JsonRpcNode {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NodeError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, NodeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let envelope: RpcEnvelope<T> = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(err) = envelope.error {
            if err.message.to_lowercase().contains("filter not found") {
                return Err(NodeError::FilterNotFound);
            }
            return Err(NodeError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        envelope
            .result
            .ok_or_else(|| NodeError::Decode(format!("{} returned no result", method)))
    }

    async fn call(&self, to: Address, data: Vec<u8>) -> Result<Bytes, NodeError> {
        self.request(
            "eth_call",
            json!([{ "to": to, "data": Bytes::from(data) }, "latest"]),
        )
        .await
    }

    async fn wallet_logs(&self, wallet: Address, topics: Vec<H256>) -> Result<Vec<Log>, NodeError> {
        self.request(
            "eth_getLogs",
            json!([{
                "fromBlock": BlockNumber::Earliest,
                "toBlock": BlockNumber::Latest,
                "address": wallet,
                "topics": [topics],
            }]),
        )
        .await
    }
}

#[async_trait]
impl EventSource for JsonRpcNode {
    async fn block_number(&self) -> Result<u64, NodeError> {
        let number: U64 = self.request("eth_blockNumber", json!([])).await?;
        Ok(number.as_u64())
    }

    async fn create_filter(
        &self,
        from: BlockNumber,
        to: BlockNumber,
        addresses: &[Address],
    ) -> Result<FilterId, NodeError> {
        let id: String = self
            .request(
                "eth_newFilter",
                json!([{ "fromBlock": from, "toBlock": to, "address": addresses }]),
            )
            .await?;
        Ok(FilterId(id))
    }

    async fn poll_filter(&self, filter: &FilterId) -> Result<Vec<LogEvent>, NodeError> {
        let logs: Vec<Log> = self
            .request("eth_getFilterChanges", json!([filter.0]))
            .await?;
        Ok(logs.into_iter().map(LogEvent::from).collect())
    }

    async fn remove_filter(&self, filter: &FilterId) -> Result<bool, NodeError> {
        self.request("eth_uninstallFilter", json!([filter.0])).await
    }
}

#[async_trait]
impl WalletReader for JsonRpcNode {
    async fn owner_count(&self, wallet: Address) -> Result<u64, NodeError> {
        let raw = self.call(wallet, abi::encode_owner_count()).await?;
        let count = abi::decode_uint(&raw)?;
        if count > U256::from(MAX_OWNERS) {
            return Err(NodeError::Decode(format!("owner count {} out of range", count)));
        }
        Ok(count.as_u64())
    }

    async fn owner_at(&self, wallet: Address, index: u64) -> Result<Address, NodeError> {
        let raw = self.call(wallet, abi::encode_owner_at(index)).await?;
        abi::decode_address(&raw)
    }

    async fn required(&self, wallet: Address) -> Result<U256, NodeError> {
        let raw = self.call(wallet, abi::encode_required()).await?;
        abi::decode_uint(&raw)
    }

    async fn is_pending(&self, wallet: Address, operation: H256) -> Result<bool, NodeError> {
        let raw = self
            .call(wallet, abi::encode_pending_transaction(operation))
            .await?;
        abi::decode_is_pending(&raw)
    }

    async fn has_transactions(&self, wallet: Address) -> Result<bool, NodeError> {
        let logs = self.wallet_logs(wallet, abi::transaction_topics()).await?;
        Ok(!logs.is_empty())
    }

    async fn confirmation_needed_ids(&self, wallet: Address) -> Result<Vec<H256>, NodeError> {
        let logs = self
            .wallet_logs(wallet, vec![abi::WalletEvent::ConfirmationNeeded.topic()])
            .await?;
        let ids = logs
            .into_iter()
            .map(LogEvent::from)
            .filter_map(|event| match abi::classify(&event) {
                Some(abi::WalletChange::Operation(id)) => id,
                _ => None,
            })
            .collect();
        Ok(ids)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event_from_rpc_log() {
        let raw = json!({
            "address": "0x1111111111111111111111111111111111111111",
            "topics": ["0xe1fffcc4923d04b559f4d29a8bfc6cda04eb5b0d3c460751c2402c5c5cc9109c"],
            "data": "0x",
            "blockNumber": "0x1b4",
            "transactionHash": null,
            "transactionIndex": null,
            "blockHash": null,
            "logIndex": null,
            "removed": false
        });
        let log: Log = serde_json::from_value(raw).unwrap();
        let event = LogEvent::from(log);
        assert_eq!(event.address, Address::repeat_byte(0x11));
        assert_eq!(event.block_number, Some(436));
        assert_eq!(event.topics, vec![abi::WalletEvent::Deposit.topic()]);
        assert!(event.data.is_empty());
    }

    #[test]
    fn test_rpc_envelope_error() {
        let envelope: RpcEnvelope<String> = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32000, "message": "filter not found" }
        }))
        .unwrap();
        assert!(envelope.result.is_none());
        let err = envelope.error.unwrap();
        assert_eq!(err.code, -32000);
        assert_eq!(err.message, "filter not found");
    }

    #[test]
    fn test_filter_id_display() {
        assert_eq!(FilterId("0x1f".to_string()).to_string(), "0x1f");
    }
}
