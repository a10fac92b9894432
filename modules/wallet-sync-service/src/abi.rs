//! Multisig wallet ABI: event topics, read-call encoding and decoding.
//!
//! Manual ABI handling without the abigen! macro, covering only the events
//! and getters the reconciler needs.

use crate::error::NodeError;
use crate::node::LogEvent;
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, H256, U256};
use ethers::utils::keccak256;
use strum::{EnumIter, IntoEnumIterator};

/// Events emitted by the wallet contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum WalletEvent {
    Confirmation,
    Revoke,
    OwnerChanged,
    OwnerAdded,
    OwnerRemoved,
    RequirementChanged,
    Deposit,
    SingleTransact,
    MultiTransact,
    ConfirmationNeeded,
}

impl WalletEvent {
    pub fn signature(&self) -> &'static str {
        match self {
            WalletEvent::Confirmation => "Confirmation(address,bytes32)",
            WalletEvent::Revoke => "Revoke(address,bytes32)",
            WalletEvent::OwnerChanged => "OwnerChanged(address,address)",
            WalletEvent::OwnerAdded => "OwnerAdded(address)",
            WalletEvent::OwnerRemoved => "OwnerRemoved(address)",
            WalletEvent::RequirementChanged => "RequirementChanged(uint256)",
            WalletEvent::Deposit => "Deposit(address,uint256)",
            WalletEvent::SingleTransact => "SingleTransact(address,uint256,address,bytes)",
            WalletEvent::MultiTransact => "MultiTransact(address,bytes32,uint256,address,bytes)",
            WalletEvent::ConfirmationNeeded => {
                "ConfirmationNeeded(bytes32,address,uint256,address,bytes)"
            }
        }
    }

    /// keccak256 of the event signature, as found in `topics[0]`
    pub fn topic(&self) -> H256 {
        H256::from(keccak256(self.signature().as_bytes()))
    }

    pub fn from_topic(topic: &H256) -> Option<Self> {
        WalletEvent::iter().find(|event| event.topic() == *topic)
    }
}

/// What an event says changed on its wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletChange {
    Owners,
    Requirement,
    /// A pending operation was created, confirmed or revoked. The id is
    /// `None` when the event data could not be decoded.
    Operation(Option<H256>),
    Transaction { operation: Option<H256> },
}

/// Classify a log by its topic signature. Unknown topics yield `None`.
pub fn classify(event: &LogEvent) -> Option<WalletChange> {
    let kind = WalletEvent::from_topic(event.topics.first()?)?;
    let change = match kind {
        WalletEvent::OwnerChanged | WalletEvent::OwnerAdded | WalletEvent::OwnerRemoved => {
            WalletChange::Owners
        }
        WalletEvent::RequirementChanged => WalletChange::Requirement,
        WalletEvent::Confirmation | WalletEvent::Revoke => {
            WalletChange::Operation(decode_operation_id(&event.data, 1))
        }
        WalletEvent::ConfirmationNeeded => {
            WalletChange::Operation(decode_operation_id(&event.data, 0))
        }
        WalletEvent::SingleTransact | WalletEvent::Deposit => {
            WalletChange::Transaction { operation: None }
        }
        WalletEvent::MultiTransact => WalletChange::Transaction {
            operation: decode_operation_id(&event.data, 1),
        },
    };
    Some(change)
}

/// Topics of every event that represents value moving through the wallet
pub fn transaction_topics() -> Vec<H256> {
    [
        WalletEvent::SingleTransact,
        WalletEvent::MultiTransact,
        WalletEvent::Deposit,
    ]
    .iter()
    .map(WalletEvent::topic)
    .collect()
}

/// Read the bytes32 operation id that sits at `position` in the
/// non-indexed event data (every preceding slot is an address).
fn decode_operation_id(data: &[u8], position: usize) -> Option<H256> {
    let mut types = vec![ParamType::Address; position];
    types.push(ParamType::FixedBytes(32));
    let tokens = abi::decode(&types, data).ok()?;
    match tokens.into_iter().nth(position)? {
        Token::FixedBytes(bytes) if bytes.len() == 32 => Some(H256::from_slice(&bytes)),
        _ => None,
    }
}

// =====================================================
// Read calls
// =====================================================

/// Compute function selector (first 4 bytes of keccak256 hash)
pub fn function_selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    let mut selector = [0u8; 4];
    selector.copy_from_slice(&hash[..4]);
    selector
}

pub fn encode_owner_count() -> Vec<u8> {
    function_selector("m_numOwners()").to_vec()
}

pub fn encode_owner_at(index: u64) -> Vec<u8> {
    let mut data = function_selector("getOwner(uint256)").to_vec();
    data.extend_from_slice(&abi::encode(&[Token::Uint(U256::from(index))]));
    data
}

pub fn encode_required() -> Vec<u8> {
    function_selector("m_required()").to_vec()
}

pub fn encode_operation_id(operation: H256) -> Token {
    Token::FixedBytes(operation.as_bytes().to_vec())
}

/// `m_txs(bytes32)` returns the queued transaction for an operation
pub fn encode_pending_transaction(operation: H256) -> Vec<u8> {
    let mut data = function_selector("m_txs(bytes32)").to_vec();
    data.extend_from_slice(&abi::encode(&[encode_operation_id(operation)]));
    data
}

/// Decode a uint256 return value
pub fn decode_uint(data: &[u8]) -> Result<U256, NodeError> {
    match abi::decode(&[ParamType::Uint(256)], data)
        .map_err(|e| NodeError::Decode(format!("uint256: {}", e)))?
        .pop()
    {
        Some(Token::Uint(value)) => Ok(value),
        other => Err(NodeError::Decode(format!("expected uint256, got {:?}", other))),
    }
}

/// Decode an address return value
pub fn decode_address(data: &[u8]) -> Result<Address, NodeError> {
    match abi::decode(&[ParamType::Address], data)
        .map_err(|e| NodeError::Decode(format!("address: {}", e)))?
        .pop()
    {
        Some(Token::Address(address)) => Ok(address),
        other => Err(NodeError::Decode(format!("expected address, got {:?}", other))),
    }
}

/// Decode `m_txs` output `(address to, uint256 value, bytes data)`.
/// The operation is pending while any of the fields is non-empty; the
/// contract clears the entry once it executes.
pub fn decode_is_pending(data: &[u8]) -> Result<bool, NodeError> {
    if data.is_empty() {
        return Ok(false);
    }
    let tokens = abi::decode(
        &[ParamType::Address, ParamType::Uint(256), ParamType::Bytes],
        data,
    )
    .map_err(|e| NodeError::Decode(format!("m_txs: {}", e)))?;

    let pending = tokens.iter().any(|token| match token {
        Token::Address(to) => !to.is_zero(),
        Token::Uint(value) => !value.is_zero(),
        Token::Bytes(bytes) => !bytes.is_empty(),
        _ => false,
    });
    Ok(pending)
}
