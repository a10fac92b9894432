//! Event poller: owns the change subscription and turns filter output into
//! per-address change notes.
//!
//! Two states. `Idle` holds no subscription. `Watching` holds a handle for the
//! tracked set and, once the node accepted it, a server-side filter id. A
//! filter that failed to install (or that the node forgot) is recreated on
//! the next poll; the poller never leaves `Watching` because of a node error.

use crate::abi::{self, WalletChange};
use crate::error::{NodeError, SyncError};
use crate::node::{EventSource, FilterId};
use crate::store::SubscriptionHandle;
use ethers::types::{Address, BlockNumber, H256};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use wallet_sync_types::Facet;

/// Ordered, deduplicated set of watched wallet addresses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackedAddressSet(Vec<Address>);

impl TrackedAddressSet {
    pub fn new(addresses: impl IntoIterator<Item = Address>) -> Self {
        let mut seen = BTreeSet::new();
        Self(
            addresses
                .into_iter()
                .filter(|address| seen.insert(*address))
                .collect(),
        )
    }

    /// Parse user-supplied hex addresses; case and surrounding whitespace
    /// are ignored.
    pub fn parse<S: AsRef<str>>(raw: &[S]) -> Result<Self, SyncError> {
        let addresses = raw
            .iter()
            .map(|s| parse_address(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(addresses))
    }

    /// Equal membership, ignoring order
    pub fn same_members(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self.0.iter().collect::<BTreeSet<_>>() == other.0.iter().collect::<BTreeSet<_>>()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.0.contains(address)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[Address] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<Address> {
        self.0.clone()
    }
}

pub fn parse_address(raw: &str) -> Result<Address, SyncError> {
    let trimmed = raw.trim();
    if !trimmed.starts_with("0x") && !trimmed.starts_with("0X") {
        return Err(SyncError::InvalidAddress(raw.to_string()));
    }
    Address::from_str(&trimmed[2..]).map_err(|_| SyncError::InvalidAddress(raw.to_string()))
}

/// Facets of one wallet flagged dirty by incoming events
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingChangeNote {
    pub facets: BTreeSet<Facet>,
    /// Operation ids named by operation events
    pub operations: BTreeSet<H256>,
}

impl PendingChangeNote {
    /// Every facet dirty; used for explicit refreshes and first sight
    pub fn all() -> Self {
        Self {
            facets: Facet::ALL.into_iter().collect(),
            operations: BTreeSet::new(),
        }
    }

    pub fn of(facets: &[Facet]) -> Self {
        Self {
            facets: facets.iter().copied().collect(),
            operations: BTreeSet::new(),
        }
    }

    pub fn apply(&mut self, change: WalletChange) {
        match change {
            WalletChange::Owners => {
                self.facets.insert(Facet::Owners);
            }
            WalletChange::Requirement => {
                self.facets.insert(Facet::Require);
            }
            WalletChange::Operation(id) => {
                self.facets.insert(Facet::Operations);
                self.operations.extend(id);
            }
            WalletChange::Transaction { operation } => {
                self.facets.insert(Facet::Transactions);
                if let Some(id) = operation {
                    self.facets.insert(Facet::Operations);
                    self.operations.insert(id);
                }
            }
        }
    }

    pub fn is_dirty(&self, facet: Facet) -> bool {
        self.facets.contains(&facet)
    }

    pub fn is_full(&self) -> bool {
        Facet::ALL.iter().all(|facet| self.facets.contains(facet))
    }
}

pub type PendingChanges = BTreeMap<Address, PendingChangeNote>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchChange {
    /// Same membership as before; nothing torn down
    Unchanged,
    Started(SubscriptionHandle),
    Stopped,
}

#[derive(Debug)]
enum PollerState {
    Idle,
    Watching {
        addresses: TrackedAddressSet,
        handle: SubscriptionHandle,
        filter: Option<FilterId>,
    },
}

#[derive(Debug)]
pub struct EventPoller {
    state: PollerState,
    last_handle: u64,
}

impl Default for EventPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPoller {
    pub fn new() -> Self {
        Self {
            state: PollerState::Idle,
            last_handle: 0,
        }
    }

    pub fn handle(&self) -> Option<SubscriptionHandle> {
        match &self.state {
            PollerState::Idle => None,
            PollerState::Watching { handle, .. } => Some(*handle),
        }
    }

    pub fn addresses(&self) -> Option<&TrackedAddressSet> {
        match &self.state {
            PollerState::Idle => None,
            PollerState::Watching { addresses, .. } => Some(addresses),
        }
    }

    pub fn is_watching(&self) -> bool {
        matches!(self.state, PollerState::Watching { .. })
    }

    pub fn has_filter(&self) -> bool {
        matches!(self.state, PollerState::Watching { filter: Some(_), .. })
    }

    /// Move to the given address set. A different set always closes the
    /// current subscription before a new handle is allocated. The new
    /// filter is installed by `ensure_filter`.
    pub async fn watch<S: EventSource + ?Sized>(
        &mut self,
        source: &S,
        addresses: TrackedAddressSet,
    ) -> WatchChange {
        match &self.state {
            PollerState::Idle if addresses.is_empty() => return WatchChange::Unchanged,
            PollerState::Watching { addresses: current, .. } if current.same_members(&addresses) => {
                return WatchChange::Unchanged;
            }
            _ => {}
        }

        self.teardown(source).await;

        if addresses.is_empty() {
            return WatchChange::Stopped;
        }

        self.last_handle += 1;
        let handle = SubscriptionHandle(self.last_handle);
        self.state = PollerState::Watching {
            addresses,
            handle,
            filter: None,
        };
        WatchChange::Started(handle)
    }

    async fn teardown<S: EventSource + ?Sized>(&mut self, source: &S) {
        let previous = std::mem::replace(&mut self.state, PollerState::Idle);
        if let PollerState::Watching {
            handle,
            filter: Some(filter),
            ..
        } = previous
        {
            match source.remove_filter(&filter).await {
                Ok(_) => log::debug!("[WALLET_SYNC] Removed filter {} ({})", filter, handle),
                Err(e) => log::warn!(
                    "[WALLET_SYNC] Failed to remove filter {} ({}): {}",
                    filter,
                    handle,
                    e
                ),
            }
        }
    }

    /// Install the server-side filter if the watching state has none yet
    pub async fn ensure_filter<S: EventSource + ?Sized>(&mut self, source: &S) -> Result<(), SyncError> {
        if let PollerState::Watching {
            addresses,
            handle,
            filter,
        } = &mut self.state
        {
            if filter.is_none() {
                let id = source
                    .create_filter(BlockNumber::Latest, BlockNumber::Latest, addresses.as_slice())
                    .await
                    .map_err(SyncError::Subscription)?;
                log::info!(
                    "[WALLET_SYNC] Filter {} installed for {} wallets ({})",
                    id,
                    addresses.len(),
                    handle
                );
                *filter = Some(id);
            }
        }
        Ok(())
    }

    /// Pull every event since the last poll and fold it into change notes.
    /// While idle this returns no changes without touching the node.
    pub async fn poll<S: EventSource + ?Sized>(&mut self, source: &S) -> Result<PendingChanges, SyncError> {
        if !self.is_watching() {
            return Ok(PendingChanges::new());
        }
        self.ensure_filter(source).await?;

        let PollerState::Watching {
            addresses, filter, ..
        } = &mut self.state
        else {
            return Ok(PendingChanges::new());
        };
        let Some(id) = filter.clone() else {
            return Ok(PendingChanges::new());
        };

        let events = match source.poll_filter(&id).await {
            Ok(events) => events,
            Err(NodeError::FilterNotFound) => {
                *filter = None;
                return Err(SyncError::Subscription(NodeError::FilterNotFound));
            }
            Err(e) => return Err(SyncError::Subscription(e)),
        };

        let mut changes = PendingChanges::new();
        for event in &events {
            if !addresses.contains(&event.address) {
                continue;
            }
            if let Some(change) = abi::classify(event) {
                changes.entry(event.address).or_default().apply(change);
            }
        }

        if !events.is_empty() {
            log::debug!(
                "[WALLET_SYNC] Pulled {} events, {} wallets dirty",
                events.len(),
                changes.len()
            );
        }
        Ok(changes)
    }
}
