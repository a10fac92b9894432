//! Wallet state store.
//!
//! Pure state transitions: `reduce(state, action)` returns the next state and
//! touches nothing else. The reconciler is the only owner of a live
//! `WalletState`; everybody else sees clones.

use ethers::types::Address;
use std::collections::BTreeMap;
use std::fmt;
use wallet_sync_types::WalletRecord;

/// Generation number of the active change subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionHandle(pub u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalletState {
    pub wallets: BTreeMap<Address, WalletRecord>,
    /// Tracked addresses in watch-list order
    pub wallets_addresses: Vec<Address>,
    pub subscription: Option<SubscriptionHandle>,
}

#[derive(Debug, Clone)]
pub enum StoreAction {
    ReplaceAll {
        records: Vec<WalletRecord>,
        addresses: Vec<Address>,
        subscription: Option<SubscriptionHandle>,
    },
    MergeDetails(Vec<WalletRecord>),
    SetSubscription(Option<SubscriptionHandle>),
}

pub fn reduce(mut state: WalletState, action: StoreAction) -> WalletState {
    match action {
        StoreAction::ReplaceAll {
            records,
            addresses,
            subscription,
        } => state.replace_all(records, addresses, subscription),
        StoreAction::MergeDetails(records) => state.merge_details(records),
        StoreAction::SetSubscription(handle) => state.set_subscription(handle),
    }
    state
}

impl WalletState {
    /// Atomic full replace, used when the tracked address set changes
    pub fn replace_all(
        &mut self,
        records: Vec<WalletRecord>,
        addresses: Vec<Address>,
        subscription: Option<SubscriptionHandle>,
    ) {
        self.wallets = records
            .into_iter()
            .map(|record| (record.address, record))
            .collect();
        self.wallets_addresses = addresses;
        self.subscription = subscription;
    }

    /// Shallow-merge partial records; facets missing from an incoming record
    /// keep their current value.
    pub fn merge_details(&mut self, records: Vec<WalletRecord>) {
        for incoming in records {
            match self.wallets.get_mut(&incoming.address) {
                Some(existing) => merge_record(existing, incoming),
                None => {
                    self.wallets.insert(incoming.address, incoming);
                }
            }
        }
    }

    pub fn set_subscription(&mut self, handle: Option<SubscriptionHandle>) {
        self.subscription = handle;
    }

    /// Records in tracked order, skipping addresses not yet resolved
    pub fn ordered_records(&self) -> Vec<WalletRecord> {
        self.wallets_addresses
            .iter()
            .filter_map(|address| self.wallets.get(address).cloned())
            .collect()
    }
}

fn merge_record(existing: &mut WalletRecord, incoming: WalletRecord) {
    if incoming.owners.is_some() {
        existing.owners = incoming.owners;
    }
    if incoming.require.is_some() {
        existing.require = incoming.require;
    }
    if incoming.operations.is_some() {
        existing.operations = incoming.operations;
    }
    if incoming.transactions.is_some() {
        existing.transactions = incoming.transactions;
    }
}
