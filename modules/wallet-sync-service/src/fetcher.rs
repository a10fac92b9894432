//! Detail fetcher: resolves dirty facets into partial wallet records.
//!
//! Every address in a batch is fetched concurrently and every facet read of
//! one address is issued concurrently. An address fails as a unit: if any of
//! its reads fails, none of its facets are reported and the batch carries a
//! `TransientFetch` error for it instead. Other addresses are unaffected.

use crate::error::{NodeError, SyncError};
use crate::node::WalletReader;
use crate::poller::PendingChangeNote;
use crate::store::SubscriptionHandle;
use ethers::types::{Address, H256};
use futures_util::future::{join_all, try_join_all};
use std::collections::BTreeSet;
use std::sync::Arc;
use wallet_sync_types::{Facet, WalletRecord};

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub address: Address,
    pub note: PendingChangeNote,
    /// Pending operations the store currently holds for this wallet
    pub known_operations: Vec<H256>,
}

/// Result of one reconciliation batch
#[derive(Debug)]
pub struct BatchOutcome {
    /// Subscription current when the batch was issued
    pub handle: Option<SubscriptionHandle>,
    pub records: Vec<WalletRecord>,
    pub failures: Vec<SyncError>,
}

pub struct DetailFetcher<R: ?Sized> {
    reader: Arc<R>,
}

impl<R: ?Sized> Clone for DetailFetcher<R> {
    fn clone(&self) -> Self {
        Self {
            reader: self.reader.clone(),
        }
    }
}

impl<R: WalletReader + ?Sized> DetailFetcher<R> {
    pub fn new(reader: Arc<R>) -> Self {
        Self { reader }
    }

    pub async fn fetch_batch(
        &self,
        handle: Option<SubscriptionHandle>,
        requests: Vec<FetchRequest>,
    ) -> BatchOutcome {
        let results = join_all(requests.into_iter().map(|request| self.fetch_wallet(request))).await;

        let mut records = Vec::new();
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(record) => records.push(record),
                Err(e) => failures.push(e),
            }
        }

        BatchOutcome {
            handle,
            records,
            failures,
        }
    }

    async fn fetch_wallet(&self, request: FetchRequest) -> Result<WalletRecord, SyncError> {
        let reader = &*self.reader;
        let address = request.address;
        let note = &request.note;

        let owners = async {
            if note.is_dirty(Facet::Owners) {
                fetch_owners(reader, address).await.map(Some)
            } else {
                Ok(None)
            }
        };
        let require = async {
            if note.is_dirty(Facet::Require) {
                reader.required(address).await.map(Some)
            } else {
                Ok(None)
            }
        };
        let transactions = async {
            if note.is_dirty(Facet::Transactions) {
                reader.has_transactions(address).await.map(Some)
            } else {
                Ok(None)
            }
        };
        let operations = async {
            if note.is_dirty(Facet::Operations) {
                fetch_pending_operations(reader, address, note, &request.known_operations)
                    .await
                    .map(Some)
            } else {
                Ok(None)
            }
        };

        let (owners, require, transactions, operations) =
            tokio::try_join!(owners, require, transactions, operations)
                .map_err(|source| SyncError::TransientFetch { address, source })?;

        Ok(WalletRecord {
            address,
            owners,
            require,
            operations,
            transactions,
        })
    }
}

/// Owner count first, then one read per index; owners keep index order
async fn fetch_owners<R: WalletReader + ?Sized>(
    reader: &R,
    wallet: Address,
) -> Result<Vec<Address>, NodeError> {
    let count = reader.owner_count(wallet).await?;
    try_join_all((0..count).map(|index| reader.owner_at(wallet, index))).await
}

/// Check each candidate operation and keep those still awaiting
/// confirmations. Candidates are the known pending set plus ids from the
/// note; a full refresh also pulls every id that ever asked for confirmation.
async fn fetch_pending_operations<R: WalletReader + ?Sized>(
    reader: &R,
    wallet: Address,
    note: &PendingChangeNote,
    known: &[H256],
) -> Result<Vec<H256>, NodeError> {
    let mut candidates: BTreeSet<H256> = known.iter().copied().collect();
    candidates.extend(note.operations.iter().copied());
    if note.is_full() {
        candidates.extend(reader.confirmation_needed_ids(wallet).await?);
    }

    let checked = try_join_all(candidates.into_iter().map(|operation| async move {
        reader
            .is_pending(wallet, operation)
            .await
            .map(|pending| (operation, pending))
    }))
    .await?;

    Ok(checked
        .into_iter()
        .filter_map(|(operation, pending)| pending.then_some(operation))
        .collect())
}
