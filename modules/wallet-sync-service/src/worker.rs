//! Background reconciliation for watched wallets.
//!
//! The reconciler task owns the wallet state and processes one command at a
//! time. Detail fetches run as spawned batches that report back through the
//! same command channel, each tagged with the subscription handle it was
//! issued under; a batch whose handle is no longer current is dropped.
//! The block ticker polls the node's height and emits a `NewBlock` command
//! whenever it moves.

use crate::db::Db;
use crate::error::{Result, SyncError};
use crate::fetcher::{BatchOutcome, DetailFetcher, FetchRequest};
use crate::node::{EventSource, Node};
use crate::poller::{EventPoller, PendingChangeNote, PendingChanges, TrackedAddressSet, WatchChange};
use crate::store::{reduce, StoreAction, WalletState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Counters and last-seen values reported by the status endpoint
#[derive(Debug, Clone, Default)]
pub struct ReconcilerStats {
    pub last_block: Option<u64>,
    pub last_tick_at: Option<String>,
    pub batches_merged: u64,
    pub batches_discarded: u64,
    pub batches_in_flight: u64,
    pub fetch_failures: u64,
    pub subscription_failures: u64,
    pub last_error: Option<String>,
}

enum Command {
    SetAddresses {
        addresses: TrackedAddressSet,
        reply: oneshot::Sender<bool>,
    },
    Refresh {
        addresses: Option<TrackedAddressSet>,
        reply: oneshot::Sender<usize>,
    },
    NewBlock(u64),
    BatchFinished(BatchOutcome),
    Snapshot(oneshot::Sender<WalletState>),
    Stats(oneshot::Sender<ReconcilerStats>),
}

/// Cloneable front door to a running reconciler
#[derive(Clone)]
pub struct ReconcilerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ReconcilerHandle {
    /// Replace the tracked set. Returns `false` when the set is unchanged.
    pub async fn set_addresses(&self, addresses: TrackedAddressSet) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetAddresses { addresses, reply })?;
        rx.await.map_err(|_| SyncError::Stopped)
    }

    /// Queue an all-facet refresh; `None` refreshes every tracked wallet.
    /// Returns the number of wallets queued.
    pub async fn refresh(&self, addresses: Option<TrackedAddressSet>) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Refresh { addresses, reply })?;
        rx.await.map_err(|_| SyncError::Stopped)
    }

    pub fn new_block(&self, number: u64) -> Result<()> {
        self.send(Command::NewBlock(number))
    }

    pub async fn snapshot(&self) -> Result<WalletState> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot(reply))?;
        rx.await.map_err(|_| SyncError::Stopped)
    }

    pub async fn stats(&self) -> Result<ReconcilerStats> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats(reply))?;
        rx.await.map_err(|_| SyncError::Stopped)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| SyncError::Stopped)
    }
}

pub struct Reconciler<N: Node + ?Sized> {
    node: Arc<N>,
    fetcher: DetailFetcher<N>,
    poller: EventPoller,
    state: WalletState,
    db: Option<Arc<Db>>,
    stats: ReconcilerStats,
    tx: mpsc::UnboundedSender<Command>,
    rx: mpsc::UnboundedReceiver<Command>,
}

impl<N: Node + ?Sized> Reconciler<N> {
    pub fn new(node: Arc<N>, db: Option<Arc<Db>>) -> (Self, ReconcilerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ReconcilerHandle { tx: tx.clone() };
        let reconciler = Self {
            fetcher: DetailFetcher::new(node.clone()),
            node,
            poller: EventPoller::new(),
            state: WalletState::default(),
            db,
            stats: ReconcilerStats::default(),
            tx,
            rx,
        };
        (reconciler, handle)
    }

    /// Resume from the database snapshot, falling back to `initial` when
    /// nothing is stored.
    pub async fn restore(&mut self, initial: TrackedAddressSet) {
        let (tracked, records) = match &self.db {
            Some(db) => {
                let tracked = db.load_tracked().unwrap_or_else(|e| {
                    log::warn!("[WALLET_SYNC] Failed to load tracked wallets: {}", e);
                    Vec::new()
                });
                let records = db.load_records().unwrap_or_else(|e| {
                    log::warn!("[WALLET_SYNC] Failed to load wallet records: {}", e);
                    Vec::new()
                });
                (TrackedAddressSet::new(tracked), records)
            }
            None => (TrackedAddressSet::default(), Vec::new()),
        };

        let tracked = if tracked.is_empty() { initial } else { tracked };
        if tracked.is_empty() {
            return;
        }

        log::info!(
            "[WALLET_SYNC] Restoring {} tracked wallets ({} cached records)",
            tracked.len(),
            records.len()
        );
        self.state = reduce(
            std::mem::take(&mut self.state),
            StoreAction::MergeDetails(records),
        );
        self.set_addresses(tracked).await;
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        log::info!("[WALLET_SYNC] Reconciler started");
        loop {
            let command = tokio::select! {
                _ = cancel.cancelled() => break,
                command = self.rx.recv() => command,
            };
            match command {
                Some(command) => self.handle_command(command).await,
                None => break,
            }
        }
        log::info!("[WALLET_SYNC] Reconciler stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetAddresses { addresses, reply } => {
                let changed = self.set_addresses(addresses).await;
                let _ = reply.send(changed);
            }
            Command::Refresh { addresses, reply } => {
                let queued = self.refresh(addresses);
                let _ = reply.send(queued);
            }
            Command::NewBlock(number) => self.on_new_block(number).await,
            Command::BatchFinished(outcome) => {
                self.apply_batch(outcome);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.state.clone());
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats.clone());
            }
        }
    }

    async fn set_addresses(&mut self, addresses: TrackedAddressSet) -> bool {
        match self.poller.watch(&*self.node, addresses.clone()).await {
            WatchChange::Unchanged => false,
            WatchChange::Stopped => {
                log::info!("[WALLET_SYNC] Watch list cleared");
                self.state = reduce(
                    std::mem::take(&mut self.state),
                    StoreAction::ReplaceAll {
                        records: Vec::new(),
                        addresses: Vec::new(),
                        subscription: None,
                    },
                );
                self.persist_tracked();
                true
            }
            WatchChange::Started(handle) => {
                log::info!(
                    "[WALLET_SYNC] Watching {} wallets ({})",
                    addresses.len(),
                    handle
                );
                if let Err(e) = self.poller.ensure_filter(&*self.node).await {
                    self.record_subscription_failure(e);
                }

                let kept = addresses
                    .as_slice()
                    .iter()
                    .filter_map(|address| self.state.wallets.get(address).cloned())
                    .collect();
                self.state = reduce(
                    std::mem::take(&mut self.state),
                    StoreAction::ReplaceAll {
                        records: kept,
                        addresses: addresses.to_vec(),
                        subscription: Some(handle),
                    },
                );
                self.persist_tracked();

                let changes = addresses
                    .as_slice()
                    .iter()
                    .map(|address| (*address, PendingChangeNote::all()))
                    .collect();
                self.dispatch(changes);
                true
            }
        }
    }

    fn refresh(&mut self, addresses: Option<TrackedAddressSet>) -> usize {
        let tracked = &self.state.wallets_addresses;
        let changes: PendingChanges = match addresses {
            Some(requested) => requested
                .as_slice()
                .iter()
                .filter(|address| tracked.contains(address))
                .map(|address| (*address, PendingChangeNote::all()))
                .collect(),
            None => tracked
                .iter()
                .map(|address| (*address, PendingChangeNote::all()))
                .collect(),
        };
        let queued = changes.len();
        self.dispatch(changes);
        queued
    }

    async fn on_new_block(&mut self, number: u64) {
        self.stats.last_block = Some(number);
        self.stats.last_tick_at = Some(chrono::Utc::now().to_rfc3339());

        match self.poller.poll(&*self.node).await {
            Ok(changes) => self.dispatch(changes),
            Err(e) => self.record_subscription_failure(e),
        }
    }

    /// Spawn a fetch batch tagged with the current subscription handle
    fn dispatch(&mut self, changes: PendingChanges) {
        if changes.is_empty() {
            return;
        }

        let requests: Vec<FetchRequest> = changes
            .into_iter()
            .map(|(address, note)| FetchRequest {
                address,
                note,
                known_operations: self
                    .state
                    .wallets
                    .get(&address)
                    .and_then(|record| record.operations.clone())
                    .unwrap_or_default(),
            })
            .collect();

        let handle = self.state.subscription;
        log::debug!(
            "[WALLET_SYNC] Dispatching batch of {} wallets under {:?}",
            requests.len(),
            handle
        );

        self.stats.batches_in_flight += 1;
        let fetcher = self.fetcher.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let outcome = fetcher.fetch_batch(handle, requests).await;
            let _ = tx.send(Command::BatchFinished(outcome));
        });
    }

    /// Merge a finished batch if it still belongs to the current
    /// subscription. Returns whether the store was updated.
    fn apply_batch(&mut self, outcome: BatchOutcome) -> bool {
        self.stats.batches_in_flight = self.stats.batches_in_flight.saturating_sub(1);

        for failure in &outcome.failures {
            log::warn!("[WALLET_SYNC] {}", failure);
            self.stats.fetch_failures += 1;
            self.stats.last_error = Some(failure.to_string());
        }

        if outcome.handle != self.state.subscription {
            log::warn!(
                "[WALLET_SYNC] Discarding stale batch of {} records (issued under {:?}, current {:?})",
                outcome.records.len(),
                outcome.handle,
                self.state.subscription
            );
            self.stats.batches_discarded += 1;
            return false;
        }

        if outcome.records.is_empty() {
            return false;
        }

        log::debug!("[WALLET_SYNC] Merging {} wallet records", outcome.records.len());
        let touched: Vec<_> = outcome.records.iter().map(|record| record.address).collect();
        self.state = reduce(
            std::mem::take(&mut self.state),
            StoreAction::MergeDetails(outcome.records),
        );
        self.stats.batches_merged += 1;

        if let Some(db) = &self.db {
            let merged: Vec<_> = touched
                .iter()
                .filter_map(|address| self.state.wallets.get(address).cloned())
                .collect();
            if let Err(e) = db.save_records(&merged) {
                log::warn!("[WALLET_SYNC] Failed to persist wallet records: {}", e);
            }
        }
        true
    }

    fn persist_tracked(&self) {
        if let Some(db) = &self.db {
            if let Err(e) = db.save_tracked(&self.state.wallets_addresses) {
                log::warn!("[WALLET_SYNC] Failed to persist tracked wallets: {}", e);
            }
        }
    }

    fn record_subscription_failure(&mut self, error: SyncError) {
        log::error!("[WALLET_SYNC] {}", error);
        self.stats.subscription_failures += 1;
        self.stats.last_error = Some(error.to_string());
    }
}

/// Poll the node's block height and emit a `NewBlock` whenever it moves
pub async fn run_block_ticker<S: EventSource + ?Sized>(
    source: Arc<S>,
    handle: ReconcilerHandle,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    log::info!(
        "[WALLET_SYNC] Block ticker started (poll interval: {}ms)",
        poll_interval.as_millis()
    );
    let mut last_seen: Option<u64> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }

        match source.block_number().await {
            Ok(number) if last_seen != Some(number) => {
                last_seen = Some(number);
                if handle.new_block(number).is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("[WALLET_SYNC] Failed to read block number: {}", e);
            }
        }
    }
    log::info!("[WALLET_SYNC] Block ticker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::tests::log;
    use crate::abi::WalletEvent;
    use crate::node::mock::{MockNode, MockWallet};
    use crate::store::SubscriptionHandle;
    use ethers::types::{Address, U256};
    use wallet_sync_types::WalletRecord;

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    fn set(bytes: &[u8]) -> TrackedAddressSet {
        TrackedAddressSet::new(bytes.iter().map(|b| addr(*b)))
    }

    fn wallet(owners: &[u8], required: u64) -> MockWallet {
        MockWallet {
            owners: owners.iter().map(|b| addr(*b)).collect(),
            required,
            ..Default::default()
        }
    }

    impl<N: Node + ?Sized> Reconciler<N> {
        /// Wait for the next spawned batch to report back
        async fn next_batch(&mut self) -> BatchOutcome {
            loop {
                match self.rx.recv().await {
                    Some(Command::BatchFinished(outcome)) => return outcome,
                    Some(_) => continue,
                    None => panic!("channel closed"),
                }
            }
        }

        async fn settle(&mut self) {
            while self.stats.batches_in_flight > 0 {
                let outcome = self.next_batch().await;
                self.apply_batch(outcome);
            }
        }
    }

    #[tokio::test]
    async fn test_set_addresses_fetches_every_facet() {
        let node = Arc::new(
            MockNode::new()
                .with_wallet(addr(0xa), wallet(&[1, 2], 2))
                .with_wallet(addr(0xb), wallet(&[3], 1)),
        );
        let (mut reconciler, _handle) = Reconciler::new(node.clone(), None);

        assert!(reconciler.set_addresses(set(&[0xa, 0xb])).await);
        reconciler.settle().await;

        let state = &reconciler.state;
        assert_eq!(state.wallets_addresses, vec![addr(0xa), addr(0xb)]);
        assert_eq!(state.subscription, Some(SubscriptionHandle(1)));
        assert_eq!(state.wallets[&addr(0xa)].owners, Some(vec![addr(1), addr(2)]));
        assert_eq!(state.wallets[&addr(0xb)].require, Some(U256::from(1)));
        assert_eq!(node.live_filters(), 1);
    }

    #[tokio::test]
    async fn test_same_set_causes_no_churn() {
        let node = Arc::new(MockNode::new());
        let (mut reconciler, _handle) = Reconciler::new(node.clone(), None);

        assert!(reconciler.set_addresses(set(&[0xa, 0xb])).await);
        reconciler.settle().await;
        assert!(!reconciler.set_addresses(set(&[0xb, 0xa])).await);

        assert_eq!(reconciler.stats.batches_in_flight, 0);
        assert_eq!(reconciler.state.subscription, Some(SubscriptionHandle(1)));
        let mock = node.state.lock();
        assert_eq!(mock.created, 1);
        assert_eq!(mock.removed, 0);
    }

    #[tokio::test]
    async fn test_empty_set_resets_state() {
        let node = Arc::new(MockNode::new().with_wallet(addr(0xa), wallet(&[1], 1)));
        let (mut reconciler, _handle) = Reconciler::new(node.clone(), None);

        reconciler.set_addresses(set(&[0xa])).await;
        reconciler.settle().await;
        assert!(!reconciler.state.wallets.is_empty());

        assert!(reconciler.set_addresses(TrackedAddressSet::default()).await);
        assert!(reconciler.state.wallets.is_empty());
        assert!(reconciler.state.wallets_addresses.is_empty());
        assert_eq!(reconciler.state.subscription, None);
        assert_eq!(node.live_filters(), 0);
    }

    #[tokio::test]
    async fn test_stale_batch_is_discarded() {
        let node = Arc::new(
            MockNode::new()
                .with_wallet(addr(0xa), wallet(&[1], 1))
                .with_wallet(addr(0xb), wallet(&[2], 1)),
        );
        let (mut reconciler, _handle) = Reconciler::new(node, None);

        // Batch for {a} is in flight when the set moves to {b}
        reconciler.set_addresses(set(&[0xa])).await;
        reconciler.set_addresses(set(&[0xb])).await;
        assert_eq!(reconciler.state.subscription, Some(SubscriptionHandle(2)));

        let mut merged = 0;
        let mut discarded = 0;
        for _ in 0..2 {
            let outcome = reconciler.next_batch().await;
            let issued_under = outcome.handle;
            let before = reconciler.state.clone();
            if reconciler.apply_batch(outcome) {
                merged += 1;
                assert_eq!(issued_under, Some(SubscriptionHandle(2)));
            } else {
                discarded += 1;
                assert_eq!(issued_under, Some(SubscriptionHandle(1)));
                assert_eq!(reconciler.state, before);
            }
        }

        assert_eq!((merged, discarded), (1, 1));
        assert_eq!(reconciler.stats.batches_discarded, 1);
        assert!(!reconciler.state.wallets.contains_key(&addr(0xa)));
        assert!(reconciler.state.wallets.contains_key(&addr(0xb)));
    }

    #[tokio::test]
    async fn test_outcome_from_old_handle_leaves_store_untouched() {
        let node = Arc::new(MockNode::new());
        let (mut reconciler, _handle) = Reconciler::new(node, None);
        reconciler.set_addresses(set(&[0xa])).await;
        reconciler.settle().await;
        reconciler.set_addresses(set(&[0xa, 0xb])).await;
        reconciler.settle().await;

        let before = reconciler.state.clone();
        let stale = BatchOutcome {
            handle: Some(SubscriptionHandle(1)),
            records: vec![WalletRecord {
                require: Some(U256::from(9)),
                ..WalletRecord::new(addr(0xa))
            }],
            failures: vec![],
        };
        assert!(!reconciler.apply_batch(stale));
        assert_eq!(reconciler.state, before);
    }

    #[tokio::test]
    async fn test_new_block_reconciles_events() {
        let node = Arc::new(
            MockNode::new()
                .with_wallet(addr(0xa), wallet(&[1], 1))
                .with_wallet(addr(0xb), wallet(&[2], 1)),
        );
        let (mut reconciler, _handle) = Reconciler::new(node.clone(), None);
        reconciler.set_addresses(set(&[0xa, 0xb])).await;
        reconciler.settle().await;

        {
            let mut mock = node.state.lock();
            let a = mock.wallets.get_mut(&addr(0xa)).unwrap();
            a.owners.push(addr(5));
            a.has_transactions = true;
            mock.wallets.get_mut(&addr(0xb)).unwrap().required = 2;
        }
        node.push_log(log(addr(0xa), WalletEvent::OwnerAdded, vec![]));
        node.push_log(log(addr(0xa), WalletEvent::SingleTransact, vec![]));
        node.push_log(log(addr(0xb), WalletEvent::RequirementChanged, vec![]));

        reconciler.on_new_block(10).await;
        let outcome = reconciler.next_batch().await;

        let mut by_address: Vec<&WalletRecord> = outcome.records.iter().collect();
        by_address.sort_by_key(|r| r.address);
        assert_eq!(by_address[0].owners, Some(vec![addr(1), addr(5)]));
        assert_eq!(by_address[0].transactions, Some(true));
        assert_eq!(by_address[0].require, None);
        assert_eq!(by_address[1].require, Some(U256::from(2)));
        assert_eq!(by_address[1].owners, None);

        assert!(reconciler.apply_batch(outcome));
        let state = &reconciler.state;
        assert_eq!(state.wallets[&addr(0xa)].require, Some(U256::from(1)));
        assert_eq!(state.wallets[&addr(0xb)].owners, Some(vec![addr(2)]));
        assert_eq!(state.wallets[&addr(0xb)].require, Some(U256::from(2)));
        assert_eq!(reconciler.stats.last_block, Some(10));
    }

    #[tokio::test]
    async fn test_failed_wallet_does_not_block_batch() {
        let node = Arc::new(
            MockNode::new()
                .with_wallet(addr(0xa), wallet(&[1], 1))
                .with_wallet(addr(0xb), wallet(&[2], 1))
                .with_wallet(addr(0xc), wallet(&[3], 1)),
        );
        node.state.lock().failing.insert(addr(0xb));
        let (mut reconciler, _handle) = Reconciler::new(node, None);

        reconciler.set_addresses(set(&[0xa, 0xb, 0xc])).await;
        reconciler.settle().await;

        let state = &reconciler.state;
        assert!(state.wallets.contains_key(&addr(0xa)));
        assert!(!state.wallets.contains_key(&addr(0xb)));
        assert!(state.wallets.contains_key(&addr(0xc)));
        assert_eq!(reconciler.stats.fetch_failures, 1);
        assert_eq!(reconciler.stats.batches_merged, 1);
    }

    #[tokio::test]
    async fn test_subscription_failure_keeps_watching() {
        let node = Arc::new(MockNode::new().with_wallet(addr(0xa), wallet(&[1], 1)));
        node.state.lock().fail_create = true;
        let (mut reconciler, _handle) = Reconciler::new(node.clone(), None);

        assert!(reconciler.set_addresses(set(&[0xa])).await);
        reconciler.settle().await;
        assert_eq!(reconciler.stats.subscription_failures, 1);
        assert_eq!(reconciler.state.subscription, Some(SubscriptionHandle(1)));
        assert!(reconciler.state.wallets.contains_key(&addr(0xa)));

        reconciler.on_new_block(1).await;
        assert_eq!(reconciler.stats.subscription_failures, 2);

        node.state.lock().fail_create = false;
        reconciler.on_new_block(2).await;
        assert_eq!(reconciler.stats.subscription_failures, 2);
        assert_eq!(node.live_filters(), 1);
    }

    #[tokio::test]
    async fn test_refresh_only_tracked_wallets() {
        let node = Arc::new(MockNode::new().with_wallet(addr(0xa), wallet(&[1], 1)));
        let (mut reconciler, _handle) = Reconciler::new(node.clone(), None);
        reconciler.set_addresses(set(&[0xa])).await;
        reconciler.settle().await;

        node.state.lock().wallets.get_mut(&addr(0xa)).unwrap().required = 3;
        assert_eq!(reconciler.refresh(Some(set(&[0xa, 0xf]))), 1);
        reconciler.settle().await;
        assert_eq!(reconciler.state.wallets[&addr(0xa)].require, Some(U256::from(3)));

        assert_eq!(reconciler.refresh(None), 1);
        reconciler.settle().await;
    }

    #[tokio::test]
    async fn test_restore_from_database() {
        let db = Arc::new(Db::open(":memory:").unwrap());
        db.save_tracked(&[addr(0xa)]).unwrap();
        db.save_records(&[WalletRecord {
            transactions: Some(true),
            ..WalletRecord::new(addr(0xa))
        }])
        .unwrap();

        let node = Arc::new(MockNode::new().with_wallet(addr(0xa), wallet(&[1], 1)));
        let (mut reconciler, _handle) = Reconciler::new(node, Some(db.clone()));
        reconciler.restore(set(&[0xf])).await;

        assert_eq!(reconciler.state.wallets_addresses, vec![addr(0xa)]);
        assert_eq!(reconciler.state.wallets[&addr(0xa)].transactions, Some(true));

        reconciler.settle().await;
        let stored = db.load_records().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].owners, Some(vec![addr(1)]));

        // An event-driven partial merge keeps previously stored facets
        let partial = BatchOutcome {
            handle: reconciler.state.subscription,
            records: vec![WalletRecord {
                require: Some(U256::from(4)),
                ..WalletRecord::new(addr(0xa))
            }],
            failures: vec![],
        };
        assert!(reconciler.apply_batch(partial));
        let stored = db.load_records().unwrap();
        assert_eq!(stored[0].owners, Some(vec![addr(1)]));
        assert_eq!(stored[0].require, Some(U256::from(4)));
    }

    #[tokio::test]
    async fn test_handle_round_trip_through_run_loop() {
        let node = Arc::new(MockNode::new().with_wallet(addr(0xa), wallet(&[1, 2], 2)));
        let (reconciler, handle) = Reconciler::new(node, None);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(reconciler.run(cancel.clone()));

        assert!(handle.set_addresses(set(&[0xa])).await.unwrap());

        let mut resolved = None;
        for _ in 0..50 {
            let state = handle.snapshot().await.unwrap();
            if let Some(record) = state.wallets.get(&addr(0xa)) {
                if record.owners.is_some() {
                    resolved = Some(record.clone());
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(resolved.unwrap().require, Some(U256::from(2)));
        assert_eq!(handle.stats().await.unwrap().batches_merged, 1);

        cancel.cancel();
        task.await.unwrap();
        assert!(matches!(handle.snapshot().await, Err(SyncError::Stopped)));
    }

    #[tokio::test]
    async fn test_block_ticker_emits_on_height_change() {
        let node = Arc::new(MockNode::new());
        node.state.lock().block = 5;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = ReconcilerHandle { tx };
        let cancel = CancellationToken::new();
        let ticker = tokio::spawn(run_block_ticker(
            node.clone(),
            handle,
            Duration::from_millis(5),
            cancel.clone(),
        ));

        let first = rx.recv().await;
        assert!(matches!(first, Some(Command::NewBlock(5))));
        node.state.lock().block = 6;
        let second = rx.recv().await;
        assert!(matches!(second, Some(Command::NewBlock(6))));

        cancel.cancel();
        ticker.await.unwrap();
    }
}
