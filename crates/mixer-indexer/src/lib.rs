//! Orchestrator: wires the [`EventPoller`]'s handlers to [`Store`] writes and
//! [`MerkleTree`] inserts, rehydrates the tree from the store at boot, and
//! exposes the read-only query surface (root, path, summary counters) a
//! downstream proof-preparation caller would use.
//!
//! Grounded on the source's top-level wiring (`original_source/Blockchain.py`
//! `on_event`/`on_block` registration and `original_source/Container.py`'s
//! replay-on-boot comment) — the source keeps this wiring inline at the
//! driver; here it is its own component so the CLI binary stays free of
//! business logic.

use std::sync::Arc;

use tracing::{error, info, warn};

use ark_bn254::Fr;
use mixer_chain::{deposit_topic, withdrawal_topic, EventPoller};
use mixer_merkle::MerkleTree;
use mixer_queue::TaskQueue;
use mixer_store::Store;
use mixer_types::{DepositEvent, LogEvent, WithdrawalEvent};

/// Coordinates the Store, Merkle accumulator, and Event Poller into a single
/// running indexer.
pub struct Orchestrator {
    store: Arc<Store>,
    tree: Arc<MerkleTree>,
    poller: Arc<EventPoller>,
    sink: Arc<TaskQueue>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<Store>,
        tree: Arc<MerkleTree>,
        poller: Arc<EventPoller>,
        sink: Arc<TaskQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            tree,
            poller,
            sink,
        })
    }

    /// Replay every recorded deposit, in `leaf_index` order, into a freshly
    /// constructed (empty) tree. Must run before [`Orchestrator::start`].
    pub fn rehydrate(&self) {
        let Some(latest_leaf) = self.store.get_latest_leaf() else {
            info!(target: "mixer_indexer", "rehydrate(): no deposits recorded, starting from an empty tree");
            return;
        };
        let Some(leaves) = self.store.get_leaves(0, latest_leaf) else {
            error!(target: "mixer_indexer", "rehydrate(): failed to read leaves from store");
            return;
        };
        let count = leaves.len();
        for leaf in leaves {
            if !self.tree.add(leaf) {
                error!(target: "mixer_indexer", "rehydrate(): tree rejected a previously-stored leaf");
            }
        }
        info!(target: "mixer_indexer", count, "rehydrate() replayed deposits into the Merkle tree");
    }

    /// Derive the effective start block (`max(latest recorded, configured)`),
    /// wire handlers, and start the poller.
    pub fn start(self: &Arc<Self>, contract: &str, configured_start_block: u64) -> bool {
        let start_block = self
            .store
            .get_latest_block()
            .unwrap_or(0)
            .max(configured_start_block);

        let this = self.clone();
        self.poller.add_event_handler(move |event| this.handle_event(event));

        let this = self.clone();
        self.poller.add_block_handler(move |head| this.handle_block(head));

        self.poller
            .start(contract, start_block, vec![deposit_topic(), withdrawal_topic()])
    }

    /// Handler bound to the poller's per-event dispatch: persist, then (for
    /// deposits only) apply to the Merkle tree.
    pub fn handle_event(&self, event: LogEvent) {
        match event {
            LogEvent::Deposit(d) => self.handle_deposit(d),
            LogEvent::Withdrawal(w) => self.handle_withdrawal(w),
        }
    }

    fn handle_deposit(&self, deposit: DepositEvent) {
        if !self.store.add_deposit(&deposit) {
            error!(target: "mixer_indexer", leaf_index = deposit.leaf_index, "store rejected deposit, tree not updated");
            return;
        }
        match mixer_types::hex_to_field_checked(&deposit.commitment) {
            Ok(commitment) => {
                if !self.tree.add(commitment) {
                    error!(target: "mixer_indexer", leaf_index = deposit.leaf_index, "tree rejected commitment after it was persisted");
                }
            }
            Err(e) => {
                error!(target: "mixer_indexer", commitment = %deposit.commitment, error = %e, "commitment not a canonical field element");
            }
        }
    }

    fn handle_withdrawal(&self, withdrawal: WithdrawalEvent) {
        if !self.store.add_withdraw(&withdrawal) {
            warn!(target: "mixer_indexer", tx_hash = %withdrawal.tx_hash, "store rejected withdrawal");
        }
    }

    /// Handler bound to the poller's per-window block-progress dispatch.
    pub fn handle_block(&self, head: u64) {
        self.store.set_latest_block(head);
    }

    /// Stop the poller, drain and stop the sink queue, close the store — in
    /// that order, so no handler job can run against a closed store.
    pub fn shutdown(&self) {
        self.poller.stop();
        self.sink.stop();
        self.store.close();
    }

    // --- read-only query surface, consumed by an out-of-scope proof-prep caller ---

    pub fn root(&self) -> Option<Fr> {
        self.tree.root()
    }

    pub fn path(&self, commitment: Fr) -> Option<Vec<(Fr, Option<Fr>)>> {
        self.tree.path(commitment)
    }

    pub fn unspent(&self) -> Option<i64> {
        self.store.get_unspent()
    }

    pub fn latest_block(&self) -> Option<u64> {
        self.store.get_latest_block()
    }

    pub fn latest_leaf(&self) -> Option<u64> {
        self.store.get_latest_leaf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mixer_chain::rpc::{RawLog, RpcClient};
    use mixer_types::{MixerError, Result};

    struct NeverCalledClient;
    impl RpcClient for NeverCalledClient {
        fn block_number(&self) -> Result<u64> {
            Err(MixerError::Rpc("not used in this test".into()))
        }
        fn get_logs(&self, _: &str, _: u64, _: u64, _: &[[u8; 32]]) -> Result<Vec<RawLog>> {
            Ok(Vec::new())
        }
    }

    fn build_orchestrator() -> (Arc<Orchestrator>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new("test"));
        assert!(store.open(&dir.path().join("mixer.sqlite")));
        let tree = Arc::new(MerkleTree::new(20));
        let sink = Arc::new(TaskQueue::new("sink-test"));
        sink.start();
        let client: Arc<dyn RpcClient> = Arc::new(NeverCalledClient);
        let poller = Arc::new(EventPoller::new(client, Default::default(), sink.clone()));
        (Orchestrator::new(store, tree, poller, sink), dir)
    }

    #[test]
    fn s4_deposit_then_withdraw_bookkeeping() {
        let (orch, _dir) = build_orchestrator();

        orch.handle_event(LogEvent::Deposit(DepositEvent::new(1000, 100, "0xaa", "0x01", 0)));
        orch.handle_event(LogEvent::Withdrawal(mixer_types::WithdrawalEvent::new(
            101, "0xbb", "0xcc", "0xdd", 5,
        )));

        assert_eq!(orch.latest_block(), Some(101));
        assert_eq!(orch.latest_leaf(), Some(0));
        assert_eq!(orch.unspent(), Some(0));
        assert!(orch.root().is_some());

        orch.shutdown();
    }

    #[test]
    fn rehydrate_replays_deposits_into_a_fresh_tree() {
        let (orch, _dir) = build_orchestrator();

        for i in 0..3u32 {
            let commitment = format!("0x{:064x}", i + 1);
            orch.handle_event(LogEvent::Deposit(DepositEvent::new(
                1000 + i as u64,
                100 + i as u64,
                &format!("0x{i:02x}"),
                &commitment,
                i,
            )));
        }
        assert_eq!(orch.tree.size(), 3);
        let root_before = orch.root().unwrap();

        let fresh_tree = Arc::new(MerkleTree::new(20));
        let orch2 = Orchestrator::new(orch.store.clone(), fresh_tree, orch.poller.clone(), orch.sink.clone());
        orch2.rehydrate();

        assert_eq!(orch2.tree.size(), 3);
        assert_eq!(orch2.root(), Some(root_before));

        orch.shutdown();
    }

    #[test]
    fn withdrawal_for_unknown_deposit_still_decrements_unspent() {
        let (orch, _dir) = build_orchestrator();
        orch.handle_event(LogEvent::Withdrawal(mixer_types::WithdrawalEvent::new(
            1, "0x01", "0x02", "0x03", 0,
        )));
        assert_eq!(orch.unspent(), Some(-1));
        orch.shutdown();
    }
}
