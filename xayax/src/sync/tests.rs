//! Tests for the sync worker, driven by a fake base chain.

use std::sync::mpsc;
use std::time::{Duration, Instant};

use xayax_test::FakeChain;

use super::*;

/// How long tests wait for the background worker to reach a state before
/// failing.  Generous because a lost wakeup is only recovered by the
/// worker's own timeout.
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Records every tip update delivered by the worker.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<(String, Vec<String>)>>,
}

impl Callbacks for Recorder {
    fn tip_updated_from(&self, _chain: &mut Chainstate, old_tip: &str, attaches: &[BlockData]) {
        assert!(!attaches.is_empty());
        let hashes = attaches.iter().map(|blk| blk.hash.clone()).collect();
        self.events
            .lock()
            .expect("recorder lock poisoned")
            .push((old_tip.to_string(), hashes));
    }
}

impl Recorder {
    fn events(&self) -> Vec<(String, Vec<String>)> {
        self.events.lock().expect("recorder lock poisoned").clone()
    }
}

struct Harness {
    fake: Arc<FakeChain>,
    chain: Arc<Mutex<Chainstate>>,
    recorder: Arc<Recorder>,
    sync: ChainSync,
    fatal: mpsc::Receiver<SyncError>,
}

impl Harness {
    /// Starts a sync worker against the fake chain.
    fn start(fake: Arc<FakeChain>, pruning_depth: u64) -> Self {
        xayax_test::init();

        let chain = Arc::new(Mutex::new(Chainstate::in_memory().unwrap()));
        let recorder = Arc::new(Recorder::default());
        let (fatal_tx, fatal) = mpsc::channel();

        let mut sync = ChainSync::new(fake.clone(), chain.clone(), pruning_depth);
        sync.set_callbacks(Some(recorder.clone()));
        sync.set_fatal_handler(Box::new(move |err| {
            let _ = fatal_tx.send(err);
        }));
        sync.start().unwrap();

        Self {
            fake,
            chain,
            recorder,
            sync,
            fatal,
        }
    }

    /// Waits until the local chain state reaches the given tip hash.
    fn wait_for_tip(&self, hash: &str) {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            {
                let chain = self.chain.lock().unwrap();
                let tip = chain
                    .get_tip_height()
                    .unwrap()
                    .and_then(|height| chain.get_hash_for_height(height).unwrap());
                if tip.as_deref() == Some(hash) {
                    return;
                }
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for tip {hash}"
            );
            xayax_test::sleep_some();
        }
    }
}

#[test]
fn initial_sync_from_scratch() {
    let fake = Arc::new(FakeChain::new());
    let genesis = fake.set_genesis(fake.new_genesis(0));
    let blocks = fake.attach_branch(&genesis.hash, 5);

    let harness = Harness::start(fake, 1_000);
    harness.wait_for_tip(&blocks.last().unwrap().hash);

    // Everything from the genesis is kept: the pruning depth exceeds the
    // chain length.
    let chain = harness.chain.lock().unwrap();
    assert_eq!(chain.get_tip_height().unwrap(), Some(5));
    assert_eq!(chain.get_lowest_unpruned_height().unwrap(), Some(0));
    assert_eq!(
        chain.get_hash_for_height(0).unwrap().as_deref(),
        Some(genesis.hash.as_str())
    );
    chain.sanity_check().unwrap();
    drop(chain);

    // The first update imported the genesis with an empty old tip; every
    // later update chains on.  Together they attach up to the final tip.
    let events = harness.recorder.events();
    assert_eq!(events[0], ("".to_string(), vec![genesis.hash.clone()]));
    assert_eq!(
        events.last().unwrap().1.last().unwrap(),
        &blocks.last().unwrap().hash
    );
}

#[test]
fn follows_new_blocks() {
    let fake = Arc::new(FakeChain::new());
    let genesis = fake.set_genesis(fake.new_genesis(0));
    let harness = Harness::start(fake.clone(), 1_000);
    harness.wait_for_tip(&genesis.hash);

    let blk = fake.set_tip(fake.new_block());
    harness.sync.new_base_chain_tip();
    harness.wait_for_tip(&blk.hash);

    let blk = fake.set_tip(fake.new_block());
    harness.sync.new_base_chain_tip();
    harness.wait_for_tip(&blk.hash);

    harness.chain.lock().unwrap().sanity_check().unwrap();
}

#[test]
fn reorg_within_depth() {
    let fake = Arc::new(FakeChain::new());
    let genesis = fake.set_genesis(fake.new_genesis(0));
    let blocks = fake.attach_branch(&genesis.hash, 5);
    let harness = Harness::start(fake.clone(), 1_000);
    harness.wait_for_tip(&blocks[4].hash);

    // Detach the top two blocks and extend from height 3 instead.
    let fork = fake.attach_branch(&blocks[2].hash, 2);
    harness.sync.new_base_chain_tip();
    harness.wait_for_tip(&fork[1].hash);

    let chain = harness.chain.lock().unwrap();
    assert_eq!(
        chain.get_hash_for_height(4).unwrap().as_deref(),
        Some(fork[0].hash.as_str())
    );
    // The detached blocks are still known, on a side branch.
    assert_eq!(chain.get_height_for_hash(&blocks[4].hash).unwrap(), Some(5));
    chain.sanity_check().unwrap();
    drop(chain);

    // One of the updates walked the state from the old tip onto the fork,
    // and the fork's tip got attached eventually.
    let events = harness.recorder.events();
    let reorg = events
        .iter()
        .find(|(old, _)| old == &blocks[4].hash)
        .expect("no tip update from the old tip recorded");
    assert!(reorg.1.contains(&fork[0].hash));
    assert!(events
        .iter()
        .any(|(_, attaches)| attaches.last() == Some(&fork[1].hash)));
}

#[test]
fn reactivates_a_known_branch() {
    let fake = Arc::new(FakeChain::new());
    let genesis = fake.set_genesis(fake.new_genesis(0));
    let blocks = fake.attach_branch(&genesis.hash, 3);
    let harness = Harness::start(fake.clone(), 1_000);
    harness.wait_for_tip(&blocks[2].hash);

    // Reorg to a fork, then back to the original chain.  Both switches
    // only relabel already known blocks.
    let fork = fake.attach_branch(&blocks[0].hash, 2);
    harness.sync.new_base_chain_tip();
    harness.wait_for_tip(&fork[1].hash);

    fake.set_tip(blocks[2].clone());
    harness.sync.new_base_chain_tip();
    harness.wait_for_tip(&blocks[2].hash);

    harness.chain.lock().unwrap().sanity_check().unwrap();
}

#[test]
fn initial_sync_anchors_at_pruning_depth() {
    let fake = Arc::new(FakeChain::new());
    let genesis = fake.set_genesis(fake.new_genesis(0));
    let blocks = fake.attach_branch(&genesis.hash, 10);

    let harness = Harness::start(fake, 2);
    harness.wait_for_tip(&blocks.last().unwrap().hash);

    // The initial import anchored two blocks behind the upstream tip;
    // nothing older is stored.
    let chain = harness.chain.lock().unwrap();
    assert_eq!(chain.get_lowest_unpruned_height().unwrap(), Some(8));
    assert_eq!(chain.get_hash_for_height(7).unwrap(), None);
    chain.sanity_check().unwrap();
}

#[test]
fn fast_catch_up_reimports() {
    let fake = Arc::new(FakeChain::new());
    let genesis = fake.set_genesis(fake.new_genesis(0));
    let harness = Harness::start(fake.clone(), 2);
    harness.wait_for_tip(&genesis.hash);

    // The chain jumps far ahead; syncing block by block would stay more
    // than the pruning depth behind, so the worker reimports an anchor.
    let blocks = fake.attach_branch(&genesis.hash, 20);
    harness.sync.new_base_chain_tip();
    harness.wait_for_tip(&blocks.last().unwrap().hash);

    let chain = harness.chain.lock().unwrap();
    assert_eq!(chain.get_tip_height().unwrap(), Some(20));
    assert!(chain.get_lowest_unpruned_height().unwrap().unwrap() > 0);
    chain.sanity_check().unwrap();
    drop(chain);

    // The reimport shows up as another from-scratch update.
    let reimports = harness
        .recorder
        .events()
        .iter()
        .filter(|(old, _)| old.is_empty())
        .count();
    assert!(reimports >= 2);
}

#[test]
fn reorg_beyond_pruning_depth_is_fatal() {
    let fake = Arc::new(FakeChain::new());
    let genesis = fake.set_genesis(fake.new_genesis(0));
    let blocks = fake.attach_branch(&genesis.hash, 5);

    let harness = Harness::start(fake.clone(), 2);
    harness.wait_for_tip(&blocks.last().unwrap().hash);

    // Rewrite the chain from height 2 onwards.  The fork point lies below
    // the locally kept history, which the worker must refuse to follow.
    fake.attach_branch(&blocks[0].hash, 4);
    harness.sync.new_base_chain_tip();

    let err = harness
        .fatal
        .recv_timeout(WAIT_TIMEOUT)
        .expect("sync did not report a fatal error");
    assert!(matches!(err, SyncError::ReorgBeyondPruningDepth));
}

#[test]
fn transient_errors_are_retried() {
    let fake = Arc::new(FakeChain::new());
    let genesis = fake.set_genesis(fake.new_genesis(0));
    let harness = Harness::start(fake.clone(), 1_000);
    harness.wait_for_tip(&genesis.hash);

    fake.set_fail_requests(true);
    let blk = fake.set_tip(fake.new_block());
    harness.sync.new_base_chain_tip();
    xayax_test::sleep_some();

    fake.set_fail_requests(false);
    harness.sync.new_base_chain_tip();
    harness.wait_for_tip(&blk.hash);
}

#[test]
fn chain_mismatch_fails_startup() {
    let fake = Arc::new(FakeChain::new());
    fake.set_genesis(fake.new_genesis(0));

    let chain = Arc::new(Mutex::new(Chainstate::in_memory().unwrap()));
    chain.lock().unwrap().set_chain("other").unwrap();

    let mut sync = ChainSync::new(fake, chain, 1_000);
    assert!(matches!(
        sync.start(),
        Err(SyncError::State(StateError::ChainMismatch { .. }))
    ));
}
