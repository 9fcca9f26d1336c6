//! Tests for the RPC methods, run against a fake base chain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use jsonrpc_core::ErrorCode;
use serde_json::json;

use xayax_chain::BlockData;
use xayax_state::Chainstate;
use xayax_test::{subscriber::TestSubscriber, FakeChain};
use xayax_zmq::ZmqPub;

use super::*;

struct Harness {
    fake: Arc<FakeChain>,
    chain: Arc<Mutex<Chainstate>>,
    zmq: Arc<ZmqPub>,
    sub: TestSubscriber,
    stopped: Arc<AtomicBool>,
}

impl Harness {
    fn new() -> Self {
        xayax_test::init();

        let fake = Arc::new(FakeChain::new());
        let chain = Arc::new(Mutex::new(Chainstate::in_memory().unwrap()));
        let zmq = Arc::new(ZmqPub::bind("tcp://127.0.0.1:*").unwrap());
        let sub = TestSubscriber::connect(&zmq.endpoint().unwrap());

        Self {
            fake,
            chain,
            zmq,
            sub,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    fn rpc(&self) -> RpcImpl {
        self.rpc_with_pending(false)
    }

    fn rpc_with_pending(&self, pending_enabled: bool) -> RpcImpl {
        let stopped = self.stopped.clone();
        RpcImpl::new(
            self.chain.clone(),
            self.fake.clone(),
            self.zmq.clone(),
            "tcp://*:28555".to_string(),
            pending_enabled,
            DEFAULT_MAX_UPDATE_ATTACHES,
            Arc::new(move || stopped.store(true, Ordering::SeqCst)),
        )
    }

    /// Mirrors a block into the local chain state as the new tip.
    fn sync_tip(&self, blk: &BlockData) {
        let mut state = self.chain.lock().unwrap();
        if state.get_tip_height().unwrap().is_none() {
            state.import_tip(blk).unwrap();
        } else {
            state.set_tip(blk).unwrap().unwrap();
        }
    }

    /// Builds the forest `g - a - b - c` (main chain) with `a - d` on a
    /// side branch, on the fake chain and mirrored locally.
    fn build_fork_forest(&self) -> (BlockData, BlockData, BlockData, BlockData, BlockData) {
        let g = self.fake.set_genesis(self.fake.new_genesis(10));
        let main = self.fake.attach_branch(&g.hash, 3);
        let (a, b, c) = (main[0].clone(), main[1].clone(), main[2].clone());
        let d = self.fake.new_block_from(&a.hash);
        self.fake.set_tip(d.clone());
        self.fake.set_tip(c.clone());

        for blk in [&g, &a, &b, &c, &d, &c] {
            self.sync_tip(blk);
        }

        (g, a, b, c, d)
    }
}

#[test]
fn blockchain_info_empty_and_synced() {
    let harness = Harness::new();
    let rpc = harness.rpc();
    harness.fake.set_genesis(harness.fake.new_genesis(2));

    let info = rpc.get_blockchain_info().unwrap();
    assert_eq!(
        info,
        GetBlockChainInfo {
            chain: "fake".to_string(),
            blocks: -1,
            bestblockhash: String::new(),
        }
    );

    let blk = harness.fake.attach_branch(&harness.fake.tip_hash(), 1);
    harness.sync_tip(&blk[0]);

    let info = rpc.get_blockchain_info().unwrap();
    assert_eq!(info.blocks, 3);
    assert_eq!(info.bestblockhash, blk[0].hash);
}

#[test]
fn network_info_returns_upstream_version() {
    let harness = Harness::new();
    let rpc = harness.rpc();
    assert_eq!(rpc.get_network_info().unwrap(), GetNetworkInfo { version: 1_00_00 });
}

#[test]
fn block_hash_lookup_and_fallthrough() {
    let harness = Harness::new();
    let rpc = harness.rpc();
    let (g, a, _, c, _) = harness.build_fork_forest();

    assert_eq!(rpc.get_block_hash(11).unwrap(), a.hash);
    assert_eq!(rpc.get_block_hash(13).unwrap(), c.hash);

    // Out of range either way.
    for height in [-1, 9, 14] {
        let err = rpc.get_block_hash(height).unwrap_err();
        assert_eq!(err.code, ErrorCode::ServerError(-8));
    }

    // After pruning, old heights are resolved through the base chain.
    harness.chain.lock().unwrap().prune(11).unwrap();
    assert_eq!(rpc.get_block_hash(10).unwrap(), g.hash);
    assert_eq!(rpc.get_block_hash(11).unwrap(), a.hash);
}

#[test]
fn block_header_lookup_and_fallthrough() {
    let harness = Harness::new();
    let rpc = harness.rpc();
    let (g, _, b, _, d) = harness.build_fork_forest();

    // Blocks on branches are known locally, too.
    assert_eq!(
        rpc.get_block_header(d.hash.clone()).unwrap(),
        GetBlockHeader { hash: d.hash, height: 12 }
    );

    harness.chain.lock().unwrap().prune(11).unwrap();
    assert_eq!(
        rpc.get_block_header(g.hash.clone()).unwrap(),
        GetBlockHeader { hash: g.hash, height: 10 }
    );
    assert_eq!(rpc.get_block_header(b.hash.clone()).unwrap().height, 12);

    let err = rpc.get_block_header("unknown".to_string()).unwrap_err();
    assert_eq!(err.code, ErrorCode::ServerError(-5));
}

#[test]
fn zmq_notifications_advertise_endpoints() {
    let harness = Harness::new();

    let plain = harness.rpc().get_zmq_notifications().unwrap();
    assert_eq!(
        plain,
        vec![ZmqNotification {
            kind: "pubgameblocks".to_string(),
            address: "tcp://*:28555".to_string(),
        }]
    );

    let with_pending = harness
        .rpc_with_pending(true)
        .get_zmq_notifications()
        .unwrap();
    assert_eq!(with_pending.len(), 2);
    assert_eq!(with_pending[1].kind, "pubgamepending");
}

#[test]
fn tracked_games_commands() {
    let harness = Harness::new();
    let rpc = harness.rpc();
    harness.build_fork_forest();

    let err = rpc
        .tracked_games("frobnicate".to_string(), "game".to_string())
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidParams);

    rpc.tracked_games("add".to_string(), "game".to_string())
        .unwrap();
    rpc.game_send_updates(harness.fake.tip_hash(), "game".to_string(), None)
        .unwrap();
    // Tracked: detach/attach walks produce messages (none here, as we are
    // at the tip, so just check removal works).
    rpc.tracked_games("remove".to_string(), "game".to_string())
        .unwrap();
}

#[test]
fn send_updates_over_a_fork() {
    let harness = Harness::new();
    let rpc = harness.rpc();
    let (_, _, b, c, d) = harness.build_fork_forest();
    rpc.tracked_games("add".to_string(), "game".to_string())
        .unwrap();

    let res = rpc
        .game_send_updates(d.hash.clone(), "game".to_string(), None)
        .unwrap();
    assert_eq!(res.toblock, c.hash);
    assert_eq!(res.error, None);
    assert_eq!(res.steps, UpdateSteps { detach: 1, attach: 2 });

    let (topic, payload, _) = harness.sub.recv().unwrap();
    assert_eq!(topic, "game-block-detach json game");
    assert_eq!(payload["block"]["hash"], json!(d.hash));
    assert_eq!(payload["reqtoken"], json!(res.reqtoken));

    for expected in [&b, &c] {
        let (topic, payload, _) = harness.sub.recv().unwrap();
        assert_eq!(topic, "game-block-attach json game");
        assert_eq!(payload["block"]["hash"], json!(expected.hash));
        assert_eq!(payload["reqtoken"], json!(res.reqtoken));
    }
    assert!(harness.sub.try_recv().is_none());
}

#[test]
fn send_updates_from_pruned_anchor() {
    let harness = Harness::new();
    let rpc = harness.rpc();
    let (_, a, b, c, _) = harness.build_fork_forest();
    rpc.tracked_games("add".to_string(), "game".to_string())
        .unwrap();

    // Prune everything below c locally; a is now only known upstream.
    harness.chain.lock().unwrap().prune(12).unwrap();

    let res = rpc
        .game_send_updates(a.hash.clone(), "game".to_string(), None)
        .unwrap();
    assert_eq!(res.steps, UpdateSteps { detach: 0, attach: 2 });
    assert_eq!(res.toblock, c.hash);

    for expected in [&b, &c] {
        let (topic, payload, _) = harness.sub.recv().unwrap();
        assert_eq!(topic, "game-block-attach json game");
        assert_eq!(payload["block"]["hash"], json!(expected.hash));
    }
    assert!(harness.sub.try_recv().is_none());
}

#[test]
fn send_updates_unknown_block() {
    let harness = Harness::new();
    let rpc = harness.rpc();
    harness.build_fork_forest();
    rpc.tracked_games("add".to_string(), "game".to_string())
        .unwrap();

    let res = rpc
        .game_send_updates("unheard of".to_string(), "game".to_string(), None)
        .unwrap();
    assert_eq!(res.toblock, "unheard of");
    assert_eq!(res.error, Some(true));
    assert_eq!(res.steps, UpdateSteps { detach: 0, attach: 0 });
    assert!(harness.sub.try_recv().is_none());
}

#[test]
fn send_updates_honours_to_block() {
    let harness = Harness::new();
    let rpc = harness.rpc();
    let (_, a, b, _, _) = harness.build_fork_forest();
    rpc.tracked_games("add".to_string(), "game".to_string())
        .unwrap();

    let res = rpc
        .game_send_updates(a.hash.clone(), "game".to_string(), Some(b.hash.clone()))
        .unwrap();
    assert_eq!(res.toblock, b.hash);
    assert_eq!(res.steps, UpdateSteps { detach: 0, attach: 1 });

    let (topic, payload, _) = harness.sub.recv().unwrap();
    assert_eq!(topic, "game-block-attach json game");
    assert_eq!(payload["block"]["hash"], json!(b.hash));
    assert!(harness.sub.try_recv().is_none());
}

#[test]
fn request_tokens_are_fresh() {
    let harness = Harness::new();
    let rpc = harness.rpc();
    harness.build_fork_forest();

    let tip = harness.fake.tip_hash();
    let first = rpc
        .game_send_updates(tip.clone(), "game".to_string(), None)
        .unwrap();
    let second = rpc.game_send_updates(tip, "game".to_string(), None).unwrap();
    assert_ne!(first.reqtoken, second.reqtoken);
}

#[test]
fn verify_message_modes() {
    let harness = Harness::new();
    let rpc = harness.rpc();

    // The fake chain's signature scheme is `<address>|<message>`.
    let sgn = BASE64.encode(b"addr|hello");

    assert_eq!(
        rpc.verify_message("addr".to_string(), "hello".to_string(), sgn.clone())
            .unwrap(),
        VerifyMessageResponse::Valid(true)
    );
    assert_eq!(
        rpc.verify_message("other".to_string(), "hello".to_string(), sgn.clone())
            .unwrap(),
        VerifyMessageResponse::Valid(false)
    );
    assert_eq!(
        rpc.verify_message(String::new(), "hello".to_string(), sgn)
            .unwrap(),
        VerifyMessageResponse::Recovery {
            valid: true,
            address: Some("addr".to_string()),
        }
    );
    assert_eq!(
        rpc.verify_message(String::new(), "other".to_string(), BASE64.encode(b"addr|hello"))
            .unwrap(),
        VerifyMessageResponse::Recovery {
            valid: false,
            address: None,
        }
    );

    let err = rpc
        .verify_message("addr".to_string(), "hello".to_string(), "%%%".to_string())
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidParams);
}

#[test]
fn mempool_passthrough() {
    let harness = Harness::new();
    let rpc = harness.rpc();
    harness
        .fake
        .set_mempool(vec!["tx1".to_string(), "tx2".to_string()]);
    assert_eq!(rpc.get_raw_mempool().unwrap(), vec!["tx1", "tx2"]);
}

#[test]
fn stop_signals_shutdown() {
    let harness = Harness::new();
    let rpc = harness.rpc();
    assert!(!harness.stopped.load(Ordering::SeqCst));
    rpc.stop().unwrap();
    assert!(harness.stopped.load(Ordering::SeqCst));
}
