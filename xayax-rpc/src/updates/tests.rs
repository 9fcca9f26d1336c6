//! Tests for the shared detach/attach push routine.

use std::sync::Arc;

use xayax_test::{subscriber::TestSubscriber, FakeChain};

use super::*;

fn block(hash: &str, parent: &str, height: u64) -> BlockData {
    BlockData {
        hash: hash.to_string(),
        parent: parent.to_string(),
        height,
        ..Default::default()
    }
}

struct Setup {
    chain: Chainstate,
    fake: Arc<FakeChain>,
    zmq: Arc<ZmqPub>,
    sub: TestSubscriber,
}

impl Setup {
    fn new() -> Self {
        xayax_test::init();

        let zmq = Arc::new(ZmqPub::bind("tcp://127.0.0.1:*").unwrap());
        zmq.track_game("game");
        let sub = TestSubscriber::connect(&zmq.endpoint().unwrap());

        Self {
            chain: Chainstate::in_memory().unwrap(),
            fake: Arc::new(FakeChain::new()),
            zmq,
            sub,
        }
    }

    fn push(
        &self,
        from: &str,
        attaches: Option<&[BlockData]>,
    ) -> Result<Option<PushedBlocks>, PushError> {
        push_zmq_blocks(
            &self.chain,
            &*self.fake,
            &self.zmq,
            from,
            attaches,
            None,
            16,
            None,
        )
    }

    /// Asserts the next received message and returns its block hash.
    fn expect_message(&self, command: &str, hash: &str) {
        let (topic, payload, _) = self.sub.recv().expect("no message received");
        assert_eq!(topic, format!("{command} json game"));
        assert_eq!(payload["block"]["hash"].as_str(), Some(hash));
    }
}

#[test]
fn first_import_attaches_everything() {
    let mut setup = Setup::new();
    let g = block("g", "", 10);
    setup.chain.import_tip(&g).unwrap();

    let pushed = setup.push("", Some(&[g.clone()])).unwrap().unwrap();
    assert!(pushed.detached.is_empty());
    assert_eq!(pushed.attached, vec![g.clone()]);

    setup.expect_message("game-block-attach", &g.hash);
    assert!(setup.sub.try_recv().is_none());
}

#[test]
fn provided_attaches_skip_blocks_before_the_fork() {
    let mut setup = Setup::new();
    setup.chain.import_tip(&block("g", "", 10)).unwrap();
    let a = block("a", "g", 11);
    let b = block("b", "a", 12);
    setup.chain.set_tip(&a).unwrap().unwrap();
    setup.chain.set_tip(&b).unwrap().unwrap();

    // The sync queried from the old tip, so the first provided block is
    // the old tip itself and must not be re-attached.
    let pushed = setup
        .push("a", Some(&[a.clone(), b.clone()]))
        .unwrap()
        .unwrap();
    assert!(pushed.detached.is_empty());
    assert_eq!(pushed.attached, vec![b.clone()]);

    setup.expect_message("game-block-attach", &b.hash);
    assert!(setup.sub.try_recv().is_none());
}

#[test]
fn detach_only_update_collapses() {
    let mut setup = Setup::new();
    setup.chain.import_tip(&block("g", "", 10)).unwrap();
    let a = block("a", "g", 11);
    let b = block("b", "a", 12);
    let c = block("c", "b", 13);
    for blk in [&a, &b, &c] {
        setup.chain.set_tip(blk).unwrap().unwrap();
    }
    setup.chain.set_tip(&a).unwrap().unwrap();

    // The chain collapsed back onto a; the sync provides a as the single
    // "attach", which is the parent of the deepest detach.
    let pushed = setup.push("c", Some(&[a.clone()])).unwrap().unwrap();
    let detached: Vec<&str> = pushed.detached.iter().map(|blk| blk.hash.as_str()).collect();
    assert_eq!(detached, vec!["c", "b"]);
    assert!(pushed.attached.is_empty());

    setup.expect_message("game-block-detach", "c");
    setup.expect_message("game-block-detach", "b");
    assert!(setup.sub.try_recv().is_none());
}

#[test]
fn inconsistent_provided_attaches_error_out() {
    let mut setup = Setup::new();
    setup.chain.import_tip(&block("g", "", 10)).unwrap();
    setup.chain.set_tip(&block("a", "g", 11)).unwrap().unwrap();

    // An attach block at the fork height that does not chain to the fork
    // point means the update stream and the chain state disagree.
    let bogus = block("x", "bogus", 12);
    assert!(matches!(
        setup.push("a", Some(&[bogus])),
        Err(PushError::Inconsistent(_))
    ));
    assert!(setup.sub.try_recv().is_none());
}

#[test]
fn racing_reorg_returns_detaches_only() {
    let mut setup = Setup::new();

    // Locally, d sits on a side branch of g - a - b - c.
    setup.chain.import_tip(&block("g", "", 10)).unwrap();
    let d = block("d", "a", 12);
    for blk in [
        &block("a", "g", 11),
        &d,
        &block("b", "a", 12),
        &block("c", "b", 13),
    ] {
        setup.chain.set_tip(blk).unwrap().unwrap();
    }

    // The base chain meanwhile serves an entirely different main chain,
    // so the queried attaches do not line up with the local fork point.
    let g2 = setup.fake.set_genesis(setup.fake.new_genesis(10));
    setup.fake.attach_branch(&g2.hash, 3);

    let pushed = setup.push("d", None).unwrap().unwrap();
    let detached: Vec<&str> = pushed.detached.iter().map(|blk| blk.hash.as_str()).collect();
    assert_eq!(detached, vec!["d"]);
    assert!(pushed.attached.is_empty());

    setup.expect_message("game-block-detach", "d");
    assert!(setup.sub.try_recv().is_none());
}
