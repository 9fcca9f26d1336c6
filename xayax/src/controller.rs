//! The lifecycle owner tying all components together.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use xayax_block_cache::{BlockCacheChain, InMemoryStorage, MysqlStorage};
use xayax_chain::{
    base_chain::{BaseChain, BoxError, Callbacks as UpstreamCallbacks},
    BlockData, MoveData,
};
use xayax_rpc::{
    updates::{push_zmq_blocks, PushError},
    RpcImpl, RpcServer, DEFAULT_MAX_UPDATE_ATTACHES,
};
use xayax_state::{Chainstate, StateError};
use xayax_zmq::{PublishError, ZmqPub};

use crate::{
    config::{BlockCacheSetup, Config},
    pending::PendingManager,
    sync::{self, ChainSync, SyncError, SyncNotifier},
};

/// Time to sleep after a stop request before tearing servers down, so the
/// response to the `stop` RPC itself can drain.
const SHUTDOWN_DRAIN: Duration = Duration::from_millis(10);

/// Errors that terminate a controller run.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Setting up the data directory or the RPC server failed.
    #[error("I/O error during startup")]
    Io(#[from] std::io::Error),

    /// The chain state failed or is corrupt.
    #[error(transparent)]
    State(#[from] StateError),

    /// The sync worker hit a fatal error.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Binding or using the ZMQ publisher failed.
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// Publishing a tip update failed in a way that indicates local state
    /// corruption.
    #[error(transparent)]
    Push(#[from] PushError),

    /// The base chain failed during startup.
    #[error("base chain error: {0}")]
    Base(#[source] BoxError),

    /// `run` was called while the controller is already running.
    #[error("controller is already running")]
    AlreadyRunning,
}

/// An instance of the adapter: holds a base-chain connector and runs the
/// local chain state, sync worker, pending gate, and the RPC/ZMQ servers
/// GSPs connect to.
pub struct Controller {
    base: Arc<dyn BaseChain>,
    config: Config,

    /// Self-reference handed to callbacks and the RPC stop signal.
    weak: Weak<Controller>,

    state: Mutex<RunState>,
    cv: Condvar,

    /// Invoked once after the servers are bound but before syncing starts.
    /// Tests use this to connect subscribers without missing the initial
    /// notifications.
    startup_hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

#[derive(Default)]
struct RunState {
    running: bool,
    should_stop: bool,
    fatal: Option<ControllerError>,
}

impl Controller {
    /// Creates a controller for the given connector, which must already be
    /// started.  The controller will install its own callbacks on it.
    pub fn new(base: Arc<dyn BaseChain>, config: Config) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            base,
            config,
            weak: weak.clone(),
            state: Mutex::new(RunState::default()),
            cv: Condvar::new(),
            startup_hook: Mutex::new(None),
        })
    }

    /// Installs a hook invoked when the servers are up but syncing has not
    /// started yet.
    pub fn set_startup_hook(&self, hook: Box<dyn FnOnce() + Send>) {
        *self.startup_hook.lock().expect("startup hook lock poisoned") = Some(hook);
    }

    /// Starts the servers and blocks until [`Controller::stop`] is called
    /// (from another thread or through the `stop` RPC), or until a fatal
    /// error is hit.
    pub fn run(&self) -> Result<(), ControllerError> {
        {
            let mut state = self.lock_state();
            if state.running {
                return Err(ControllerError::AlreadyRunning);
            }
            state.running = true;
            state.should_stop = false;
            state.fatal = None;
        }

        let result = self.run_inner();
        self.lock_state().running = false;
        result
    }

    /// Signals an active [`Controller::run`] to return.  The run may still
    /// take a moment to actually wind down.
    pub fn stop(&self) {
        self.lock_state().should_stop = true;
        self.cv.notify_all();
    }

    fn run_inner(&self) -> Result<(), ControllerError> {
        let base: Arc<dyn BaseChain> = match &self.config.block_cache {
            BlockCacheSetup::Disabled => self.base.clone(),
            BlockCacheSetup::InMemory => Arc::new(BlockCacheChain::new(
                self.base.clone(),
                Arc::new(InMemoryStorage::default()),
                self.config.max_reorg_depth,
            )),
            BlockCacheSetup::Mysql(url) => Arc::new(BlockCacheChain::new(
                self.base.clone(),
                Arc::new(MysqlStorage::connect(url).map_err(ControllerError::Base)?),
                self.config.max_reorg_depth,
            )),
        };

        // The local state lives in a per-chain subdirectory, so one data
        // directory can serve connectors for multiple networks.
        let chain_id = base.get_chain().map_err(ControllerError::Base)?;
        let state_dir = self.config.data_dir.join(&chain_id);
        std::fs::create_dir_all(&state_dir)?;
        let state_file = state_dir.join("chainstate.sqlite");
        info!(state_file = %state_file.display(), chain = %chain_id, "opening chain state");
        let chain = Arc::new(Mutex::new(Chainstate::open(&state_file)?));

        let zmq = Arc::new(ZmqPub::bind(&self.config.zmq_address)?);
        for game in &self.config.pending_games {
            zmq.track_game(game);
        }

        let pending_enabled = if self.config.pending_games.is_empty() {
            false
        } else {
            let supported = base.enable_pending().map_err(ControllerError::Base)?;
            if !supported {
                warn!("pending moves are requested, but the connector does not support them");
            }
            supported
        };

        let pendings = Arc::new(PendingManager::new(zmq.clone()));

        let mut sync = ChainSync::new(base.clone(), chain.clone(), self.config.max_reorg_depth);
        let weak = self.weak.clone();
        sync.set_fatal_handler(Box::new(move |err| {
            if let Some(controller) = weak.upgrade() {
                controller.report_fatal(err.into());
            }
        }));
        sync.set_callbacks(Some(Arc::new(TipUpdateHandler {
            base: base.clone(),
            zmq: zmq.clone(),
            pendings: pendings.clone(),
            controller: self.weak.clone(),
            sanity_checks: self.config.sanity_checks,
            max_reorg_depth: self.config.max_reorg_depth,
        })));

        let weak = self.weak.clone();
        let rpc = RpcImpl::new(
            chain.clone(),
            base.clone(),
            zmq.clone(),
            self.config.zmq_address.clone(),
            pending_enabled,
            DEFAULT_MAX_UPDATE_ATTACHES,
            Arc::new(move || {
                if let Some(controller) = weak.upgrade() {
                    controller.stop();
                }
            }),
        );
        let server = RpcServer::start(rpc, &self.config.rpc)?;

        if let Some(hook) = self
            .startup_hook
            .lock()
            .expect("startup hook lock poisoned")
            .take()
        {
            hook();
        }

        base.set_callbacks(Some(Arc::new(UpstreamHandler {
            pendings: pendings.clone(),
            sync: sync.notifier(),
        })));
        sync.start()?;

        let mut state = self.lock_state();
        while !state.should_stop {
            state = self.cv.wait(state).expect("controller state lock poisoned");
        }
        drop(state);
        info!("controller is shutting down");
        thread::sleep(SHUTDOWN_DRAIN);

        server.close();
        base.set_callbacks(None);
        sync.set_callbacks(None);
        drop(sync);

        match self.lock_state().fatal.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn report_fatal(&self, err: ControllerError) {
        error!(%err, "fatal error, shutting down");
        let mut state = self.lock_state();
        if state.fatal.is_none() {
            state.fatal = Some(err);
        }
        state.should_stop = true;
        self.cv.notify_all();
    }

    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().expect("controller state lock poisoned")
    }
}

/// Receiver for push notifications from the connector.
struct UpstreamHandler {
    pendings: Arc<PendingManager>,
    sync: SyncNotifier,
}

impl UpstreamCallbacks for UpstreamHandler {
    fn tip_changed(&self, tip: &str) {
        self.pendings.tip_changed(tip);
        self.sync.new_base_chain_tip();
    }

    fn pending_moves(&self, moves: &[MoveData]) {
        self.pendings.pending_moves(moves);
    }
}

/// Receiver for tip updates from the sync worker.  Publishes the
/// detach/attach notifications, releases gated pendings, and performs the
/// post-update maintenance (sanity checks, pruning).
struct TipUpdateHandler {
    base: Arc<dyn BaseChain>,
    zmq: Arc<ZmqPub>,
    pendings: Arc<PendingManager>,
    controller: Weak<Controller>,
    sanity_checks: bool,
    max_reorg_depth: u64,
}

impl TipUpdateHandler {
    fn report_fatal(&self, err: ControllerError) {
        if let Some(controller) = self.controller.upgrade() {
            controller.report_fatal(err);
        }
    }
}

impl sync::Callbacks for TipUpdateHandler {
    fn tip_updated_from(&self, chain: &mut Chainstate, old_tip: &str, attaches: &[BlockData]) {
        match push_zmq_blocks(
            chain,
            &*self.base,
            &self.zmq,
            old_tip,
            Some(attaches),
            None,
            0,
            None,
        ) {
            Ok(_) => (),
            // Notification delivery is best-effort; GSPs recover from
            // missed messages through the catch-up RPC.
            Err(PushError::Publish(err)) => {
                warn!(%err, "failed to publish tip update notifications")
            }
            Err(err) => return self.report_fatal(err.into()),
        }

        let new_tip = attaches.last().expect("tip updates attach at least one block");
        self.pendings.chainstate_tip_changed(&new_tip.hash);

        if self.sanity_checks {
            if let Err(err) = chain.sanity_check() {
                return self.report_fatal(err.into());
            }
        }

        let maintain = chain.get_tip_height().and_then(|tip| match tip {
            Some(tip) if tip > self.max_reorg_depth => {
                chain.prune(tip - self.max_reorg_depth - 1).map(|_| ())
            }
            _ => Ok(()),
        });
        if let Err(err) = maintain {
            self.report_fatal(err.into());
        }
    }
}
