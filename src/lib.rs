mod actions;
mod chat;
mod core;
mod logging;
mod relay;
mod state;
mod store;
mod unwrap;
mod updates;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use flume::{Receiver, Sender};
use nostr_sdk::prelude::Client;

pub use actions::AppAction;
pub use chat::{
    AddOutcome, Chat, ChatStore, DeliveryState, Direction, DmMessage, MessageTag, Scheme,
};
pub use relay::{
    subscription_pair, NostrRelayPool, RelayError, RelaySubscription, RelayTransport,
    SubscriptionCloser, SubscriptionFeed,
};
pub use state::{
    now_seconds, AppState, AuthState, ChatSummary, ChatView, SyncPhase, SyncStatus,
};
pub use store::{
    normalize_chat_key, DmStorage, MemoryStorage, SqliteStorage, StorageError, StoredMessage,
};
pub use unwrap::{parse_tags, unwrap_event, IgnoreReason, UnwrapOutcome};
pub use updates::{AppUpdate, CoreMsg, InternalEvent, SyncKind};

/// Host-side callback for receiving state snapshots.
pub trait AppReconciler: Send + Sync + 'static {
    fn reconcile(&self, update: AppUpdate);
}

/// Handle to the engine. Construction spawns the core actor thread; all
/// mutations go through [`dispatch`](Messenger::dispatch) and never block the
/// caller.
pub struct Messenger {
    core_tx: Sender<CoreMsg>,
    update_rx: Receiver<AppUpdate>,
    listening: AtomicBool,
    shared_state: Arc<RwLock<AppState>>,
}

impl Messenger {
    /// Production composition: nostr-sdk relay pool + sqlite storage under
    /// `data_dir`.
    pub fn new(data_dir: impl Into<String>) -> anyhow::Result<Self> {
        let data_dir = data_dir.into();
        let storage = SqliteStorage::open(&data_dir)?;
        Ok(Self::with_collaborators(
            data_dir,
            Arc::new(NostrRelayPool::new(Client::default())),
            Arc::new(storage),
        ))
    }

    /// Explicit composition root: callers (and tests) supply the relay
    /// transport and durable store.
    pub fn with_collaborators(
        data_dir: String,
        transport: Arc<dyn RelayTransport>,
        storage: Arc<dyn DmStorage>,
    ) -> Self {
        logging::init_logging();
        tracing::info!(data_dir = %data_dir, "Messenger starting");

        let (update_tx, update_rx) = flume::unbounded();
        let (core_tx, core_rx) = flume::unbounded::<CoreMsg>();
        let shared_state = Arc::new(RwLock::new(AppState::empty()));

        // Actor loop thread; single mutator of the engine state.
        let core_tx_for_core = core_tx.clone();
        let shared_for_core = shared_state.clone();
        thread::spawn(move || {
            let mut core = crate::core::AppCore::new(
                update_tx,
                core_tx_for_core,
                data_dir,
                shared_for_core,
                transport,
                storage,
            );
            while let Ok(msg) = core_rx.recv() {
                core.handle_message(msg);
            }
        });

        Self {
            core_tx,
            update_rx,
            listening: AtomicBool::new(false),
            shared_state,
        }
    }

    /// Latest published snapshot.
    pub fn state(&self) -> AppState {
        match self.shared_state.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    /// Contract: never blocks the caller.
    pub fn dispatch(&self, action: AppAction) {
        let _ = self.core_tx.send(CoreMsg::Action(action));
    }

    pub fn listen_for_updates(&self, reconciler: Box<dyn AppReconciler>) {
        if self
            .listening
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Avoid multiple listeners that would split messages.
            return;
        }

        let rx = self.update_rx.clone();
        thread::spawn(move || {
            while let Ok(update) = rx.recv() {
                reconciler.reconcile(update);
            }
        });
    }
}
