mod config;
mod outbound;
mod session;
mod sync;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};

use flume::Sender;
use nostr_sdk::prelude::*;

use crate::actions::AppAction;
use crate::chat::{AddOutcome, ChatStore, DeliveryState, DmMessage};
use crate::relay::{RelayTransport, SubscriptionCloser};
use crate::state::{AppState, AuthState, ChatSummary, ChatView, SyncPhase, SyncStatus};
use crate::store::DmStorage;
use crate::updates::{AppUpdate, CoreMsg, InternalEvent, SyncKind};

/// Maximum backdating gift-wrap senders apply to outer envelope timestamps.
pub(crate) const MAX_TIMESTAMP_SKEW_SECS: i64 = 2 * 24 * 60 * 60;

/// Safety margin subtracted from the checkpoint for incremental queries.
/// Must exceed [`MAX_TIMESTAMP_SKEW_SECS`], or a freshly sent message whose
/// envelope was backdated past the checkpoint would never be re-discovered.
pub(crate) const BACKFILL_BUFFER_SECS: i64 = 3 * 24 * 60 * 60;

const _: () = assert!(BACKFILL_BUFFER_SECS > MAX_TIMESTAMP_SKEW_SECS);

#[derive(Clone)]
struct PendingSend {
    peer: PublicKey,
    wrap_peer: Event,
    wrap_self: Event,
}

pub(crate) struct Session {
    keys: Keys,
    alive: Arc<AtomicBool>,
    live_subs: Vec<SubscriptionCloser>,
    /// DM-specific relays the account published (kind 10050), resolved at
    /// login; empty when nothing is published.
    dm_relays: Vec<RelayUrl>,
}

pub struct AppCore {
    pub state: AppState,
    rev: u64,
    last_outgoing_ts: i64,

    update_sender: Sender<AppUpdate>,
    core_sender: Sender<CoreMsg>,
    shared_state: Arc<RwLock<AppState>>,

    config: config::AppConfig,
    runtime: tokio::runtime::Runtime,

    transport: Arc<dyn RelayTransport>,
    storage: Arc<dyn DmStorage>,

    session: Option<Session>,
    chats: Option<ChatStore>,

    // Generation tokens: async results stamped with an older value than the
    // current counter are stale (logout happened, or a newer operation of
    // the same kind started) and are dropped on arrival.
    session_token: u64,
    sync_token: u64,
    page_token: u64,
    live_token: u64,

    sync_in_flight: bool,
    paginating: bool,

    /// Oldest message timestamp seen across all chats; lower bound used as
    /// `until` for backward pagination.
    oldest_seen: Option<i64>,

    // message id -> wrapped envelopes kept for retry after a failed publish
    pending_sends: HashMap<String, PendingSend>,
}

impl AppCore {
    pub fn new(
        update_sender: Sender<AppUpdate>,
        core_sender: Sender<CoreMsg>,
        data_dir: String,
        shared_state: Arc<RwLock<AppState>>,
        transport: Arc<dyn RelayTransport>,
        storage: Arc<dyn DmStorage>,
    ) -> Self {
        let config = config::load_app_config(&data_dir);
        let state = AppState::empty();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .enable_io()
            .build()
            .expect("tokio runtime");

        let this = Self {
            state,
            rev: 0,
            last_outgoing_ts: 0,
            update_sender,
            core_sender,
            shared_state,
            config,
            runtime,
            transport,
            storage,
            session: None,
            chats: None,
            session_token: 0,
            sync_token: 0,
            page_token: 0,
            live_token: 0,
            sync_in_flight: false,
            paginating: false,
            oldest_seen: None,
            pending_sends: HashMap::new(),
        };

        // Ensure Messenger::state() has an immediately-available snapshot.
        let snapshot = this.state.clone();
        this.commit_state_snapshot(&snapshot);
        this
    }

    fn next_rev(&mut self) -> u64 {
        self.rev += 1;
        self.state.rev = self.rev;
        self.rev
    }

    fn commit_state_snapshot(&self, snapshot: &AppState) {
        match self.shared_state.write() {
            Ok(mut g) => *g = snapshot.clone(),
            Err(poison) => *poison.into_inner() = snapshot.clone(),
        }
    }

    fn emit_state(&mut self) {
        self.next_rev();
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::FullState(snapshot));
    }

    fn emit_account_created(&mut self, nsec: String, pubkey: String, npub: String) {
        let rev = self.next_rev();
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::AccountCreated {
            rev,
            nsec,
            pubkey,
            npub,
        });
    }

    fn toast(&mut self, msg: impl Into<String>) {
        // Kept in state until explicitly cleared; terse status only, raw
        // protocol/crypto error text stays in the logs.
        self.state.toast = Some(msg.into());
        self.emit_state();
    }

    fn is_logged_in(&self) -> bool {
        self.session.is_some()
    }

    fn account(&self) -> Option<PublicKey> {
        self.session.as_ref().map(|s| s.keys.public_key())
    }

    pub fn handle_message(&mut self, msg: CoreMsg) {
        match msg {
            CoreMsg::Action(ref action) => {
                // Never log `?action` directly: it can contain secrets (`nsec`).
                tracing::info!(action = action.tag(), "dispatch");
                self.handle_action(action.clone());
            }
            CoreMsg::Internal(internal) => self.handle_internal(*internal),
        }
    }

    fn handle_internal(&mut self, internal: InternalEvent) {
        match internal {
            InternalEvent::LiveDm { message } => {
                tracing::debug!(id = %message.id, "live_dm");
                self.merge_messages(vec![message]);
            }
            InternalEvent::RelayListResolved { token, dm_relays } => {
                if token != self.session_token {
                    return;
                }
                let has_checkpoint = {
                    let Some(sess) = self.session.as_mut() else {
                        return;
                    };
                    sess.dm_relays = dm_relays;
                    let account = sess.keys.public_key();
                    self.storage.checkpoint(&account).ok().flatten().is_some()
                };

                self.start_live_subscription();
                if has_checkpoint {
                    self.start_sync(SyncKind::Refresh);
                } else {
                    self.start_sync(SyncKind::Full);
                }
            }
            InternalEvent::LiveSubscriptionReady { token, closer } => {
                if token != self.live_token {
                    // Stale result (logout or a replacement subscription).
                    closer.close();
                    return;
                }
                match self.session.as_mut() {
                    Some(sess) => sess.live_subs.push(closer),
                    None => closer.close(),
                }
            }
            InternalEvent::SyncFinished {
                token,
                kind,
                messages,
                checkpoint,
            } => {
                if token != self.sync_token {
                    tracing::debug!(token, "stale sync result dropped");
                    return;
                }
                tracing::info!(?kind, count = messages.len(), checkpoint, "sync_finished");
                self.sync_in_flight = false;
                self.merge_messages(messages);

                if let Some(account) = self.account() {
                    if let Err(e) = self.storage.set_checkpoint(&account, checkpoint) {
                        tracing::warn!(%e, "checkpoint persist failed");
                    }
                }
                self.state.sync.last_sync_at = Some(checkpoint);
                self.state.sync.phase = SyncPhase::Ready;
                self.emit_state();
            }
            InternalEvent::SyncFailed { token, kind, error } => {
                if token != self.sync_token {
                    return;
                }
                tracing::warn!(?kind, %error, "sync failed");
                self.sync_in_flight = false;
                self.state.sync.phase = SyncPhase::Ready;
                self.toast("Message sync failed");
            }
            InternalEvent::OlderPageLoaded {
                token,
                messages,
                has_more,
            } => {
                if token != self.page_token {
                    tracing::debug!(token, "stale pagination page dropped");
                    return;
                }
                tracing::info!(count = messages.len(), has_more, "older_page_loaded");
                self.paginating = false;
                self.merge_messages(messages);
                self.state.sync.has_more_chats = has_more;
                self.state.sync.phase = SyncPhase::Ready;
                self.emit_state();
            }
            InternalEvent::PublishMessageResult {
                peer,
                message_id,
                ok,
                error,
                wraps,
            } => {
                tracing::info!(ok, ?error, peer = %peer.to_hex(), %message_id, "publish_result");
                let delivery = if ok {
                    self.pending_sends.remove(&message_id);
                    DeliveryState::Sent
                } else {
                    if let Some((wrap_peer, wrap_self)) = wraps {
                        self.pending_sends.insert(
                            message_id.clone(),
                            PendingSend {
                                peer,
                                wrap_peer,
                                wrap_self,
                            },
                        );
                    }
                    DeliveryState::Failed {
                        reason: error.unwrap_or_else(|| "publish failed".into()),
                    }
                };
                if let Some(chats) = self.chats.as_mut() {
                    chats.set_delivery(&peer, &message_id, delivery);
                }
                self.refresh_chat_list();
                self.refresh_current_chat();
                self.emit_state();
            }
            InternalEvent::Toast(msg) => {
                tracing::info!(%msg, "toast");
                self.toast(msg);
            }
        }
    }

    fn handle_action(&mut self, action: AppAction) {
        match action {
            // Auth
            AppAction::CreateAccount => {
                let keys = Keys::generate();
                let nsec = keys.secret_key().to_bech32().expect("infallible");
                let pubkey = keys.public_key().to_hex();
                let npub = keys.public_key().to_bech32().unwrap_or(pubkey.clone());

                self.emit_account_created(nsec, pubkey, npub);
                self.start_session(keys);
            }
            AppAction::Login { nsec } => {
                let nsec = nsec.trim();
                if nsec.is_empty() {
                    self.toast("Enter an nsec");
                    return;
                }
                let keys = match Keys::parse(nsec) {
                    Ok(k) => k,
                    Err(e) => {
                        self.toast(format!("Invalid nsec: {e}"));
                        return;
                    }
                };
                self.start_session(keys);
            }
            AppAction::Logout => {
                self.stop_session();
                self.state.auth = AuthState::LoggedOut;
                self.handle_auth_transition(false);
            }

            // Chat
            AppAction::SendMessage { peer, content } => {
                self.send_direct_message(&peer, content);
            }
            AppAction::RetryMessage { peer, message_id } => {
                self.retry_message(&peer, &message_id);
            }
            AppAction::OpenChat { peer } => {
                let Some(peer) = self.parse_peer(&peer) else {
                    return;
                };
                let Some(view) = self.chat_view(&peer) else {
                    self.toast("Chat not found");
                    return;
                };
                self.state.current_chat = Some(view);
                self.emit_state();
            }
            AppAction::CloseChat => {
                if self.state.current_chat.is_some() {
                    self.state.current_chat = None;
                    self.emit_state();
                }
            }
            AppAction::MarkChatRead { peer } => {
                let Some(peer) = self.parse_peer(&peer) else {
                    return;
                };
                let changed = match self.chats.as_mut() {
                    Some(chats) => chats.mark_chat_read(&peer),
                    None => false,
                };
                if !changed {
                    return;
                }
                if let Some(account) = self.account() {
                    if let Err(e) = self.storage.mark_chat_read(&account, &peer) {
                        tracing::warn!(%e, "mark-read persist failed");
                    }
                }
                self.refresh_chat_list();
                self.refresh_current_chat();
                self.emit_state();
            }
            AppAction::MarkAllRead => {
                let Some(chats) = self.chats.as_mut() else {
                    return;
                };
                chats.mark_all_read();
                if let Some(account) = self.account() {
                    if let Err(e) = self.storage.mark_all_read(&account) {
                        tracing::warn!(%e, "mark-all-read persist failed");
                    }
                }
                self.refresh_chat_list();
                self.refresh_current_chat();
                self.emit_state();
            }
            AppAction::DeleteMessage { peer, message_id } => {
                let Some(peer) = self.parse_peer(&peer) else {
                    return;
                };
                let removed = match self.chats.as_mut() {
                    Some(chats) => chats.delete_message(&peer, &message_id),
                    None => false,
                };
                if !removed {
                    return;
                }
                // Local-only: relay-held copies are untouched, and the
                // ephemeral wrap keys rule out a verifiable remote deletion.
                if let Some(account) = self.account() {
                    if let Err(e) = self.storage.delete_message(&account, &peer, &message_id) {
                        tracing::warn!(%e, "delete persist failed");
                    }
                }
                self.pending_sends.remove(&message_id);
                self.refresh_chat_list();
                self.refresh_current_chat();
                self.emit_state();
            }
            AppAction::HideMessage { peer, message_id } => {
                self.set_message_hidden(&peer, &message_id, true);
            }
            AppAction::UnhideMessage { peer, message_id } => {
                self.set_message_hidden(&peer, &message_id, false);
            }

            // Sync
            AppAction::Refresh => {
                if !self.is_logged_in() {
                    return;
                }
                self.start_sync(SyncKind::Refresh);
            }
            AppAction::LoadOlderMessages { limit } => {
                self.start_pagination(limit as usize);
            }

            // UI
            AppAction::ClearToast => {
                if self.state.toast.is_some() {
                    self.state.toast = None;
                    self.emit_state();
                }
            }

            // Lifecycle
            AppAction::Foregrounded => {
                if self.is_logged_in() {
                    self.start_sync(SyncKind::Refresh);
                }
            }
        }
    }

    fn set_message_hidden(&mut self, peer: &str, message_id: &str, hidden: bool) {
        let Some(peer) = self.parse_peer(peer) else {
            return;
        };
        let changed = match self.chats.as_mut() {
            Some(chats) => chats.set_hidden(&peer, message_id, hidden),
            None => false,
        };
        if !changed {
            return;
        }
        if let Some(account) = self.account() {
            if let Err(e) = self.storage.set_hidden(&account, &peer, message_id, hidden) {
                tracing::warn!(%e, "hide persist failed");
            }
        }
        self.refresh_current_chat();
        self.emit_state();
    }

    fn parse_peer(&mut self, input: &str) -> Option<PublicKey> {
        match PublicKey::parse(input.trim()) {
            Ok(pk) => Some(pk),
            Err(e) => {
                self.toast(format!("Invalid peer key: {e}"));
                None
            }
        }
    }

    /// Merge decrypted messages into the chat map, mirroring each accepted
    /// one to durable storage. Persistence failures are logged, not
    /// surfaced: memory stays authoritative and the next load reconciles.
    fn merge_messages(&mut self, messages: Vec<DmMessage>) {
        if messages.is_empty() {
            return;
        }
        let Some(account) = self.account() else {
            return;
        };
        let Some(chats) = self.chats.as_mut() else {
            return;
        };

        let mut added = 0usize;
        for message in messages {
            let peer = message.peer;
            let id = message.id.clone();
            let timestamp = message.timestamp;
            match chats.add_message(message.clone()) {
                AddOutcome::Added => {
                    added += 1;
                    self.oldest_seen = Some(match self.oldest_seen {
                        Some(t) => t.min(timestamp),
                        None => timestamp,
                    });
                    match self.storage.save_message(&account, &peer, &message) {
                        Ok(_) => {}
                        Err(e) => tracing::warn!(%e, %id, "message persist failed"),
                    }
                }
                AddOutcome::Duplicate => {
                    tracing::debug!(%id, "duplicate message ignored");
                }
                AddOutcome::RejectedSelfChat => {
                    tracing::debug!(%id, "self-chat message rejected");
                }
            }
        }

        if added > 0 {
            self.refresh_chat_list();
            self.refresh_current_chat();
        }
        self.emit_state();
    }

    fn refresh_chat_list(&mut self) {
        let Some(chats) = self.chats.as_ref() else {
            self.state.chat_list = vec![];
            return;
        };
        let snapshot = chats.snapshot();
        let mut list: Vec<ChatSummary> = snapshot
            .values()
            .map(|chat| {
                let last = chat.last_message();
                ChatSummary {
                    peer: chat.peer.to_hex(),
                    peer_npub: chat
                        .peer
                        .to_bech32()
                        .unwrap_or_else(|_| chat.peer.to_hex()),
                    last_message: last.map(|m| m.content.clone()),
                    last_message_at: last.map(|m| m.timestamp),
                    unread_count: chat.unread_count,
                    has_legacy_messages: chat.has_legacy_messages,
                }
            })
            .collect();
        list.sort_by_key(|c| std::cmp::Reverse(c.last_message_at.unwrap_or(0)));
        self.state.chat_list = list;
    }

    fn chat_view(&self, peer: &PublicKey) -> Option<ChatView> {
        let chats = self.chats.as_ref()?;
        let chat = chats.chat(peer)?;
        let messages = chat
            .sorted_messages()
            .into_iter()
            .filter(|m| !chat.is_hidden(&m.id))
            .collect();
        Some(ChatView {
            peer: peer.to_hex(),
            peer_npub: peer.to_bech32().unwrap_or_else(|_| peer.to_hex()),
            messages,
            has_legacy_messages: chat.has_legacy_messages,
        })
    }

    fn refresh_current_chat(&mut self) {
        let Some(current) = self.state.current_chat.as_ref() else {
            return;
        };
        let Ok(peer) = PublicKey::from_hex(&current.peer) else {
            self.state.current_chat = None;
            return;
        };
        self.state.current_chat = self.chat_view(&peer);
    }

    pub(crate) fn handle_auth_transition(&mut self, logged_in: bool) {
        if logged_in {
            self.state.sync = SyncStatus::idle();
            self.emit_state();
        } else {
            self.state.chat_list = vec![];
            self.state.current_chat = None;
            self.state.sync = SyncStatus::idle();
            self.chats = None;
            self.oldest_seen = None;
            self.pending_sends.clear();
            self.last_outgoing_ts = 0;
            self.emit_state();
        }
    }
}
