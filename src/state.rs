use crate::chat::DmMessage;

/// Immutable snapshot of the engine's observable state.
///
/// The core actor owns the mutable state and publishes a full snapshot after
/// every mutation; consumers only ever see a consistent copy.
#[derive(Clone, Debug)]
pub struct AppState {
    pub rev: u64,
    pub auth: AuthState,
    pub sync: SyncStatus,
    pub chat_list: Vec<ChatSummary>,
    pub current_chat: Option<ChatView>,
    pub toast: Option<String>,
}

impl AppState {
    pub fn empty() -> Self {
        Self {
            rev: 0,
            auth: AuthState::LoggedOut,
            sync: SyncStatus::idle(),
            chat_list: vec![],
            current_chat: None,
            toast: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthState {
    LoggedOut,
    LoggedIn { npub: String, pubkey: String },
}

/// Where the sync coordinator currently is.
///
/// `FullLoad` runs once per account (no checkpoint yet); afterwards the
/// engine cycles `Ready -> Refreshing -> Ready` and
/// `Ready -> PaginatingOlder -> Ready`. The live subscription is orthogonal
/// and tied to the session lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Idle,
    FullLoad,
    Ready,
    Refreshing,
    PaginatingOlder,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    /// Completion time of the last successful full load or refresh.
    pub last_sync_at: Option<i64>,
    /// False once both backward-pagination directions returned a short page.
    pub has_more_chats: bool,
}

impl SyncStatus {
    pub fn idle() -> Self {
        Self {
            phase: SyncPhase::Idle,
            last_sync_at: None,
            has_more_chats: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChatSummary {
    pub peer: String,
    pub peer_npub: String,
    pub last_message: Option<String>,
    pub last_message_at: Option<i64>,
    pub unread_count: u32,
    pub has_legacy_messages: bool,
}

/// Messages of the currently opened chat, ascending by timestamp.
/// Locally hidden messages are excluded from the view but stay stored.
#[derive(Clone, Debug)]
pub struct ChatView {
    pub peer: String,
    pub peer_npub: String,
    pub messages: Vec<DmMessage>,
    pub has_legacy_messages: bool,
}

pub fn now_seconds() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
