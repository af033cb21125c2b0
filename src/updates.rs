use nostr_sdk::prelude::{Event, PublicKey, RelayUrl};

use crate::chat::DmMessage;
use crate::relay::SubscriptionCloser;
use crate::state::AppState;
use crate::AppAction;

#[derive(Clone, Debug)]
pub enum AppUpdate {
    FullState(AppState),
    AccountCreated {
        rev: u64,
        nsec: String,
        pubkey: String,
        npub: String,
    },
}

impl AppUpdate {
    pub fn rev(&self) -> u64 {
        match self {
            AppUpdate::FullState(s) => s.rev,
            AppUpdate::AccountCreated { rev, .. } => *rev,
        }
    }
}

#[derive(Debug)]
pub enum CoreMsg {
    Action(AppAction),
    Internal(Box<InternalEvent>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncKind {
    Full,
    Refresh,
}

pub enum InternalEvent {
    // Receive path
    /// One message delivered by the live subscription.
    LiveDm { message: DmMessage },

    // Session bootstrap
    /// The account's published DM relay list, resolved at login. Kicks off
    /// the live subscription and the initial load once it lands.
    RelayListResolved {
        token: u64,
        dm_relays: Vec<RelayUrl>,
    },
    /// The live subscription's detached close handle. Kept internal because
    /// it carries a transport resource.
    LiveSubscriptionReady {
        token: u64,
        closer: SubscriptionCloser,
    },

    // Sync results
    /// A full load or refresh finished: every relay query issued and every
    /// per-event decrypt task settled. Only now may the checkpoint advance.
    SyncFinished {
        token: u64,
        kind: SyncKind,
        messages: Vec<DmMessage>,
        checkpoint: i64,
    },
    SyncFailed {
        token: u64,
        kind: SyncKind,
        error: String,
    },
    /// One backward page, both directions queried and decrypted.
    OlderPageLoaded {
        token: u64,
        messages: Vec<DmMessage>,
        has_more: bool,
    },

    // Outbound results
    PublishMessageResult {
        peer: PublicKey,
        message_id: String,
        ok: bool,
        error: Option<String>,
        /// The wrapped envelopes, kept on failure so a retry can republish
        /// the identical events.
        wraps: Option<(Event, Event)>,
    },

    Toast(String),
}

impl std::fmt::Debug for InternalEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InternalEvent::LiveDm { message } => f
                .debug_struct("LiveDm")
                .field("id", &message.id)
                .finish_non_exhaustive(),
            InternalEvent::RelayListResolved { token, dm_relays } => f
                .debug_struct("RelayListResolved")
                .field("token", token)
                .field("dm_relays", &dm_relays.len())
                .finish(),
            InternalEvent::LiveSubscriptionReady { token, .. } => f
                .debug_struct("LiveSubscriptionReady")
                .field("token", token)
                .finish_non_exhaustive(),
            InternalEvent::SyncFinished {
                token,
                kind,
                messages,
                checkpoint,
            } => f
                .debug_struct("SyncFinished")
                .field("token", token)
                .field("kind", kind)
                .field("messages", &messages.len())
                .field("checkpoint", checkpoint)
                .finish(),
            InternalEvent::SyncFailed { token, kind, error } => f
                .debug_struct("SyncFailed")
                .field("token", token)
                .field("kind", kind)
                .field("error", error)
                .finish(),
            InternalEvent::OlderPageLoaded {
                token,
                messages,
                has_more,
            } => f
                .debug_struct("OlderPageLoaded")
                .field("token", token)
                .field("messages", &messages.len())
                .field("has_more", has_more)
                .finish(),
            InternalEvent::PublishMessageResult {
                peer,
                message_id,
                ok,
                error,
                ..
            } => f
                .debug_struct("PublishMessageResult")
                .field("peer", &peer.to_hex())
                .field("message_id", message_id)
                .field("ok", ok)
                .field("error", error)
                .finish_non_exhaustive(),
            InternalEvent::Toast(msg) => f.debug_tuple("Toast").field(msg).finish(),
        }
    }
}
