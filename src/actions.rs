#[derive(Debug, Clone)]
pub enum AppAction {
    // Auth
    CreateAccount,
    Login {
        nsec: String,
    },
    Logout,

    // Chat
    SendMessage {
        peer: String,
        content: String,
    },
    RetryMessage {
        peer: String,
        message_id: String,
    },
    OpenChat {
        peer: String,
    },
    CloseChat,
    MarkChatRead {
        peer: String,
    },
    MarkAllRead,
    DeleteMessage {
        peer: String,
        message_id: String,
    },
    HideMessage {
        peer: String,
        message_id: String,
    },
    UnhideMessage {
        peer: String,
        message_id: String,
    },

    // Sync
    Refresh,
    LoadOlderMessages {
        limit: u32,
    },

    // UI
    ClearToast,

    // Lifecycle
    Foregrounded,
}

impl AppAction {
    /// Log-safe action tag (never includes secrets like `nsec`).
    pub fn tag(&self) -> &'static str {
        match self {
            // Auth
            AppAction::CreateAccount => "CreateAccount",
            AppAction::Login { .. } => "Login",
            AppAction::Logout => "Logout",

            // Chat
            AppAction::SendMessage { .. } => "SendMessage",
            AppAction::RetryMessage { .. } => "RetryMessage",
            AppAction::OpenChat { .. } => "OpenChat",
            AppAction::CloseChat => "CloseChat",
            AppAction::MarkChatRead { .. } => "MarkChatRead",
            AppAction::MarkAllRead => "MarkAllRead",
            AppAction::DeleteMessage { .. } => "DeleteMessage",
            AppAction::HideMessage { .. } => "HideMessage",
            AppAction::UnhideMessage { .. } => "UnhideMessage",

            // Sync
            AppAction::Refresh => "Refresh",
            AppAction::LoadOlderMessages { .. } => "LoadOlderMessages",

            // UI
            AppAction::ClearToast => "ClearToast",

            // Lifecycle
            AppAction::Foregrounded => "Foregrounded",
        }
    }
}
