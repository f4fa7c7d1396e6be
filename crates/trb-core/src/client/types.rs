use serde::{Deserialize, Serialize};

use crate::domain::{ChatId, MessageId, UserId};

/// Rich-text formatting span. Offsets are in characters of the surrounding
/// text; the `kind` tag is passed through to the platform untouched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEntity {
    pub offset: usize,
    pub length: usize,
    pub kind: String,
}

/// Text plus its formatting spans.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedText {
    pub text: String,
    pub entities: Vec<TextEntity>,
}

impl FormattedText {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            entities: Vec::new(),
        }
    }
}

/// Message payload variants the relay understands. Anything else arrives as
/// `Unsupported` and is dropped by the pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageContent {
    Text {
        text: FormattedText,
    },
    Photo {
        file_id: String,
        caption: FormattedText,
    },
    Animation {
        file_id: String,
        duration: i32,
        width: i32,
        height: i32,
        caption: FormattedText,
    },
    Video {
        file_id: String,
        duration: i32,
        width: i32,
        height: i32,
        supports_streaming: bool,
        caption: FormattedText,
    },
    Document {
        file_id: String,
        caption: FormattedText,
    },
    /// A shared contact card; only used by the login flow.
    Contact {
        phone: String,
    },
    Unsupported {
        kind: String,
    },
}

impl MessageContent {
    pub fn kind(&self) -> &str {
        match self {
            MessageContent::Text { .. } => "text",
            MessageContent::Photo { .. } => "photo",
            MessageContent::Animation { .. } => "animation",
            MessageContent::Video { .. } => "video",
            MessageContent::Document { .. } => "document",
            MessageContent::Contact { .. } => "contact",
            MessageContent::Unsupported { kind } => kind,
        }
    }
}

/// Where a forwarded message originally came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardOrigin {
    Channel { chat_id: ChatId },
    User { user_id: UserId },
    Hidden,
}

/// Forward metadata carried on an inbound message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardInfo {
    pub origin: ForwardOrigin,
    /// Date of the original post, not of the forward.
    pub date: i64,
}

/// One message pushed by the platform.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub date: i64,
    pub forward: Option<ForwardInfo>,
    pub content: MessageContent,
    /// Entity spans the platform tags onto the text; used to pick out bot
    /// commands.
    pub command: Option<String>,
}

/// Authorization phases pushed by the platform per account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthPhase {
    WaitParameters,
    WaitEncryptionKey,
    WaitPhoneNumber,
    WaitCode,
    WaitPassword,
    Ready,
    LoggingOut,
    Closing,
    Closed,
    Other(String),
}

/// Push-update stream events, tagged by the account they arrived for at the
/// registry layer.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    AuthStateChanged(AuthPhase),
    NewMessage(InboundMessage),
}

/// One button of a reply keyboard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyboardButton {
    pub label: String,
    pub request_phone: bool,
}

impl KeyboardButton {
    pub fn text(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            request_phone: false,
        }
    }

    pub fn request_phone(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            request_phone: true,
        }
    }
}

/// One-time reply keyboard shown under a prompt.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyboard {
    pub rows: Vec<Vec<KeyboardButton>>,
}

impl Keyboard {
    /// Single-column keyboard, one text button per choice.
    pub fn single_column<I, S>(choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rows: choices
                .into_iter()
                .map(|c| vec![KeyboardButton::text(c)])
                .collect(),
        }
    }
}

/// Fixed client parameters submitted during `WaitParameters`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientParameters {
    pub database_directory: String,
    pub api_id: i32,
    pub api_hash: String,
    pub system_language_code: String,
    pub device_model: String,
    pub system_version: String,
    pub application_version: String,
}

/// Calls the core issues against one account handle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ClientRequest {
    SetParameters(ClientParameters),
    CheckEncryptionKey,
    SubmitPhoneNumber { phone: String },
    SubmitBotToken { token: String },
    SubmitCode { code: String },
    SubmitPassword { password: String },
    GetChat { chat_id: ChatId },
    GetUser { user_id: UserId },
    GetMe,
    SendMessage {
        chat_id: ChatId,
        content: MessageContent,
        keyboard: Option<Keyboard>,
    },
    AddProxy {
        host: String,
        port: u16,
        user: String,
        password: String,
    },
    LogOut,
}

/// Successful call results. Platform-reported failures surface as
/// [`crate::Error::Platform`] instead.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ClientResponse {
    Ok,
    Chat {
        chat_id: ChatId,
        title: String,
    },
    User {
        user_id: UserId,
        username: String,
        first_name: String,
        last_name: String,
    },
    Message {
        id: MessageId,
    },
}

/// `@username` when set, otherwise "first last", trimmed.
pub fn formatted_user_name(username: &str, first_name: &str, last_name: &str) -> String {
    if username.is_empty() {
        format!("{first_name} {last_name}").trim().to_string()
    } else {
        format!("@{username}")
    }
}
