use std::fmt;

use serde::{Deserialize, Serialize};

/// Platform chat id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub i64);

/// Platform message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub i64);

/// Platform user id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub i64);

/// Authorization state of a controlling-chat session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthState {
    Login,
    ConfirmAuth,
    Authorized,
}

impl AuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthState::Login => "LOGIN",
            AuthState::ConfirmAuth => "CONFIRM_AUTH",
            AuthState::Authorized => "AUTHORIZED",
        }
    }

    /// Unknown values map to `Login` so a corrupted row forces a fresh login
    /// instead of granting access.
    pub fn parse(s: &str) -> Self {
        match s {
            "AUTHORIZED" => AuthState::Authorized,
            "CONFIRM_AUTH" => AuthState::ConfirmAuth,
            _ => AuthState::Login,
        }
    }
}

/// One row of `user_session`: the wizard + login state of one controlling
/// chat (and, once logged in, one platform account).
#[derive(Clone, Debug)]
pub struct Session {
    pub phone: String,
    pub auth_state: AuthState,
    /// Wizard cursor; empty when idle.
    pub current_action: String,
    /// Scratch value threaded between wizard steps.
    pub first_param: String,
    /// Chat the control bot talks to for this session.
    pub chat_id: ChatId,
    /// Platform user id of the controlling user.
    pub client_id: UserId,
}

impl Session {
    pub fn new(chat_id: ChatId, client_id: UserId) -> Self {
        Self {
            phone: String::new(),
            auth_state: AuthState::Login,
            current_action: String::new(),
            first_param: String::new(),
            chat_id,
            client_id,
        }
    }
}

/// One row of `user_chat`: forward everything from `chat_id_from`, owned by
/// `owner`, to `chat_id_to`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayLink {
    pub owner: String,
    pub chat_id_from: ChatId,
    pub chat_id_to: ChatId,
    pub name: String,
}

impl RelayLink {
    /// The source-side title captured at link-creation time: everything
    /// before the `"->"` separator of the stored name.
    pub fn source_title(&self) -> &str {
        match self.name.find("->") {
            Some(idx) => self.name[..idx].trim_end(),
            None => self.name.as_str(),
        }
    }
}

impl fmt::Display for RelayLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Chat {{ {}, {} -> {}, owner={} }}",
            self.name, self.chat_id_from.0, self.chat_id_to.0, self.owner
        )
    }
}

/// One row of `possible_destination`: a chat users may forward into.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Destination {
    pub chat_id: ChatId,
    pub name: String,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chat {{ {}, {} }}", self.name, self.chat_id.0)
    }
}

/// One row of `user`: a phone allowed to authenticate through the bot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllowedUser {
    pub phone: String,
    pub username: String,
}

impl fmt::Display for AllowedUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.username.is_empty() {
            write!(f, "{}", self.phone)
        } else {
            write!(f, "{} {}", self.phone, self.username)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_state_round_trips() {
        for st in [AuthState::Login, AuthState::ConfirmAuth, AuthState::Authorized] {
            assert_eq!(AuthState::parse(st.as_str()), st);
        }
    }

    #[test]
    fn unknown_auth_state_falls_back_to_login() {
        assert_eq!(AuthState::parse("WEDGED"), AuthState::Login);
    }

    #[test]
    fn link_source_title_strips_destination() {
        let link = RelayLink {
            owner: "79001234567".to_string(),
            chat_id_from: ChatId(-100),
            chat_id_to: ChatId(-200),
            name: "Src -> Dst".to_string(),
        };
        assert_eq!(link.source_title(), "Src");
    }

    #[test]
    fn link_source_title_without_separator_is_whole_name() {
        let link = RelayLink {
            owner: "79001234567".to_string(),
            chat_id_from: ChatId(-100),
            chat_id_to: ChatId(-200),
            name: "Plain".to_string(),
        };
        assert_eq!(link.source_title(), "Plain");
    }
}
