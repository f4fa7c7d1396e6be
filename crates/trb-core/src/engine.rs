//! Conversation/command state machine for the administrative chat
//! interface.
//!
//! Dispatch order: the fixed command vocabulary first, then free-text input
//! by the session's current wizard action. Keyboards are rendered from live
//! catalog queries at prompt time, so the choice set is always current.

use std::sync::Arc;

use tracing::{debug, error};

use crate::client::types::{
    ClientRequest, ClientResponse, ForwardOrigin, InboundMessage, Keyboard, KeyboardButton,
    MessageContent,
};
use crate::config::Config;
use crate::control::ControlBot;
use crate::domain::{AuthState, ChatId, Session};
use crate::expiry::SecretVault;
use crate::ports::Store;
use crate::registry::SessionRegistry;
use crate::{Error, Result};

const UNKNOWN_HINT: &str = "Use /list /create or /delete command";
const GENERIC_FAILURE: &str = "Ups, error";

pub struct ConversationEngine {
    cfg: Arc<Config>,
    store: Arc<dyn Store>,
    registry: Arc<SessionRegistry>,
    codes: Arc<SecretVault>,
    passwords: Arc<SecretVault>,
    control: ControlBot,
}

impl ConversationEngine {
    pub fn new(
        cfg: Arc<Config>,
        store: Arc<dyn Store>,
        registry: Arc<SessionRegistry>,
        codes: Arc<SecretVault>,
        passwords: Arc<SecretVault>,
        control: ControlBot,
    ) -> Self {
        Self {
            cfg,
            store,
            registry,
            codes,
            passwords,
            control,
        }
    }

    /// Entry point for every non-bot message in a controlling chat.
    pub async fn on_message(&self, message: InboundMessage) {
        let Some(session) = self.load_session(&message).await else {
            return;
        };

        let outcome = match &message.content {
            MessageContent::Text { text } => {
                self.on_text(session, &message, text.text.clone()).await
            }
            MessageContent::Contact { phone } => self.on_contact(session, phone).await,
            other => {
                debug!(kind = other.kind(), "ignoring message kind");
                Ok(())
            }
        };

        if let Err(e) = outcome {
            error!(error = %e, "command handling failed");
            let _ = self.control.reply(message.chat_id, GENERIC_FAILURE).await;
        }
    }

    /// Fetch the Session row for the sender, creating one in LOGIN state on
    /// first contact.
    async fn load_session(&self, message: &InboundMessage) -> Option<Session> {
        match self.store.session_by_client(message.sender_id).await {
            Ok(Some(session)) => Some(session),
            Ok(None) => {
                let session = Session::new(message.chat_id, message.sender_id);
                if let Err(e) = self.store.save_session(&session).await {
                    error!(error = %e, "cannot create session");
                    let _ = self.control.reply(message.chat_id, GENERIC_FAILURE).await;
                    return None;
                }
                Some(session)
            }
            Err(e) => {
                error!(error = %e, "session lookup failed");
                let _ = self.control.reply(message.chat_id, GENERIC_FAILURE).await;
                None
            }
        }
    }

    async fn on_text(
        &self,
        session: Session,
        message: &InboundMessage,
        text: String,
    ) -> Result<()> {
        let command = message.command.as_deref().unwrap_or("");
        debug!(command, "dispatching");
        match command {
            "/start" => self.cmd_start(session).await,
            "/login" => self.cmd_login(session).await,
            "/list" => self.cmd_list(session).await,
            "/create" => self.cmd_create(session).await,
            "/delete" => self.cmd_delete(session).await,
            "/create_destination" => self.cmd_create_destination(session).await,
            "/delete_destination" => self.cmd_delete_destination(session).await,
            "/list_destination" => self.cmd_list_destination(session).await,
            "/list_user" => self.cmd_list_user(session).await,
            "/create_user" => self.cmd_create_user(session).await,
            "/delete_user" => self.cmd_delete_user(session).await,
            "/list_permission" => self.cmd_list_permission(session).await,
            "/create_permission" => self.cmd_create_permission(session).await,
            "/delete_permission" => self.cmd_delete_permission(session).await,
            _ => self.on_action(session, message, text).await,
        }
    }

    async fn on_action(
        &self,
        session: Session,
        message: &InboundMessage,
        text: String,
    ) -> Result<()> {
        let owner = self.is_owner(&session);
        let action = session.current_action.clone();
        match action.as_str() {
            "login" => self.act_login(session, &text).await,
            "auth_code" => {
                debug!("handle auth_code");
                // First 5 characters only; users append a junk character so
                // the platform does not expire the code on sight.
                let code: String = text.chars().take(5).collect();
                self.codes.put(&session.phone, code, self.cfg.secret_ttl);
                Ok(())
            }
            "auth_password" => {
                debug!("handle auth_password");
                self.passwords
                    .put(&session.phone, text, self.cfg.secret_ttl);
                Ok(())
            }
            "create_source" => self.act_create_source(session, message).await,
            "create_destination" => self.act_create_destination(session, &text).await,
            "delete_link" => self.act_delete_link(session, &text).await,
            "create_destination_source" if owner => {
                self.act_create_destination_source(session, message).await
            }
            "delete_destination_source" if owner => {
                self.act_delete_destination_source(session, &text).await
            }
            "create_user" if owner => self.act_create_user(session, &text).await,
            "delete_user" if owner => self.act_delete_user(session, &text).await,
            "list_permission" if owner => self.act_list_permission(session, &text).await,
            "select_create_permission" if owner => {
                self.act_select_create_permission(session, &text).await
            }
            "select_delete_permission" if owner => {
                self.act_select_delete_permission(session, &text).await
            }
            "create_permission" if owner => self.act_create_permission(session, &text).await,
            "delete_permission" if owner => self.act_delete_permission(session, &text).await,
            _ => {
                debug!(%text, "unrecognized command");
                self.control.reply(session.chat_id, UNKNOWN_HINT).await
            }
        }
    }

    /// A shared contact card supplies the phone during the login action.
    async fn on_contact(&self, session: Session, phone: &str) -> Result<()> {
        if session.current_action == "login" {
            let phone = phone.replace('+', "");
            self.act_login(session, &phone).await
        } else {
            Ok(())
        }
    }

    fn is_owner(&self, session: &Session) -> bool {
        session.phone == self.cfg.bot_owner
    }

    fn authorized(&self, session: &Session) -> bool {
        session.auth_state == AuthState::Authorized
    }

    fn admin(&self, session: &Session) -> bool {
        self.authorized(session) && self.is_owner(session)
    }

    // ------------------------------------------------------------ commands

    async fn cmd_start(&self, mut session: Session) -> Result<()> {
        session.auth_state = AuthState::Login;
        session.current_action.clear();
        session.phone.clear();
        self.store.save_session(&session).await
    }

    async fn cmd_login(&self, mut session: Session) -> Result<()> {
        session.auth_state = AuthState::Login;
        session.current_action = "login".to_string();
        self.store.save_session(&session).await?;
        let keyboard = Keyboard {
            rows: vec![vec![KeyboardButton::request_phone("Phone")]],
        };
        self.control
            .prompt_with_keyboard(session.chat_id, "Please input phone number", keyboard)
            .await
    }

    async fn cmd_list(&self, session: Session) -> Result<()> {
        if !self.authorized(&session) {
            return self
                .control
                .reply(session.chat_id, "Not authorized to get list")
                .await;
        }
        let own_links = self.store.own_links(&session.phone).await?;
        if own_links.is_empty() {
            return self.control.reply(session.chat_id, "No chats, use /create").await;
        }
        let allowed = self.store.allowed_destinations(&session.phone).await?;
        let mut lines = String::new();
        for link in &own_links {
            lines.push_str(&link.to_string());
            if !allowed.iter().any(|d| d.chat_id == link.chat_id_to) {
                lines.push_str(" (denied)");
            }
            lines.push('\n');
        }
        self.control.reply(session.chat_id, &lines).await
    }

    async fn cmd_create(&self, mut session: Session) -> Result<()> {
        if !self.authorized(&session) {
            return self
                .control
                .reply(session.chat_id, "Not authorized to create")
                .await;
        }
        self.control
            .reply(session.chat_id, "Forward message from source channel")
            .await?;
        session.current_action = "create_source".to_string();
        self.store.save_session(&session).await
    }

    async fn cmd_delete(&self, mut session: Session) -> Result<()> {
        if !self.authorized(&session) {
            return self
                .control
                .reply(session.chat_id, "Not authorized to delete")
                .await;
        }
        session.current_action = "delete_link".to_string();
        self.store.save_session(&session).await?;
        let own_links = self.store.own_links(&session.phone).await?;
        let keyboard = Keyboard::single_column(own_links.iter().map(|l| l.name.clone()));
        self.control
            .prompt_with_keyboard(session.chat_id, "Select what to delete", keyboard)
            .await
    }

    async fn cmd_create_destination(&self, mut session: Session) -> Result<()> {
        if !self.admin(&session) {
            return self
                .control
                .reply(session.chat_id, "Not authorized to create destination")
                .await;
        }
        self.control
            .reply(session.chat_id, "Forward message from source channel")
            .await?;
        session.current_action = "create_destination_source".to_string();
        self.store.save_session(&session).await
    }

    async fn cmd_delete_destination(&self, mut session: Session) -> Result<()> {
        if !self.admin(&session) {
            return self
                .control
                .reply(session.chat_id, "Not authorized to delete destination")
                .await;
        }
        session.current_action = "delete_destination_source".to_string();
        self.store.save_session(&session).await?;
        let destinations = self.store.destinations().await?;
        let keyboard = Keyboard::single_column(destinations.iter().map(|d| d.name.clone()));
        self.control
            .prompt_with_keyboard(session.chat_id, "Select what to delete", keyboard)
            .await
    }

    async fn cmd_list_destination(&self, session: Session) -> Result<()> {
        if !self.admin(&session) {
            return self
                .control
                .reply(session.chat_id, "Not authorized list destination")
                .await;
        }
        let destinations = self.store.destinations().await?;
        if destinations.is_empty() {
            return self
                .control
                .reply(session.chat_id, "No destinations, use /create_destination")
                .await;
        }
        let listing = destinations
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        self.control.reply(session.chat_id, &listing).await
    }

    async fn cmd_list_user(&self, session: Session) -> Result<()> {
        if !self.admin(&session) {
            return self
                .control
                .reply(session.chat_id, "Not authorized to list user")
                .await;
        }
        let users = self.store.users().await?;
        if users.is_empty() {
            return self
                .control
                .reply(session.chat_id, "No bot users, use /create_user")
                .await;
        }
        let listing = users
            .iter()
            .map(|u| u.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        self.control.reply(session.chat_id, &listing).await
    }

    async fn cmd_create_user(&self, mut session: Session) -> Result<()> {
        if !self.admin(&session) {
            return self
                .control
                .reply(session.chat_id, "Not authorized to create user")
                .await;
        }
        self.control
            .reply(session.chat_id, "Input user phone to create")
            .await?;
        session.current_action = "create_user".to_string();
        self.store.save_session(&session).await
    }

    async fn cmd_delete_user(&self, mut session: Session) -> Result<()> {
        if !self.admin(&session) {
            return self
                .control
                .reply(session.chat_id, "Not authorized to delete user")
                .await;
        }
        self.control
            .reply(session.chat_id, "Input user phone to delete")
            .await?;
        session.current_action = "delete_user".to_string();
        self.store.save_session(&session).await
    }

    async fn cmd_list_permission(&self, session: Session) -> Result<()> {
        self.select_user_for(
            session,
            "list_permission",
            "Select user to show allowed destination to him",
            "Not authorized to list permissions",
        )
        .await
    }

    async fn cmd_create_permission(&self, session: Session) -> Result<()> {
        self.select_user_for(
            session,
            "select_create_permission",
            "Select user to allow him destination",
            "Not authorized to create permissions",
        )
        .await
    }

    async fn cmd_delete_permission(&self, session: Session) -> Result<()> {
        self.select_user_for(
            session,
            "select_delete_permission",
            "Select user to revoke permission to destination",
            "Not authorized to delete permissions",
        )
        .await
    }

    /// Shared first step of the permission wizards: pick a user from a
    /// keyboard of all allowed users.
    async fn select_user_for(
        &self,
        mut session: Session,
        action: &str,
        prompt: &str,
        denial: &str,
    ) -> Result<()> {
        if !self.admin(&session) {
            return self.control.reply(session.chat_id, denial).await;
        }
        let users = self.store.users().await?;
        if users.is_empty() {
            return self
                .control
                .reply(session.chat_id, "No users, try to add some with /create_user")
                .await;
        }
        session.current_action = action.to_string();
        self.store.save_session(&session).await?;
        let keyboard = Keyboard::single_column(users.iter().map(|u| u.to_string()));
        self.control
            .prompt_with_keyboard(session.chat_id, prompt, keyboard)
            .await
    }

    // ------------------------------------------------------------- actions

    async fn act_login(&self, mut session: Session, phone: &str) -> Result<()> {
        debug!(phone, "handle login phone");
        if !self.store.is_phone_allowed(phone).await? {
            debug!("phone not allowed");
            return self
                .control
                .reply(
                    session.chat_id,
                    &format!(
                        "This phone number is not allowed, please contact admin {}",
                        self.cfg.bot_owner
                    ),
                )
                .await;
        }
        session.phone = phone.to_string();
        session.auth_state = AuthState::ConfirmAuth;
        session.current_action.clear();
        self.store.save_session(&session).await?;
        if let Err(e) = self.registry.open_account(phone).await {
            error!(phone, error = %e, "cannot open account");
        }
        Ok(())
    }

    async fn act_create_source(&self, mut session: Session, message: &InboundMessage) -> Result<()> {
        debug!("handle create_source");
        if !self.authorized(&session) {
            return self
                .control
                .reply(session.chat_id, "not authorized to create link")
                .await;
        }
        let Some(ForwardOrigin::Channel { chat_id }) =
            message.forward.as_ref().map(|f| f.origin.clone())
        else {
            return self
                .control
                .reply(session.chat_id, "forward message from source channel")
                .await;
        };

        let title = self.channel_title(&session, chat_id).await?;
        session.first_param = format!("{}_{}", chat_id.0, title);
        session.current_action = "create_destination".to_string();
        self.store.save_session(&session).await?;

        let allowed = self.store.allowed_destinations(&session.phone).await?;
        let keyboard = Keyboard::single_column(allowed.iter().map(|d| d.name.clone()));
        self.control
            .prompt_with_keyboard(
                session.chat_id,
                &format!("source channel is : {title}\nSelect destination channel"),
                keyboard,
            )
            .await
    }

    async fn act_create_destination(&self, mut session: Session, text: &str) -> Result<()> {
        debug!("handle create_destination");
        if !self.authorized(&session) {
            return self
                .control
                .reply(session.chat_id, "not authorized to create link")
                .await;
        }
        let Some((source, title)) = session.first_param.split_once('_') else {
            return Err(Error::External(format!(
                "malformed wizard state: {:?}",
                session.first_param
            )));
        };
        let source: i64 = source
            .parse()
            .map_err(|_| Error::External(format!("malformed wizard state: {source:?}")))?;
        let title = title.to_string();

        let Some(destination) = self.store.destination_by_name(text).await? else {
            return self
                .control
                .reply(session.chat_id, "Destination was not found")
                .await;
        };

        session.current_action.clear();
        session.first_param.clear();
        self.store.save_session(&session).await?;
        self.store
            .create_link(&session.phone, ChatId(source), &title, &destination)
            .await?;
        self.control
            .reply(
                session.chat_id,
                &format!("New link created : {title} -> {}", destination.name),
            )
            .await
    }

    async fn act_delete_link(&self, session: Session, text: &str) -> Result<()> {
        debug!("handle delete_link");
        if !self.authorized(&session) {
            return self
                .control
                .reply(session.chat_id, "not authorized to delete link")
                .await;
        }
        let rows = self.store.delete_link_by_name(&session.phone, text).await?;
        if rows >= 1 {
            self.control.reply(session.chat_id, "Link deleted").await
        } else {
            self.control.reply(session.chat_id, "Link not found").await
        }
    }

    async fn act_create_destination_source(
        &self,
        mut session: Session,
        message: &InboundMessage,
    ) -> Result<()> {
        debug!("handle create_destination_source");
        if !self.admin(&session) {
            return self
                .control
                .reply(session.chat_id, "not authorized to create destination channel")
                .await;
        }
        let Some(ForwardOrigin::Channel { chat_id }) =
            message.forward.as_ref().map(|f| f.origin.clone())
        else {
            return self
                .control
                .reply(session.chat_id, "forward message from channel")
                .await;
        };

        session.current_action.clear();
        self.store.save_session(&session).await?;

        let title = match self.channel_title(&session, chat_id).await {
            Ok(title) => title,
            Err(Error::Platform { message, .. }) => {
                return self
                    .control
                    .reply(session.chat_id, &format!("Error :{message}"))
                    .await;
            }
            Err(e) => return Err(e),
        };
        self.store.create_destination(chat_id, &title).await?;
        self.control
            .reply(session.chat_id, &format!("New destination created : {title}"))
            .await
    }

    async fn act_delete_destination_source(
        &self,
        mut session: Session,
        text: &str,
    ) -> Result<()> {
        debug!("handle delete_destination_source");
        session.current_action.clear();
        self.store.save_session(&session).await?;
        let rows = self.store.delete_destination_by_name(text).await?;
        if rows >= 1 {
            self.control
                .reply(session.chat_id, &format!("Deleted destination channel : {text}"))
                .await
        } else {
            self.control.reply(session.chat_id, "Not found").await
        }
    }

    async fn act_create_user(&self, mut session: Session, text: &str) -> Result<()> {
        debug!("handle create_user");
        session.current_action.clear();
        self.store.save_session(&session).await?;
        match self.store.create_user(text).await {
            Ok(()) => self.control.reply(session.chat_id, "User created").await,
            Err(_) => self.control.reply(session.chat_id, "User not created").await,
        }
    }

    async fn act_delete_user(&self, mut session: Session, text: &str) -> Result<()> {
        debug!("handle delete_user");
        session.current_action.clear();
        self.store.save_session(&session).await?;
        let rows = self.store.delete_user(text).await?;
        if rows == 1 {
            self.control.reply(session.chat_id, "Deleted").await?;
            // Also log the account itself out, if it has a live session.
            if let Some(handle) = self.registry.get(text).await {
                if let Err(e) = handle.submit(ClientRequest::LogOut).await {
                    error!(phone = text, error = %e, "logout failed");
                }
            }
            Ok(())
        } else {
            self.control.reply(session.chat_id, "Not found").await
        }
    }

    async fn act_list_permission(&self, mut session: Session, text: &str) -> Result<()> {
        debug!("handle list_permission");
        session.current_action.clear();
        self.store.save_session(&session).await?;
        let phone = first_word(text);
        match self.store.allowed_destinations(phone).await {
            Ok(allowed) if allowed.is_empty() => {
                self.control
                    .reply(session.chat_id, &format!("No allowed destination for {phone}"))
                    .await
            }
            Ok(allowed) => {
                let listing = allowed
                    .iter()
                    .map(|d| d.to_string())
                    .collect::<Vec<_>>()
                    .join("\n");
                self.control.reply(session.chat_id, &listing).await
            }
            Err(e) => {
                error!(error = %e, "permission lookup failed");
                self.control.reply(session.chat_id, GENERIC_FAILURE).await
            }
        }
    }

    async fn act_select_create_permission(
        &self,
        mut session: Session,
        text: &str,
    ) -> Result<()> {
        debug!("handle select_create_permission");
        let destinations = self.store.destinations().await?;
        if destinations.is_empty() {
            session.current_action.clear();
            self.store.save_session(&session).await?;
            return self
                .control
                .reply(
                    session.chat_id,
                    "No destinations, try to add some with /create_destination",
                )
                .await;
        }
        session.first_param = first_word(text).to_string();
        session.current_action = "create_permission".to_string();
        self.store.save_session(&session).await?;
        let keyboard = Keyboard::single_column(destinations.iter().map(|d| d.name.clone()));
        self.control
            .prompt_with_keyboard(
                session.chat_id,
                &format!("Select destination for {text}"),
                keyboard,
            )
            .await
    }

    async fn act_create_permission(&self, mut session: Session, text: &str) -> Result<()> {
        debug!("handle create_permission");
        match self.store.allow_destination(text, &session.first_param).await {
            Ok(granted) => {
                session.first_param.clear();
                session.current_action.clear();
                self.store.save_session(&session).await?;
                let reply = if granted {
                    "Permission granted."
                } else {
                    "Destination not found."
                };
                self.control.reply(session.chat_id, reply).await
            }
            Err(e) => {
                error!(error = %e, "cannot grant permission");
                self.control
                    .reply(
                        session.chat_id,
                        "Ups, error. Maybe you trying to add same permission twice?",
                    )
                    .await
            }
        }
    }

    async fn act_select_delete_permission(
        &self,
        mut session: Session,
        text: &str,
    ) -> Result<()> {
        debug!("handle select_delete_permission");
        let phone = first_word(text);
        let allowed = self.store.allowed_destinations(phone).await?;
        if allowed.is_empty() {
            session.current_action.clear();
            self.store.save_session(&session).await?;
            return self
                .control
                .reply(
                    session.chat_id,
                    &format!("No allowed destination for {text}, nothing to do"),
                )
                .await;
        }
        session.first_param = phone.to_string();
        session.current_action = "delete_permission".to_string();
        self.store.save_session(&session).await?;
        let keyboard = Keyboard::single_column(allowed.iter().map(|d| d.name.clone()));
        self.control
            .prompt_with_keyboard(
                session.chat_id,
                &format!("Select destination for {text} to removing"),
                keyboard,
            )
            .await
    }

    async fn act_delete_permission(&self, mut session: Session, text: &str) -> Result<()> {
        debug!("handle delete_permission");
        match self.store.deny_destination(text, &session.first_param).await {
            Ok(revoked) => {
                session.first_param.clear();
                session.current_action.clear();
                self.store.save_session(&session).await?;
                let reply = if revoked {
                    "Permission revoked."
                } else {
                    "Permission not found, nothing to do."
                };
                self.control.reply(session.chat_id, reply).await
            }
            Err(e) => {
                error!(error = %e, "cannot revoke permission");
                self.control
                    .reply(session.chat_id, "Ups, error. Check log files for details.")
                    .await
            }
        }
    }

    /// Resolve a channel title through the session's own account handle.
    async fn channel_title(&self, session: &Session, chat_id: ChatId) -> Result<String> {
        let handle = self
            .registry
            .get(&session.phone)
            .await
            .ok_or_else(|| Error::NoSession(session.phone.clone()))?;
        match handle.submit(ClientRequest::GetChat { chat_id }).await? {
            ClientResponse::Chat { title, .. } => Ok(title),
            other => Err(Error::External(format!(
                "unexpected chat lookup result: {other:?}"
            ))),
        }
    }
}

fn first_word(text: &str) -> &str {
    text.split_whitespace().next().unwrap_or("")
}
