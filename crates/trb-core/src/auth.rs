//! Per-account authorization state machine driven by platform push events.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::client::types::{
    formatted_user_name, AuthPhase, ClientRequest, ClientResponse,
};
use crate::config::Config;
use crate::control::ControlBot;
use crate::domain::{AuthState, ChatId};
use crate::expiry::SecretVault;
use crate::ports::Store;
use crate::registry::SessionRegistry;

const CODE_PROMPT: &str = "Please enter confirm code + any random character, \
if you will not add random character to the end of the code, the platform \
automatically will expire this auth code.";
const PASSWORD_PROMPT: &str = "Please enter password";

/// Cap on concurrent code/password waits; a stuck login occupies one slot
/// for at most the wait timeout.
const WAIT_SLOTS: usize = 32;

#[derive(Clone, Copy, Debug)]
enum SecretKind {
    Code,
    Password,
}

impl SecretKind {
    fn action(&self) -> &'static str {
        match self {
            SecretKind::Code => "auth_code",
            SecretKind::Password => "auth_password",
        }
    }

    fn name(&self) -> &'static str {
        match self {
            SecretKind::Code => "code",
            SecretKind::Password => "password",
        }
    }

    fn prompt(&self) -> &'static str {
        match self {
            SecretKind::Code => CODE_PROMPT,
            SecretKind::Password => PASSWORD_PROMPT,
        }
    }
}

pub struct AuthOrchestrator {
    cfg: Arc<Config>,
    store: Arc<dyn Store>,
    registry: Arc<SessionRegistry>,
    codes: Arc<SecretVault>,
    passwords: Arc<SecretVault>,
    control: ControlBot,
    wait_slots: Arc<Semaphore>,
}

impl AuthOrchestrator {
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
            wait_slots: Arc::new(Semaphore::new(WAIT_SLOTS)),
        }
    }

    pub async fn on_auth_state(&self, phone: &str, phase: AuthPhase) {
        match phase {
            AuthPhase::WaitParameters => {
                info!(phone, "set client parameters");
                self.submit_for(phone, ClientRequest::SetParameters(
                    self.cfg.client_parameters(phone),
                ))
                .await;
            }
            AuthPhase::WaitEncryptionKey => {
                info!(phone, "check database encryption key");
                self.submit_for(phone, ClientRequest::CheckEncryptionKey).await;
            }
            AuthPhase::WaitPhoneNumber => {
                info!(phone, "send phone for auth");
                self.submit_for(
                    phone,
                    ClientRequest::SubmitPhoneNumber {
                        phone: phone.to_string(),
                    },
                )
                .await;
            }
            AuthPhase::WaitCode => self.await_secret(phone, SecretKind::Code).await,
            AuthPhase::WaitPassword => self.await_secret(phone, SecretKind::Password).await,
            AuthPhase::Ready => self.on_ready(phone).await,
            AuthPhase::LoggingOut => info!(phone, "logging out"),
            AuthPhase::Closing => info!(phone, "closing"),
            AuthPhase::Closed => self.on_closed(phone).await,
            AuthPhase::Other(state) => warn!(phone, %state, "unsupported authorization state"),
        }
    }

    async fn submit_for(&self, phone: &str, req: ClientRequest) {
        let Some(handle) = self.registry.get(phone).await else {
            error!(phone, "no open session for auth call");
            return;
        };
        if let Err(e) = handle.submit(req).await {
            error!(phone, error = %e, "auth call failed");
            if let Some(chat_id) = self.controlling_chat(phone).await {
                let _ = self.control.reply(chat_id, &e.to_string()).await;
            }
        }
    }

    /// Mark the session as waiting, prompt the controlling chat, then watch
    /// the secret vault on a bounded slot for up to the configured timeout.
    ///
    /// A persistence failure is logged but does not stop the wait: losing
    /// the flag must not block authentication completing.
    async fn await_secret(&self, phone: &str, kind: SecretKind) {
        let session = match self.store.session_by_phone(phone).await {
            Ok(Some(mut session)) => {
                session.auth_state = AuthState::ConfirmAuth;
                session.current_action = kind.action().to_string();
                if let Err(e) = self.store.save_session(&session).await {
                    error!(phone, error = %e, "cannot persist session");
                }
                Some(session)
            }
            Ok(None) => {
                debug!(phone, "no session row for account");
                None
            }
            Err(e) => {
                error!(phone, error = %e, "session lookup failed");
                None
            }
        };

        if let Some(session) = &session {
            if let Err(e) = self.control.reply(session.chat_id, kind.prompt()).await {
                error!(phone, error = %e, "cannot prompt for secret");
            }
        }

        debug!(phone, secret = kind.name(), "waiting to confirm auth");
        let vault = match kind {
            SecretKind::Code => self.codes.clone(),
            SecretKind::Password => self.passwords.clone(),
        };
        let registry = self.registry.clone();
        let control = self.control.clone();
        let slots = self.wait_slots.clone();
        let timeout = self.cfg.auth_wait_timeout;
        let chat_id = session.map(|s| s.chat_id);
        let phone = phone.to_string();
        tokio::spawn(async move {
            let Ok(_permit) = slots.acquire_owned().await else {
                return;
            };
            let Some(secret) = vault.wait(&phone, timeout).await else {
                debug!(%phone, secret = kind.name(), "nothing received in time, give up");
                return;
            };
            let Some(handle) = registry.get(&phone).await else {
                error!(%phone, "session handle vanished during auth wait");
                return;
            };
            let req = match kind {
                SecretKind::Code => ClientRequest::SubmitCode { code: secret },
                SecretKind::Password => ClientRequest::SubmitPassword { password: secret },
            };
            info!(%phone, secret = kind.name(), "submitting for auth");
            if let Err(e) = handle.submit(req).await {
                error!(%phone, error = %e, "secret check failed");
                if let Some(chat_id) = chat_id {
                    let _ = control.reply(chat_id, &e.to_string()).await;
                }
            }
        });
    }

    async fn on_ready(&self, phone: &str) {
        info!(phone, "authorised");
        let Some(handle) = self.registry.get(phone).await else {
            error!(phone, "no open session after authorization");
            return;
        };

        let (client_id, username) = match handle.submit(ClientRequest::GetMe).await {
            Ok(ClientResponse::User {
                user_id,
                username,
                first_name,
                last_name,
            }) => (user_id, formatted_user_name(&username, &first_name, &last_name)),
            Ok(other) => {
                debug!(?other, "unexpected identity lookup result");
                return;
            }
            Err(e) => {
                error!(phone, error = %e, "identity lookup failed");
                return;
            }
        };
        debug!(phone, client_id = client_id.0, "authorized client id");

        match self.store.session_by_client(client_id).await {
            Ok(Some(mut session)) => {
                session.phone = phone.to_string();
                session.auth_state = AuthState::Authorized;
                session.current_action.clear();
                session.first_param.clear();
                if let Err(e) = self.store.save_session(&session).await {
                    info!(phone, error = %e, "cannot save session");
                }
                if let Err(e) = self.store.update_user_name(phone, &username).await {
                    error!(phone, error = %e, "cannot stamp user name");
                }
            }
            Ok(None) => debug!(phone, "no session row for authorized client"),
            Err(e) => info!(phone, error = %e, "cannot save session"),
        }
    }

    async fn on_closed(&self, phone: &str) {
        info!(phone, "closed");
        if let Some(handle) = self.registry.evict(phone).await {
            handle.close();
        }
        match self.store.session_by_phone(phone).await {
            Ok(Some(mut session)) => {
                session.auth_state = AuthState::Login;
                session.current_action.clear();
                session.first_param.clear();
                if let Err(e) = self.store.save_session(&session).await {
                    error!(phone, error = %e, "cannot revert session");
                }
            }
            Ok(None) => {}
            Err(e) => error!(phone, error = %e, "session lookup failed"),
        }
    }

    async fn controlling_chat(&self, phone: &str) -> Option<ChatId> {
        self.store
            .session_by_phone(phone)
            .await
            .ok()
            .flatten()
            .map(|s| s.chat_id)
    }
}
