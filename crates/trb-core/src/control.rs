//! The control-bot account: authenticates with the bot token and carries
//! the whole admin/user conversation surface.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::client::port::{ClientApi, ClientFactory};
use crate::client::types::{
    AuthPhase, ClientEvent, ClientRequest, ClientResponse, FormattedText, InboundMessage,
    Keyboard, MessageContent,
};
use crate::config::Config;
use crate::domain::ChatId;
use crate::engine::ConversationEngine;
use crate::{Error, Result};

/// Storage key for the control-bot handle; not a phone number.
const BOT_KEY: &str = "BOT";

#[derive(Clone)]
pub struct ControlBot {
    inner: Arc<ControlInner>,
}

struct ControlInner {
    cfg: Arc<Config>,
    handle: RwLock<Option<Arc<dyn ClientApi>>>,
    engine: RwLock<Option<Arc<ConversationEngine>>>,
}

impl ControlBot {
    pub fn new(cfg: Arc<Config>) -> Self {
        Self {
            inner: Arc::new(ControlInner {
                cfg,
                handle: RwLock::new(None),
                engine: RwLock::new(None),
            }),
        }
    }

    /// Install the conversation engine; messages arriving before this are
    /// dropped.
    pub async fn set_engine(&self, engine: Arc<ConversationEngine>) {
        *self.inner.engine.write().await = Some(engine);
    }

    /// Open the bot handle and start consuming its push stream.
    pub async fn start(&self, factory: &Arc<dyn ClientFactory>) -> Result<()> {
        let (handle, mut events) = factory.open(BOT_KEY).await?;
        {
            let mut guard = self.inner.handle.write().await;
            if let Some(old) = guard.replace(handle.clone()) {
                old.close();
            }
        }

        if let Some(proxy) = &self.inner.cfg.proxy {
            let handle = handle.clone();
            let req = ClientRequest::AddProxy {
                host: proxy.host.clone(),
                port: proxy.port,
                user: proxy.user.clone(),
                password: proxy.password.clone(),
            };
            tokio::spawn(async move {
                if let Err(e) = handle.submit(req).await {
                    error!(error = %e, "set proxy failed for bot");
                }
            });
        }

        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ClientEvent::AuthStateChanged(phase) => this.on_auth_state(phase).await,
                    ClientEvent::NewMessage(message) => this.on_new_message(message).await,
                }
            }
            debug!("bot push stream closed");
        });

        Ok(())
    }

    async fn on_auth_state(&self, phase: AuthPhase) {
        let result = match phase {
            AuthPhase::WaitParameters => {
                info!("set client parameters for bot");
                self.submit(ClientRequest::SetParameters(
                    self.inner.cfg.client_parameters(BOT_KEY),
                ))
                .await
            }
            AuthPhase::WaitEncryptionKey => {
                info!("check database encryption key for bot");
                self.submit(ClientRequest::CheckEncryptionKey).await
            }
            AuthPhase::WaitPhoneNumber => {
                info!("send token for bot auth");
                self.submit(ClientRequest::SubmitBotToken {
                    token: self.inner.cfg.bot_token(),
                })
                .await
            }
            AuthPhase::Ready => {
                info!("authorised bot");
                return;
            }
            AuthPhase::LoggingOut => {
                info!("logging out bot");
                return;
            }
            AuthPhase::Closing => {
                info!("closing bot");
                return;
            }
            AuthPhase::Closed => {
                info!("closed bot");
                return;
            }
            AuthPhase::WaitCode | AuthPhase::WaitPassword => {
                // A bot token never needs these.
                warn!(?phase, "unexpected authorization state for bot");
                return;
            }
            AuthPhase::Other(state) => {
                warn!(%state, "unsupported authorization state for bot");
                return;
            }
        };
        if let Err(e) = result {
            error!(error = %e, "bot auth call failed");
        }
    }

    async fn on_new_message(&self, message: InboundMessage) {
        debug!("new message arrived for bot");
        if message.sender_id.0 == self.inner.cfg.bot_id {
            debug!("own message, skip");
            return;
        }
        let Some(engine) = self.inner.engine.read().await.clone() else {
            debug!("conversation engine not installed yet, dropping message");
            return;
        };
        engine.on_message(message).await;
    }

    /// Plain-text reply into a controlling chat.
    pub async fn reply(&self, chat_id: ChatId, text: &str) -> Result<()> {
        self.submit(ClientRequest::SendMessage {
            chat_id,
            content: MessageContent::Text {
                text: FormattedText::plain(text),
            },
            keyboard: None,
        })
        .await
        .map(|_| ())
    }

    /// Prompt with a one-time reply keyboard.
    pub async fn prompt_with_keyboard(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: Keyboard,
    ) -> Result<()> {
        self.submit(ClientRequest::SendMessage {
            chat_id,
            content: MessageContent::Text {
                text: FormattedText::plain(text),
            },
            keyboard: Some(keyboard),
        })
        .await
        .map(|_| ())
    }

    async fn submit(&self, req: ClientRequest) -> Result<ClientResponse> {
        let handle = self
            .inner
            .handle
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::NoSession(BOT_KEY.to_string()))?;
        handle.submit(req).await
    }
}
