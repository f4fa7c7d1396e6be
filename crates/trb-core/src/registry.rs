//! Identity-to-handle mapping for the open platform accounts.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::auth::AuthOrchestrator;
use crate::client::port::{ClientApi, ClientFactory};
use crate::client::types::{AuthPhase, ClientEvent, ClientRequest, InboundMessage};
use crate::config::ProxyConfig;
use crate::relay::RelayPipeline;
use crate::Result;

/// Consumer of the per-account push stream, split by event kind.
#[async_trait]
pub trait AccountEventHandler: Send + Sync {
    async fn on_auth_state(&self, phone: &str, phase: AuthPhase);
    async fn on_new_message(&self, phone: &str, message: InboundMessage);
}

type HandlerCell = Arc<RwLock<Option<Arc<dyn AccountEventHandler>>>>;

/// Maps an account phone to its live client handle.
///
/// No transport retries live here; reconnection is the client library's
/// concern. The registry only tracks identity, routes each handle's push
/// stream, and knows whether the designated worker account is up.
pub struct SessionRegistry {
    factory: Arc<dyn ClientFactory>,
    proxy: Option<ProxyConfig>,
    owner: String,
    sessions: RwLock<HashMap<String, Arc<dyn ClientApi>>>,
    handler: HandlerCell,
}

impl SessionRegistry {
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        proxy: Option<ProxyConfig>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            factory,
            proxy,
            owner: owner.into(),
            sessions: RwLock::new(HashMap::new()),
            handler: Arc::new(RwLock::new(None)),
        }
    }

    /// Install the event consumer. Must happen before the first
    /// [`open_account`] so no push event is dropped.
    ///
    /// [`open_account`]: SessionRegistry::open_account
    pub async fn set_handler(&self, handler: Arc<dyn AccountEventHandler>) {
        *self.handler.write().await = Some(handler);
    }

    /// Open (or re-open) the account. An existing handle for the same phone
    /// is closed and replaced.
    pub async fn open_account(&self, phone: &str) -> Result<Arc<dyn ClientApi>> {
        let (handle, mut events) = self.factory.open(phone).await?;

        {
            let mut sessions = self.sessions.write().await;
            if let Some(old) = sessions.insert(phone.to_string(), handle.clone()) {
                debug!(phone, "replacing existing handle");
                old.close();
            }
        }
        info!(phone, "account opened");

        if let Some(proxy) = &self.proxy {
            // Fire and forget; a proxy failure surfaces later as the client
            // library's own connection errors.
            let handle = handle.clone();
            let req = ClientRequest::AddProxy {
                host: proxy.host.clone(),
                port: proxy.port,
                user: proxy.user.clone(),
                password: proxy.password.clone(),
            };
            tokio::spawn(async move {
                if let Err(e) = handle.submit(req).await {
                    error!(error = %e, "set proxy failed");
                }
            });
        }

        let handler_cell = self.handler.clone();
        let phone = phone.to_string();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(handler) = handler_cell.read().await.clone() else {
                    debug!(%phone, "no event handler installed, dropping update");
                    continue;
                };
                match event {
                    ClientEvent::AuthStateChanged(phase) => {
                        handler.on_auth_state(&phone, phase).await;
                    }
                    ClientEvent::NewMessage(message) => {
                        handler.on_new_message(&phone, message).await;
                    }
                }
            }
            debug!(%phone, "push stream closed");
        });

        Ok(handle)
    }

    pub async fn get(&self, phone: &str) -> Option<Arc<dyn ClientApi>> {
        self.sessions.read().await.get(phone).cloned()
    }

    /// Drop the handle without closing it (the platform already closed the
    /// connection when it pushed the Closed phase).
    pub async fn evict(&self, phone: &str) -> Option<Arc<dyn ClientApi>> {
        self.sessions.write().await.remove(phone)
    }

    /// The designated forwarding account is live.
    pub async fn is_ready(&self) -> bool {
        self.sessions.read().await.contains_key(&self.owner)
    }

    /// Handle of the owner/worker account, when live.
    pub async fn worker(&self) -> Option<Arc<dyn ClientApi>> {
        self.get(&self.owner).await
    }

    /// Shutdown: close every open handle.
    pub async fn close_all(&self) {
        let mut sessions = self.sessions.write().await;
        for (phone, handle) in sessions.drain() {
            debug!(%phone, "closing handle");
            handle.close();
        }
    }
}

/// Cyclic cursor over the configured worker list.
///
/// The read-and-increment and the bounds check happen under one lock, so a
/// racing dispatch can skew fairness but never index out of bounds.
pub struct RoundRobin {
    order: Vec<String>,
    cursor: std::sync::Mutex<usize>,
}

impl RoundRobin {
    pub fn new(order: Vec<String>) -> Self {
        Self {
            order,
            cursor: std::sync::Mutex::new(0),
        }
    }

    /// Next configured worker with a live session, trying each configured
    /// worker at most once. `None` when the list is empty or nothing is
    /// live; the caller falls back to the owner account.
    pub async fn next_live(&self, registry: &SessionRegistry) -> Option<Arc<dyn ClientApi>> {
        for _ in 0..self.order.len() {
            let idx = {
                let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
                let idx = *cursor;
                *cursor = (idx + 1) % self.order.len();
                idx
            };
            if let Some(handle) = registry.get(&self.order[idx]).await {
                return Some(handle);
            }
        }
        None
    }
}

/// Routes push events by account role: auth phases to the orchestrator,
/// messages to the relay pipeline.
pub struct UpdateDispatcher {
    pub auth: Arc<AuthOrchestrator>,
    pub relay: Arc<RelayPipeline>,
}

#[async_trait]
impl AccountEventHandler for UpdateDispatcher {
    async fn on_auth_state(&self, phone: &str, phase: AuthPhase) {
        self.auth.on_auth_state(phone, phase).await;
    }

    async fn on_new_message(&self, phone: &str, message: InboundMessage) {
        self.relay.on_inbound_message(message, phone).await;
    }
}
