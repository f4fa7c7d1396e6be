use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use trb_core::auth::AuthOrchestrator;
use trb_core::client::port::ClientFactory;
use trb_core::config::Config;
use trb_core::control::ControlBot;
use trb_core::domain::AuthState;
use trb_core::engine::ConversationEngine;
use trb_core::expiry::SecretVault;
use trb_core::ports::{Broker, Store};
use trb_core::queue::DeliveryQueue;
use trb_core::registry::{RoundRobin, SessionRegistry, UpdateDispatcher};
use trb_core::relay::RelayPipeline;
use trb_store::{SqliteBroker, SqliteStore};
use trb_tdlib::BridgeFactory;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    trb_core::logging::init("trb");

    let cfg = Arc::new(Config::load()?);

    // Unrecoverable store trouble at startup aborts initialization.
    debug!("testing connection...");
    let pool = trb_store::connect(&cfg.database_path).await?;
    debug!("connection is OK");
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool.clone()));
    let broker: Arc<dyn Broker> = Arc::new(SqliteBroker::new(pool));

    let sessions = store.sessions().await?;
    debug!(count = sessions.len(), "sessions");
    let destinations = store.destinations().await?;
    debug!(count = destinations.len(), "destinations");

    let factory: Arc<dyn ClientFactory> =
        Arc::new(BridgeFactory::new(cfg.bridge_path.clone()));
    let registry = Arc::new(SessionRegistry::new(
        factory.clone(),
        cfg.proxy.clone(),
        cfg.bot_owner.clone(),
    ));
    let codes = Arc::new(SecretVault::new());
    let passwords = Arc::new(SecretVault::new());

    let control = ControlBot::new(cfg.clone());
    let auth = Arc::new(AuthOrchestrator::new(
        cfg.clone(),
        store.clone(),
        registry.clone(),
        codes.clone(),
        passwords.clone(),
        control.clone(),
    ));
    let queue = Arc::new(DeliveryQueue::new(
        broker,
        registry.clone(),
        cfg.sending_delay,
    ));
    let relay = Arc::new(RelayPipeline::new(
        store.clone(),
        registry.clone(),
        RoundRobin::new(cfg.workers.clone()),
        queue.clone(),
        cfg.name_ttl,
    ));
    registry
        .set_handler(Arc::new(UpdateDispatcher {
            auth,
            relay: relay.clone(),
        }))
        .await;

    let engine = Arc::new(ConversationEngine::new(
        cfg.clone(),
        store.clone(),
        registry.clone(),
        codes.clone(),
        passwords.clone(),
        control.clone(),
    ));
    control.set_engine(engine).await;
    control.start(&factory).await?;

    // Bring previously authorized accounts back up.
    for session in sessions
        .iter()
        .filter(|s| s.auth_state == AuthState::Authorized)
    {
        if let Err(e) = registry.open_account(&session.phone).await {
            error!(phone = %session.phone, error = %e, "cannot reopen account");
        }
    }

    let cancel = CancellationToken::new();

    // Exactly one queue consumer: the global sending delay depends on it.
    let consumer = {
        let queue = queue.clone();
        let relay = relay.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            queue.run(relay, cancel).await;
        })
    };

    // Periodic TTL sweep for secrets and the display-name cache.
    let sweeper = {
        let codes = codes.clone();
        let passwords = passwords.clone();
        let relay = relay.clone();
        let cancel = cancel.clone();
        let interval = cfg.sweep_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let now = Utc::now();
                        codes.sweep(now);
                        passwords.sweep(now);
                        relay.names().sweep(now);
                    }
                }
            }
        })
    };

    info!("started");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    cancel.cancel();
    let _ = consumer.await;
    let _ = sweeper.await;
    registry.close_all().await;

    Ok(())
}
