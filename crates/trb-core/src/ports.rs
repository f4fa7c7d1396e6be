//! Ports for the relational store and the durable broker.
//!
//! Both are external collaborators; the core specifies only the calls it
//! needs. The SQLite adapter crate implements them.

use async_trait::async_trait;

use crate::domain::{AllowedUser, ChatId, Destination, MessageId, RelayLink, Session, UserId};
use crate::queue::ForwardJob;
use crate::Result;

/// CRUD over the persisted tables. Every call may fail with
/// [`crate::Error::Store`]; callers log and abort the operation.
#[async_trait]
pub trait Store: Send + Sync {
    // -- sessions --
    async fn sessions(&self) -> Result<Vec<Session>>;
    async fn session_by_phone(&self, phone: &str) -> Result<Option<Session>>;
    async fn session_by_client(&self, client_id: UserId) -> Result<Option<Session>>;
    /// Upsert by `client_id`.
    async fn save_session(&self, session: &Session) -> Result<()>;

    // -- relay links --
    async fn links_to_forward(&self, owner: &str, chat_id_from: ChatId) -> Result<Vec<RelayLink>>;
    async fn own_links(&self, owner: &str) -> Result<Vec<RelayLink>>;
    async fn create_link(
        &self,
        owner: &str,
        chat_id_from: ChatId,
        source_title: &str,
        destination: &Destination,
    ) -> Result<()>;
    /// Returns the number of deleted rows.
    async fn delete_link_by_name(&self, owner: &str, name: &str) -> Result<u64>;

    // -- forwarded-message ledger --
    async fn was_forwarded(&self, msg_id: MessageId, chat_id_to: ChatId) -> Result<bool>;
    async fn add_forwarded(&self, msg_id: MessageId, chat_id_to: ChatId) -> Result<()>;

    // -- destinations --
    async fn destinations(&self) -> Result<Vec<Destination>>;
    async fn destination_by_name(&self, name: &str) -> Result<Option<Destination>>;
    async fn create_destination(&self, chat_id: ChatId, name: &str) -> Result<()>;
    async fn delete_destination_by_name(&self, name: &str) -> Result<u64>;

    // -- allowed users --
    async fn users(&self) -> Result<Vec<AllowedUser>>;
    async fn create_user(&self, phone: &str) -> Result<()>;
    async fn delete_user(&self, phone: &str) -> Result<u64>;
    async fn update_user_name(&self, phone: &str, username: &str) -> Result<()>;
    async fn is_phone_allowed(&self, phone: &str) -> Result<bool>;

    // -- permissions --
    async fn allowed_destinations(&self, phone: &str) -> Result<Vec<Destination>>;
    /// `false` when no destination with that name exists.
    async fn allow_destination(&self, destination_name: &str, phone: &str) -> Result<bool>;
    /// `false` when no matching permission exists.
    async fn deny_destination(&self, destination_name: &str, phone: &str) -> Result<bool>;
}

/// One in-flight delivery handed to the queue consumer.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Opaque redelivery tag; valid until acked or nacked.
    pub tag: i64,
    pub job: ForwardJob,
}

/// Durable at-least-once hand-off channel.
///
/// `enqueue` returns once the payload is stored. A received delivery that is
/// neither acked nor nacked before the process dies is redelivered on the
/// next start.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn enqueue(&self, job: &ForwardJob) -> Result<()>;
    /// Await the next delivery. Pending never returns an empty result.
    async fn recv(&self) -> Result<Delivery>;
    async fn ack(&self, tag: i64) -> Result<()>;
    /// Return the delivery to the queue for another attempt.
    async fn nack(&self, tag: i64) -> Result<()>;
}
