use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::client::types::{ClientEvent, ClientRequest, ClientResponse};
use crate::Result;

/// One live account handle.
///
/// Transport-level reconnection is the client library's responsibility; the
/// core only submits calls and consumes the push stream.
#[async_trait]
pub trait ClientApi: Send + Sync {
    /// Issue a call and await its result. A platform-reported error comes
    /// back as [`crate::Error::Platform`].
    async fn submit(&self, req: ClientRequest) -> Result<ClientResponse>;

    /// Tear the handle down. Idempotent.
    fn close(&self);
}

/// Opens account handles. Implemented by the client-library adapter crate.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Open a handle for `key` (an account phone, or the control-bot key)
    /// and return it together with its push-update stream.
    async fn open(
        &self,
        key: &str,
    ) -> Result<(Arc<dyn ClientApi>, mpsc::UnboundedReceiver<ClientEvent>)>;
}
