//! Relay pipeline: rule resolution, dedup, content reconstruction and
//! round-robin dispatch.

use std::{sync::Arc, time::Duration};

use tracing::{debug, error};

use crate::client::types::{
    formatted_user_name, ClientRequest, ClientResponse, ForwardOrigin, FormattedText,
    InboundMessage, MessageContent,
};
use crate::domain::RelayLink;
use crate::expiry::ExpiryCache;
use crate::ports::Store;
use crate::queue::{DeliveryQueue, ForwardJob};
use crate::registry::{RoundRobin, SessionRegistry};
use crate::{Error, Result};

pub struct RelayPipeline {
    store: Arc<dyn Store>,
    registry: Arc<SessionRegistry>,
    robin: RoundRobin,
    queue: Arc<DeliveryQueue>,
    /// Display names of forward-origin chats/users, keyed by their id.
    names: ExpiryCache<i64>,
    name_ttl: Duration,
}

impl RelayPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<SessionRegistry>,
        robin: RoundRobin,
        queue: Arc<DeliveryQueue>,
        name_ttl: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            robin,
            queue,
            names: ExpiryCache::new(),
            name_ttl,
        }
    }

    pub fn names(&self) -> &ExpiryCache<i64> {
        &self.names
    }

    /// Ingestion entry point for a message pushed on `source_phone`'s
    /// account.
    pub async fn on_inbound_message(&self, message: InboundMessage, source_phone: &str) {
        debug!(phone = source_phone, msg_id = message.id.0, "new message arrived");
        if !self.registry.is_ready().await {
            error!("worker not started, message ignored");
            return;
        }

        let links = match self
            .store
            .links_to_forward(source_phone, message.chat_id)
            .await
        {
            Ok(links) => links,
            Err(e) => {
                error!(error = %e, "link lookup failed");
                return;
            }
        };

        for link in links {
            match self.store.was_forwarded(message.id, link.chat_id_to).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    error!(error = %e, "ledger lookup failed");
                    continue;
                }
            }

            debug!(kind = message.content.kind(), "message type");
            let date = message.forward.as_ref().map(|f| f.date).unwrap_or(message.date);
            let Some(title) = self.resolve_title(&message, &link, source_phone).await else {
                continue;
            };

            let job = ForwardJob {
                chat_id_to: link.chat_id_to,
                message: message.clone(),
                title,
                date,
            };
            if let Err(e) = self.queue.enqueue(&job).await {
                error!(error = %e, "enqueue failed");
            }
        }
    }

    /// Attribution title for the forwarded copy: the origin channel/user
    /// name (cached for a day), "Hidden user" for anonymous forwards, or
    /// the source part of the link name when the message is an original.
    async fn resolve_title(
        &self,
        message: &InboundMessage,
        link: &RelayLink,
        source_phone: &str,
    ) -> Option<String> {
        let Some(forward) = &message.forward else {
            return Some(link.source_title().to_string());
        };

        match forward.origin {
            ForwardOrigin::Channel { chat_id } => {
                if let Some(title) = self.names.get(&chat_id.0) {
                    debug!(%title, "got chat name from cache");
                    return Some(title);
                }
                debug!(chat_id = chat_id.0, "trying to get channel header");
                let handle = self.registry.get(source_phone).await?;
                match handle.submit(ClientRequest::GetChat { chat_id }).await {
                    Ok(ClientResponse::Chat { chat_id, title }) => {
                        if chat_id.0 != 0 {
                            self.names.put(chat_id.0, &title, self.name_ttl);
                        }
                        Some(title)
                    }
                    Ok(other) => {
                        debug!(?other, "unexpected chat lookup result");
                        None
                    }
                    Err(e) => {
                        error!(error = %e, "chat lookup failed");
                        None
                    }
                }
            }
            ForwardOrigin::User { user_id } => {
                if let Some(name) = self.names.get(&user_id.0) {
                    debug!(%name, "got user name from cache");
                    return Some(name);
                }
                debug!(user_id = user_id.0, "trying to get user header");
                let handle = self.registry.get(source_phone).await?;
                match handle.submit(ClientRequest::GetUser { user_id }).await {
                    Ok(ClientResponse::User {
                        user_id,
                        username,
                        first_name,
                        last_name,
                    }) => {
                        let name = formatted_user_name(&username, &first_name, &last_name);
                        if user_id.0 != 0 {
                            self.names.put(user_id.0, &name, self.name_ttl);
                        }
                        Some(name)
                    }
                    Ok(other) => {
                        debug!(?other, "unexpected user lookup result");
                        None
                    }
                    Err(e) => {
                        error!(error = %e, "user lookup failed");
                        None
                    }
                }
            }
            ForwardOrigin::Hidden => Some("Hidden user".to_string()),
        }
    }

    /// Dispatch one queued forward. `Ok` means the delivery is finished
    /// (sent-and-ledgered, deduplicated, dropped as unsupported, or failed
    /// platform-side with no retry); `Err` means the store got in the way
    /// and the delivery must be redelivered.
    pub async fn dispatch(&self, job: &ForwardJob) -> Result<()> {
        if self.store.was_forwarded(job.message.id, job.chat_id_to).await? {
            debug!(msg_id = job.message.id.0, "already forwarded, skipping");
            return Ok(());
        }

        let Some(content) = build_forward_content(&job.message.content, &job.title, job.date)
        else {
            debug!(kind = job.message.content.kind(), "unsupported type for forward");
            return Ok(());
        };

        let handle = match self.robin.next_live(&self.registry).await {
            Some(handle) => handle,
            None => {
                error!("no client configured for round-robin, will use admin account");
                self.registry
                    .worker()
                    .await
                    .ok_or_else(|| Error::NoSession("worker".to_string()))?
            }
        };

        let request = ClientRequest::SendMessage {
            chat_id: job.chat_id_to,
            content,
            keyboard: None,
        };
        match handle.submit(request).await {
            Ok(_) => {
                debug!(
                    msg_id = job.message.id.0,
                    chat_id_from = job.message.chat_id.0,
                    chat_id_to = job.chat_id_to.0,
                    "message was forwarded"
                );
                // Ledger append before the broker ack; a failure here makes
                // the consumer redeliver instead of losing the dedup record.
                self.store.add_forwarded(job.message.id, job.chat_id_to).await?;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "send failed");
                Ok(())
            }
        }
    }
}

/// Rebuild outbound content with the `"<title> : <date>\n"` attribution
/// line prepended, shifting every formatting span past the prefix. Returns
/// `None` for content kinds the relay does not forward.
pub fn build_forward_content(
    content: &MessageContent,
    title: &str,
    date: i64,
) -> Option<MessageContent> {
    let prefix = format!("{title} : {date}\n");
    match content {
        MessageContent::Text { text } => Some(MessageContent::Text {
            text: prefix_formatted(text, &prefix),
        }),
        MessageContent::Photo { file_id, caption } => Some(MessageContent::Photo {
            file_id: file_id.clone(),
            caption: prefix_formatted(caption, &prefix),
        }),
        MessageContent::Animation {
            file_id,
            duration,
            width,
            height,
            caption,
        } => Some(MessageContent::Animation {
            file_id: file_id.clone(),
            duration: *duration,
            width: *width,
            height: *height,
            caption: prefix_formatted(caption, &prefix),
        }),
        MessageContent::Video {
            file_id,
            duration,
            width,
            height,
            supports_streaming,
            caption,
        } => Some(MessageContent::Video {
            file_id: file_id.clone(),
            duration: *duration,
            width: *width,
            height: *height,
            supports_streaming: *supports_streaming,
            caption: prefix_formatted(caption, &prefix),
        }),
        MessageContent::Document { file_id, caption } => Some(MessageContent::Document {
            file_id: file_id.clone(),
            caption: prefix_formatted(caption, &prefix),
        }),
        MessageContent::Contact { .. } | MessageContent::Unsupported { .. } => None,
    }
}

fn prefix_formatted(original: &FormattedText, prefix: &str) -> FormattedText {
    let shift = prefix.chars().count();
    FormattedText {
        text: format!("{prefix}{}", original.text),
        entities: original
            .entities
            .iter()
            .map(|e| crate::client::types::TextEntity {
                offset: e.offset + shift,
                length: e.length,
                kind: e.kind.clone(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::types::TextEntity;
    use crate::domain::{ChatId, MessageId, UserId};
    use crate::ports::Broker as _;
    use crate::testutil::{FakeFactory, MemBroker, MemStore};

    const OWNER: &str = "79000000000";

    struct Rig {
        pipeline: RelayPipeline,
        store: Arc<MemStore>,
        broker: Arc<MemBroker>,
        factory: Arc<FakeFactory>,
    }

    async fn rig(workers: Vec<&str>) -> Rig {
        let factory = Arc::new(FakeFactory::new());
        let registry = Arc::new(SessionRegistry::new(factory.clone(), None, OWNER));
        registry.open_account(OWNER).await.unwrap();
        for phone in &workers {
            registry.open_account(phone).await.unwrap();
        }
        let store = Arc::new(MemStore::new());
        let broker = Arc::new(MemBroker::new());
        let queue = Arc::new(DeliveryQueue::new(
            broker.clone(),
            registry.clone(),
            Duration::from_millis(0),
        ));
        let robin = RoundRobin::new(workers.into_iter().map(String::from).collect());
        let pipeline = RelayPipeline::new(
            store.clone(),
            registry,
            robin,
            queue,
            Duration::from_secs(24 * 60 * 60),
        );
        Rig {
            pipeline,
            store,
            broker,
            factory,
        }
    }

    fn text_message(id: i64, chat_id: i64, text: &str) -> InboundMessage {
        InboundMessage {
            id: MessageId(id),
            chat_id: ChatId(chat_id),
            sender_id: UserId(1),
            date: 1_700_000_000,
            forward: None,
            content: MessageContent::Text {
                text: FormattedText::plain(text),
            },
            command: None,
        }
    }

    fn link(owner: &str, from: i64, to: i64, name: &str) -> RelayLink {
        RelayLink {
            owner: owner.to_string(),
            chat_id_from: ChatId(from),
            chat_id_to: ChatId(to),
            name: name.to_string(),
        }
    }

    #[test]
    fn prefix_shifts_entity_offsets() {
        let original = FormattedText {
            text: "bold rest".to_string(),
            entities: vec![TextEntity {
                offset: 0,
                length: 4,
                kind: "bold".to_string(),
            }],
        };
        // 10-char prefix: "ab : 123\n" is 9, pick one that is exactly 10.
        let shifted = prefix_formatted(&original, "0123456789");
        assert!(shifted.text.starts_with("0123456789"));
        assert_eq!(shifted.entities[0].offset, 10);
        assert_eq!(shifted.entities[0].length, 4);
    }

    #[test]
    fn unsupported_content_is_not_rebuilt() {
        let content = MessageContent::Unsupported {
            kind: "messageSticker".to_string(),
        };
        assert!(build_forward_content(&content, "Src", 0).is_none());
    }

    #[test]
    fn caption_kinds_keep_their_attachment_fields() {
        let content = MessageContent::Video {
            file_id: "vid".to_string(),
            duration: 30,
            width: 640,
            height: 480,
            supports_streaming: true,
            caption: FormattedText::plain("cap"),
        };
        let Some(MessageContent::Video {
            file_id,
            supports_streaming,
            caption,
            ..
        }) = build_forward_content(&content, "T", 5)
        else {
            panic!("video should be forwardable");
        };
        assert_eq!(file_id, "vid");
        assert!(supports_streaming);
        assert_eq!(caption.text, "T : 5\ncap");
    }

    #[tokio::test]
    async fn original_message_is_queued_with_link_source_title() {
        let rig = rig(vec![]).await;
        rig.store.insert_link(link(OWNER, -100, -200, "Src -> Dst"));

        rig.pipeline
            .on_inbound_message(text_message(11, -100, "hello"), OWNER)
            .await;

        let delivery = rig.broker.recv().await.unwrap();
        assert_eq!(delivery.job.title, "Src");
        assert_eq!(delivery.job.chat_id_to, ChatId(-200));
        assert_eq!(delivery.job.date, 1_700_000_000);
    }

    #[tokio::test]
    async fn dispatch_sends_with_attribution_and_ledgers() {
        let rig = rig(vec![]).await;
        rig.store.insert_link(link(OWNER, -100, -200, "Src -> Dst"));
        rig.pipeline
            .on_inbound_message(text_message(11, -100, "hello"), OWNER)
            .await;
        let delivery = rig.broker.recv().await.unwrap();

        rig.pipeline.dispatch(&delivery.job).await.unwrap();

        let requests = rig.factory.client(OWNER).requests();
        let sent = requests
            .iter()
            .find_map(|r| match r {
                ClientRequest::SendMessage {
                    chat_id,
                    content: MessageContent::Text { text },
                    ..
                } => Some((*chat_id, text.text.clone())),
                _ => None,
            })
            .expect("a send should have been issued");
        assert_eq!(sent.0, ChatId(-200));
        assert_eq!(sent.1, "Src : 1700000000\nhello");
        assert_eq!(rig.store.forwarded_pairs(), vec![(11, -200)]);
    }

    #[tokio::test]
    async fn redelivered_job_is_not_sent_twice() {
        let rig = rig(vec![]).await;
        rig.store.insert_link(link(OWNER, -100, -200, "Src -> Dst"));
        rig.pipeline
            .on_inbound_message(text_message(11, -100, "hello"), OWNER)
            .await;
        let delivery = rig.broker.recv().await.unwrap();

        rig.pipeline.dispatch(&delivery.job).await.unwrap();
        let sends_before = send_count(&rig, OWNER);

        // Broker redelivery of the same payload: ledger makes it a no-op.
        rig.pipeline.dispatch(&delivery.job).await.unwrap();
        assert_eq!(send_count(&rig, OWNER), sends_before);
        assert_eq!(rig.store.forwarded_pairs(), vec![(11, -200)]);
    }

    #[tokio::test]
    async fn replayed_inbound_message_is_filtered_by_ledger() {
        let rig = rig(vec![]).await;
        rig.store.insert_link(link(OWNER, -100, -200, "Src -> Dst"));
        rig.store
            .add_forwarded(MessageId(11), ChatId(-200))
            .await
            .unwrap();

        rig.pipeline
            .on_inbound_message(text_message(11, -100, "hello"), OWNER)
            .await;
        assert_eq!(rig.broker.depth(), 0);
    }

    #[tokio::test]
    async fn ledger_failure_bubbles_for_redelivery() {
        let rig = rig(vec![]).await;
        rig.store.insert_link(link(OWNER, -100, -200, "Src -> Dst"));
        rig.pipeline
            .on_inbound_message(text_message(11, -100, "hello"), OWNER)
            .await;
        let delivery = rig.broker.recv().await.unwrap();

        rig.store
            .fail
            .store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(rig.pipeline.dispatch(&delivery.job).await.is_err());
    }

    #[tokio::test]
    async fn platform_send_error_is_terminal() {
        let rig = rig(vec![]).await;
        rig.store.insert_link(link(OWNER, -100, -200, "Src -> Dst"));
        rig.pipeline
            .on_inbound_message(text_message(11, -100, "hi"), OWNER)
            .await;
        let delivery = rig.broker.recv().await.unwrap();

        rig.factory.client(OWNER).push_response(Err(Error::Platform {
            code: 400,
            message: "CHAT_NOT_FOUND".to_string(),
        }));
        // Logged only; the delivery is acked, nothing ledgered.
        rig.pipeline.dispatch(&delivery.job).await.unwrap();
        assert!(rig.store.forwarded_pairs().is_empty());
    }

    #[tokio::test]
    async fn forward_origin_name_is_looked_up_once_then_cached() {
        let rig = rig(vec![]).await;
        rig.store.insert_link(link(OWNER, -100, -200, "Src -> Dst"));

        let mut message = text_message(21, -100, "fwd");
        message.forward = Some(crate::client::types::ForwardInfo {
            origin: ForwardOrigin::Channel {
                chat_id: ChatId(-555),
            },
            date: 1_600_000_000,
        });

        rig.factory
            .client(OWNER)
            .push_response(Ok(ClientResponse::Chat {
                chat_id: ChatId(-555),
                title: "Origin Channel".to_string(),
            }));
        rig.pipeline.on_inbound_message(message.clone(), OWNER).await;

        let delivery = rig.broker.recv().await.unwrap();
        assert_eq!(delivery.job.title, "Origin Channel");
        // The forward metadata date wins over the message date.
        assert_eq!(delivery.job.date, 1_600_000_000);

        // Second forward from the same origin: served from the cache, no
        // further lookup scripted and none issued.
        let lookups_before = chat_lookup_count(&rig, OWNER);
        message.id = MessageId(22);
        rig.pipeline.on_inbound_message(message, OWNER).await;
        let delivery = rig.broker.recv().await.unwrap();
        assert_eq!(delivery.job.title, "Origin Channel");
        assert_eq!(chat_lookup_count(&rig, OWNER), lookups_before);
    }

    #[tokio::test]
    async fn hidden_forward_origin_uses_fixed_title() {
        let rig = rig(vec![]).await;
        rig.store.insert_link(link(OWNER, -100, -200, "Src -> Dst"));

        let mut message = text_message(31, -100, "anon");
        message.forward = Some(crate::client::types::ForwardInfo {
            origin: ForwardOrigin::Hidden,
            date: 1_600_000_000,
        });
        rig.pipeline.on_inbound_message(message, OWNER).await;

        let delivery = rig.broker.recv().await.unwrap();
        assert_eq!(delivery.job.title, "Hidden user");
    }

    #[tokio::test]
    async fn dispatch_prefers_round_robin_workers_over_owner() {
        let rig = rig(vec!["w1"]).await;
        rig.store.insert_link(link(OWNER, -100, -200, "Src -> Dst"));
        rig.pipeline
            .on_inbound_message(text_message(41, -100, "x"), OWNER)
            .await;
        let delivery = rig.broker.recv().await.unwrap();

        rig.pipeline.dispatch(&delivery.job).await.unwrap();
        assert_eq!(send_count(&rig, "w1"), 1);
        assert_eq!(send_count(&rig, OWNER), 0);
    }

    #[tokio::test]
    async fn destination_not_served_when_worker_account_down() {
        let factory = Arc::new(FakeFactory::new());
        let registry = Arc::new(SessionRegistry::new(factory.clone(), None, OWNER));
        let store = Arc::new(MemStore::new());
        let broker = Arc::new(MemBroker::new());
        let queue = Arc::new(DeliveryQueue::new(
            broker.clone(),
            registry.clone(),
            Duration::from_millis(0),
        ));
        let pipeline = RelayPipeline::new(
            store.clone(),
            registry,
            RoundRobin::new(Vec::new()),
            queue,
            Duration::from_secs(60),
        );
        store.insert_link(link(OWNER, -100, -200, "Src -> Dst"));

        // Worker not live: the precondition drops the message, no buffering.
        pipeline
            .on_inbound_message(text_message(51, -100, "zzz"), OWNER)
            .await;
        assert_eq!(broker.depth(), 0);
    }

    fn send_count(rig: &Rig, phone: &str) -> usize {
        rig.factory
            .client(phone)
            .requests()
            .iter()
            .filter(|r| matches!(r, ClientRequest::SendMessage { .. }))
            .count()
    }

    fn chat_lookup_count(rig: &Rig, phone: &str) -> usize {
        rig.factory
            .client(phone)
            .requests()
            .iter()
            .filter(|r| matches!(r, ClientRequest::GetChat { .. }))
            .count()
    }
}
