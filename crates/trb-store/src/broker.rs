use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tokio::sync::Notify;
use tracing::debug;

use trb_core::ports::{Broker, Delivery};
use trb_core::queue::ForwardJob;
use trb_core::Result;

use crate::db_err;

/// Safety-net poll in case a wakeup is missed.
const RECV_POLL: Duration = Duration::from_secs(1);

/// Durable queue over the `queue_message` table.
///
/// A received row is flagged `in_flight` instead of deleted; `ack` deletes
/// it, `nack` re-flags it, and schema bootstrap resets stranded flags so a
/// crash redelivers (at-least-once).
pub struct SqliteBroker {
    pool: SqlitePool,
    wakeup: Notify,
}

impl SqliteBroker {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            wakeup: Notify::new(),
        }
    }
}

#[async_trait]
impl Broker for SqliteBroker {
    async fn enqueue(&self, job: &ForwardJob) -> Result<()> {
        let payload = serde_json::to_string(job)?;
        sqlx::query("INSERT INTO queue_message (payload) VALUES (?)")
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        self.wakeup.notify_one();
        Ok(())
    }

    async fn recv(&self) -> Result<Delivery> {
        loop {
            let row = sqlx::query(
                "UPDATE queue_message SET in_flight = 1 \
                 WHERE id = (SELECT id FROM queue_message WHERE in_flight = 0 \
                             ORDER BY id LIMIT 1) \
                 RETURNING id, payload",
            )
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

            if let Some(row) = row {
                let tag: i64 = row.get("id");
                let payload: String = row.get("payload");
                let job: ForwardJob = serde_json::from_str(&payload)?;
                debug!(tag, "delivering queued message");
                return Ok(Delivery { tag, job });
            }

            tokio::select! {
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(RECV_POLL) => {}
            }
        }
    }

    async fn ack(&self, tag: i64) -> Result<()> {
        sqlx::query("DELETE FROM queue_message WHERE id = ?")
            .bind(tag)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn nack(&self, tag: i64) -> Result<()> {
        sqlx::query("UPDATE queue_message SET in_flight = 0 WHERE id = ?")
            .bind(tag)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        self.wakeup.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect_in_memory;

    use trb_core::client::types::{FormattedText, InboundMessage, MessageContent};
    use trb_core::domain::{ChatId, MessageId, UserId};

    fn job(msg_id: i64) -> ForwardJob {
        ForwardJob {
            chat_id_to: ChatId(-200),
            message: InboundMessage {
                id: MessageId(msg_id),
                chat_id: ChatId(-100),
                sender_id: UserId(1),
                date: 0,
                forward: None,
                content: MessageContent::Text {
                    text: FormattedText::plain("payload"),
                },
                command: None,
            },
            title: "Src".to_string(),
            date: 0,
        }
    }

    #[tokio::test]
    async fn delivers_in_insertion_order() {
        let broker = SqliteBroker::new(connect_in_memory().await.unwrap());
        broker.enqueue(&job(1)).await.unwrap();
        broker.enqueue(&job(2)).await.unwrap();

        let first = broker.recv().await.unwrap();
        let second = broker.recv().await.unwrap();
        assert_eq!(first.job.message.id.0, 1);
        assert_eq!(second.job.message.id.0, 2);
        broker.ack(first.tag).await.unwrap();
        broker.ack(second.tag).await.unwrap();
    }

    #[tokio::test]
    async fn nack_redelivers() {
        let broker = SqliteBroker::new(connect_in_memory().await.unwrap());
        broker.enqueue(&job(7)).await.unwrap();

        let delivery = broker.recv().await.unwrap();
        broker.nack(delivery.tag).await.unwrap();

        let again = broker.recv().await.unwrap();
        assert_eq!(again.tag, delivery.tag);
        assert_eq!(again.job.message.id.0, 7);
    }

    #[tokio::test]
    async fn stranded_in_flight_rows_are_redelivered_after_restart() {
        let pool = connect_in_memory().await.unwrap();
        let broker = SqliteBroker::new(pool.clone());
        broker.enqueue(&job(9)).await.unwrap();
        let _unacked = broker.recv().await.unwrap();

        // Re-running the bootstrap plays the part of a process restart.
        crate::migrate(&pool).await.unwrap();

        let redelivered = broker.recv().await.unwrap();
        assert_eq!(redelivered.job.message.id.0, 9);
    }

    #[tokio::test]
    async fn acked_delivery_is_gone_for_good() {
        let pool = connect_in_memory().await.unwrap();
        let broker = SqliteBroker::new(pool.clone());
        broker.enqueue(&job(3)).await.unwrap();
        let delivery = broker.recv().await.unwrap();
        broker.ack(delivery.tag).await.unwrap();

        crate::migrate(&pool).await.unwrap();
        let row = sqlx::query("SELECT COUNT(*) AS n FROM queue_message")
            .fetch_one(&pool)
            .await
            .unwrap();
        let n: i64 = row.get("n");
        assert_eq!(n, 0);
    }
}
