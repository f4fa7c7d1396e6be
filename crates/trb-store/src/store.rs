use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

use trb_core::domain::{
    AllowedUser, AuthState, ChatId, Destination, MessageId, RelayLink, Session, UserId,
};
use trb_core::ports::Store;
use trb_core::Result;

use crate::db_err;

/// SQL implementation of the store port.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_session(row: &SqliteRow) -> Session {
    Session {
        phone: row.get("phone"),
        auth_state: AuthState::parse(row.get::<String, _>("auth_state").as_str()),
        current_action: row.get("current_action"),
        first_param: row.get("first_param"),
        chat_id: ChatId(row.get("chat_id")),
        client_id: UserId(row.get("client_id")),
    }
}

fn row_to_link(row: &SqliteRow) -> RelayLink {
    RelayLink {
        owner: row.get("owner"),
        chat_id_from: ChatId(row.get("chat_id_from")),
        chat_id_to: ChatId(row.get("chat_id_to")),
        name: row.get("chat_name"),
    }
}

fn row_to_destination(row: &SqliteRow) -> Destination {
    Destination {
        chat_id: ChatId(row.get("chat_id")),
        name: row.get("chat_name"),
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn sessions(&self) -> Result<Vec<Session>> {
        let rows = sqlx::query("SELECT * FROM user_session")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(row_to_session).collect())
    }

    async fn session_by_phone(&self, phone: &str) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT * FROM user_session WHERE phone = ?")
            .bind(phone)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.as_ref().map(row_to_session))
    }

    async fn session_by_client(&self, client_id: UserId) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT * FROM user_session WHERE client_id = ?")
            .bind(client_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.as_ref().map(row_to_session))
    }

    async fn save_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_session \
             (client_id, phone, auth_state, current_action, first_param, chat_id) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(client_id) DO UPDATE SET \
             phone = excluded.phone, auth_state = excluded.auth_state, \
             current_action = excluded.current_action, \
             first_param = excluded.first_param, chat_id = excluded.chat_id",
        )
        .bind(session.client_id.0)
        .bind(&session.phone)
        .bind(session.auth_state.as_str())
        .bind(&session.current_action)
        .bind(&session.first_param)
        .bind(session.chat_id.0)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn links_to_forward(&self, owner: &str, chat_id_from: ChatId) -> Result<Vec<RelayLink>> {
        let rows = sqlx::query("SELECT * FROM user_chat WHERE chat_id_from = ? AND owner = ?")
            .bind(chat_id_from.0)
            .bind(owner)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(row_to_link).collect())
    }

    async fn own_links(&self, owner: &str) -> Result<Vec<RelayLink>> {
        let rows = sqlx::query("SELECT * FROM user_chat WHERE owner = ?")
            .bind(owner)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(row_to_link).collect())
    }

    async fn create_link(
        &self,
        owner: &str,
        chat_id_from: ChatId,
        source_title: &str,
        destination: &Destination,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_chat (owner, chat_id_from, chat_id_to, chat_name) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(owner)
        .bind(chat_id_from.0)
        .bind(destination.chat_id.0)
        .bind(format!("{source_title} -> {}", destination.name))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete_link_by_name(&self, owner: &str, name: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM user_chat WHERE owner = ? AND chat_name = ?")
            .bind(owner)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn was_forwarded(&self, msg_id: MessageId, chat_id_to: ChatId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM forwarded_message WHERE msg_id = ? AND chat_id = ?")
            .bind(msg_id.0)
            .bind(chat_id_to.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.is_some())
    }

    async fn add_forwarded(&self, msg_id: MessageId, chat_id_to: ChatId) -> Result<()> {
        sqlx::query("INSERT INTO forwarded_message (msg_id, chat_id) VALUES (?, ?)")
            .bind(msg_id.0)
            .bind(chat_id_to.0)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn destinations(&self) -> Result<Vec<Destination>> {
        let rows = sqlx::query("SELECT * FROM possible_destination")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(row_to_destination).collect())
    }

    async fn destination_by_name(&self, name: &str) -> Result<Option<Destination>> {
        let row = sqlx::query("SELECT * FROM possible_destination WHERE chat_name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.as_ref().map(row_to_destination))
    }

    async fn create_destination(&self, chat_id: ChatId, name: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO possible_destination (chat_id, chat_name) VALUES (?, ?) \
             ON CONFLICT(chat_id) DO UPDATE SET chat_name = excluded.chat_name",
        )
        .bind(chat_id.0)
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete_destination_by_name(&self, name: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM possible_destination WHERE chat_name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn users(&self) -> Result<Vec<AllowedUser>> {
        let rows = sqlx::query("SELECT * FROM user")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows
            .iter()
            .map(|row| AllowedUser {
                phone: row.get("phone"),
                username: row.get("username"),
            })
            .collect())
    }

    async fn create_user(&self, phone: &str) -> Result<()> {
        sqlx::query("INSERT INTO user (phone) VALUES (?)")
            .bind(phone)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn delete_user(&self, phone: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM user WHERE phone = ?")
            .bind(phone)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn update_user_name(&self, phone: &str, username: &str) -> Result<()> {
        sqlx::query("UPDATE user SET username = ? WHERE phone = ?")
            .bind(username)
            .bind(phone)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn is_phone_allowed(&self, phone: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM user WHERE phone = ?")
            .bind(phone)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.is_some())
    }

    async fn allowed_destinations(&self, phone: &str) -> Result<Vec<Destination>> {
        let rows = sqlx::query(
            "SELECT d.chat_id, d.chat_name FROM possible_destination d \
             JOIN user_permission p ON p.chat_id = d.chat_id \
             WHERE p.phone = ?",
        )
        .bind(phone)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.iter().map(row_to_destination).collect())
    }

    async fn allow_destination(&self, destination_name: &str, phone: &str) -> Result<bool> {
        let Some(destination) = self.destination_by_name(destination_name).await? else {
            return Ok(false);
        };
        sqlx::query("INSERT INTO user_permission (phone, chat_id) VALUES (?, ?)")
            .bind(phone)
            .bind(destination.chat_id.0)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(true)
    }

    async fn deny_destination(&self, destination_name: &str, phone: &str) -> Result<bool> {
        let Some(destination) = self.destination_by_name(destination_name).await? else {
            return Ok(false);
        };
        let result = sqlx::query("DELETE FROM user_permission WHERE phone = ? AND chat_id = ?")
            .bind(phone)
            .bind(destination.chat_id.0)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect_in_memory;

    async fn store() -> SqliteStore {
        SqliteStore::new(connect_in_memory().await.unwrap())
    }

    fn dst(chat_id: i64, name: &str) -> Destination {
        Destination {
            chat_id: ChatId(chat_id),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn session_upsert_round_trips() {
        let store = store().await;
        let mut session = Session::new(ChatId(10), UserId(5));
        session.phone = "79001234567".to_string();
        store.save_session(&session).await.unwrap();

        session.auth_state = AuthState::Authorized;
        session.current_action = "create_source".to_string();
        store.save_session(&session).await.unwrap();

        let loaded = store
            .session_by_phone("79001234567")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.auth_state, AuthState::Authorized);
        assert_eq!(loaded.current_action, "create_source");
        assert_eq!(loaded.chat_id, ChatId(10));

        let by_client = store.session_by_client(UserId(5)).await.unwrap().unwrap();
        assert_eq!(by_client.phone, "79001234567");
        assert_eq!(store.sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn link_triple_is_unique() {
        let store = store().await;
        let destination = dst(-200, "Dst");
        store
            .create_link("7900", ChatId(-100), "Src", &destination)
            .await
            .unwrap();
        assert!(store
            .create_link("7900", ChatId(-100), "Src", &destination)
            .await
            .is_err());

        let links = store.links_to_forward("7900", ChatId(-100)).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].name, "Src -> Dst");
    }

    #[tokio::test]
    async fn check_then_append_is_idempotent() {
        let store = store().await;
        let (msg, chat) = (MessageId(11), ChatId(-200));

        // First pass appends.
        assert!(!store.was_forwarded(msg, chat).await.unwrap());
        store.add_forwarded(msg, chat).await.unwrap();

        // Second pass sees the row and does nothing.
        assert!(store.was_forwarded(msg, chat).await.unwrap());
    }

    #[tokio::test]
    async fn delete_link_reports_row_count() {
        let store = store().await;
        store
            .create_link("7900", ChatId(-100), "Src", &dst(-200, "Dst"))
            .await
            .unwrap();
        assert_eq!(
            store.delete_link_by_name("7900", "Src -> Dst").await.unwrap(),
            1
        );
        assert_eq!(
            store.delete_link_by_name("7900", "Src -> Dst").await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn permissions_join_destinations() {
        let store = store().await;
        store.create_destination(ChatId(-200), "Dst").await.unwrap();
        store.create_user("7900").await.unwrap();

        assert!(store.allow_destination("Dst", "7900").await.unwrap());
        assert!(!store.allow_destination("Nope", "7900").await.unwrap());

        let allowed = store.allowed_destinations("7900").await.unwrap();
        assert_eq!(allowed, vec![dst(-200, "Dst")]);

        assert!(store.deny_destination("Dst", "7900").await.unwrap());
        assert!(!store.deny_destination("Dst", "7900").await.unwrap());
        assert!(store.allowed_destinations("7900").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_user_is_rejected() {
        let store = store().await;
        store.create_user("7900").await.unwrap();
        assert!(store.create_user("7900").await.is_err());
        assert!(store.is_phone_allowed("7900").await.unwrap());
        assert!(!store.is_phone_allowed("7901").await.unwrap());
    }
}
