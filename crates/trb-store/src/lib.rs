//! SQLite adapters for the relational store and the durable broker.

mod broker;
mod store;

pub use broker::SqliteBroker;
pub use store::SqliteStore;

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use trb_core::{Error, Result};

pub(crate) fn db_err(e: sqlx::Error) -> Error {
    Error::Store(e.to_string())
}

/// Open (creating if missing) the database file and bootstrap the schema.
///
/// A connection failure here is fatal to startup by design.
pub async fn connect(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await
        .map_err(db_err)?;
    migrate(&pool).await?;
    Ok(pool)
}

/// In-memory database, used by the tests.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(db_err)?;
    // One connection only: every :memory: connection is its own database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(db_err)?;
    migrate(&pool).await?;
    Ok(pool)
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS user_session (
        client_id INTEGER PRIMARY KEY,
        phone TEXT NOT NULL DEFAULT '',
        auth_state TEXT NOT NULL DEFAULT 'LOGIN',
        current_action TEXT NOT NULL DEFAULT '',
        first_param TEXT NOT NULL DEFAULT '',
        chat_id INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS user_chat (
        owner TEXT NOT NULL,
        chat_id_from INTEGER NOT NULL,
        chat_id_to INTEGER NOT NULL,
        chat_name TEXT NOT NULL,
        UNIQUE (owner, chat_id_from, chat_id_to)
    )",
    "CREATE TABLE IF NOT EXISTS possible_destination (
        chat_id INTEGER PRIMARY KEY,
        chat_name TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS forwarded_message (
        msg_id INTEGER NOT NULL,
        chat_id INTEGER NOT NULL,
        PRIMARY KEY (msg_id, chat_id)
    )",
    "CREATE TABLE IF NOT EXISTS user (
        phone TEXT PRIMARY KEY,
        username TEXT NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS user_permission (
        phone TEXT NOT NULL,
        chat_id INTEGER NOT NULL,
        PRIMARY KEY (phone, chat_id)
    )",
    "CREATE TABLE IF NOT EXISTS queue_message (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        payload TEXT NOT NULL,
        in_flight INTEGER NOT NULL DEFAULT 0
    )",
];

async fn migrate(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(db_err)?;
    }
    // Deliveries stranded by a crash go back to the queue: at-least-once.
    sqlx::query("UPDATE queue_message SET in_flight = 0 WHERE in_flight = 1")
        .execute(pool)
        .await
        .map_err(db_err)?;
    Ok(())
}
