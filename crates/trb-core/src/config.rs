use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::client::types::ClientParameters;
use crate::{errors::Error, Result};

/// SOCKS5 proxy applied to every freshly opened account handle.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

/// Typed configuration, loaded from the environment (with `.env` support).
#[derive(Clone, Debug)]
pub struct Config {
    // Platform application credentials.
    pub app_id: i32,
    pub app_hash: String,

    // Control bot.
    pub bot_id: i64,
    pub bot_key: String,

    /// Phone of the owner account; doubles as the designated forwarding
    /// worker and as the admin identity gate.
    pub bot_owner: String,
    /// Ordered round-robin worker list (semicolon-delimited in env).
    pub workers: Vec<String>,

    pub proxy: Option<ProxyConfig>,

    /// Global minimum spacing between consecutive outbound sends.
    pub sending_delay: Duration,

    // Storage.
    pub database_path: PathBuf,
    /// Per-account client-library storage root.
    pub client_dir: PathBuf,
    /// Client bridge executable (see the trb-tdlib crate).
    pub bridge_path: PathBuf,

    // Fixed operational constants, overridable for tests.
    pub auth_wait_timeout: Duration,
    pub secret_ttl: Duration,
    pub name_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let app_id = env_i32("TRB_APP_ID")
            .ok_or_else(|| Error::Config("TRB_APP_ID is required".to_string()))?;
        let app_hash = env_str("TRB_APP_HASH")
            .and_then(non_empty)
            .ok_or_else(|| Error::Config("TRB_APP_HASH is required".to_string()))?;

        let bot_id = env_i64("TRB_BOT_ID")
            .ok_or_else(|| Error::Config("TRB_BOT_ID is required".to_string()))?;
        let bot_key = env_str("TRB_BOT_KEY")
            .and_then(non_empty)
            .ok_or_else(|| Error::Config("TRB_BOT_KEY is required".to_string()))?;

        let bot_owner = env_str("TRB_BOT_OWNER")
            .and_then(non_empty)
            .ok_or_else(|| Error::Config("TRB_BOT_OWNER is required".to_string()))?;
        let workers = parse_semicolon_list(env_str("TRB_WORKERS"));

        let proxy = if env_bool("TRB_PROXY_ENABLED").unwrap_or(false) {
            Some(ProxyConfig {
                host: env_str("TRB_PROXY_HOST").unwrap_or_default(),
                port: env_u16("TRB_PROXY_PORT").unwrap_or(1080),
                user: env_str("TRB_PROXY_USER").unwrap_or_default(),
                password: env_str("TRB_PROXY_PASSWORD").unwrap_or_default(),
            })
        } else {
            None
        };

        let sending_delay =
            Duration::from_millis(env_u64("TRB_SENDING_DELAY_MS").unwrap_or(1000));

        let database_path = env_path("TRB_DATABASE_PATH")
            .unwrap_or_else(|| PathBuf::from("trb.sqlite"));
        let client_dir =
            env_path("TRB_CLIENT_DIR").unwrap_or_else(|| PathBuf::from("tdlib"));
        let bridge_path =
            env_path("TRB_BRIDGE_PATH").unwrap_or_else(|| PathBuf::from("tdjson-bridge"));

        Ok(Self {
            app_id,
            app_hash,
            bot_id,
            bot_key,
            bot_owner,
            workers,
            proxy,
            sending_delay,
            database_path,
            client_dir,
            bridge_path,
            auth_wait_timeout: Duration::from_secs(3 * 60),
            secret_ttl: Duration::from_secs(5 * 60),
            name_ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(10),
        })
    }

    /// `bot_id:bot_key`, the token the control bot authenticates with.
    pub fn bot_token(&self) -> String {
        format!("{}:{}", self.bot_id, self.bot_key)
    }

    /// Fixed client parameters for one account, storage keyed by `key`.
    pub fn client_parameters(&self, key: &str) -> ClientParameters {
        ClientParameters {
            database_directory: self.client_dir.join(key).to_string_lossy().into_owned(),
            api_id: self.app_id,
            api_hash: self.app_hash.clone(),
            system_language_code: "en".to_string(),
            device_model: "Desktop".to_string(),
            system_version: "Unknown".to_string(),
            application_version: "1.0".to_string(),
        }
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_i32(key: &str) -> Option<i32> {
    env_str(key).and_then(|s| s.trim().parse::<i32>().ok())
}

fn env_i64(key: &str) -> Option<i64> {
    env_str(key).and_then(|s| s.trim().parse::<i64>().ok())
}

fn env_u16(key: &str) -> Option<u16> {
    env_str(key).and_then(|s| s.trim().parse::<u16>().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn parse_semicolon_list(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(';')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
