//! Runtime configuration.
//!
//! Defaults cover local development out of the box. A TOML file overrides the
//! defaults, `SALON_CHAT_DB` / `SALON_CHAT_PORT` override the file, and CLI
//! flags (applied in `cli::resolve_config`) override everything.

use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ChatResult};

/// Message validation and history paging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSection {
    /// Server-enforced message length cap, in characters (not bytes).
    pub message_cap: usize,
    /// Default number of messages per history page.
    pub page_size: usize,
    /// Hard clamp for caller-supplied page sizes.
    pub max_page_size: usize,
}

impl Default for ChatSection {
    fn default() -> Self {
        Self { message_cap: 2000, page_size: 50, max_page_size: 200 }
    }
}

/// Realtime fan-out tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeSection {
    /// Ring capacity of each per-room broadcast channel. Subscribers that
    /// fall further behind than this see a lag signal instead of the events.
    pub channel_capacity: usize,
    /// How long a typing indicator stays lit without a refresh.
    pub typing_ttl_ms: u64,
}

impl Default for RealtimeSection {
    fn default() -> Self {
        Self { channel_capacity: 256, typing_ttl_ms: 4000 }
    }
}

/// Presence liveness windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceSection {
    /// A connection silent for longer than this is presumed dead.
    pub ttl_secs: u64,
    /// How often the background sweeper prunes silent connections.
    pub sweep_secs: u64,
}

impl PresenceSection {
    pub fn ttl_ms(&self) -> u64 {
        self.ttl_secs.saturating_mul(1000)
    }
}

impl Default for PresenceSection {
    fn default() -> Self {
        Self { ttl_secs: 60, sweep_secs: 20 }
    }
}

/// Optimistic-send confirmation window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SendSection {
    /// A pending send with no echo after this long is marked unconfirmed.
    pub confirm_timeout_ms: u64,
}

impl Default for SendSection {
    fn default() -> Self {
        Self { confirm_timeout_ms: 9000 }
    }
}

/// Channel resubscription policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    /// Attempts before the room view gives up and goes offline.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    /// Ceiling for the doubling backoff delay.
    pub max_delay_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self { max_attempts: 5, initial_delay_ms: 250, max_delay_ms: 5000 }
    }
}

/// WebSocket server binding and storage location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub port: u16,
    /// SQLite database path. `:memory:` selects an ephemeral store.
    pub db_path: String,
    /// How long a fresh connection may sit silent before its hello is due.
    pub hello_timeout_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 9190,
            db_path: "salon.db3".to_string(),
            hello_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub chat: ChatSection,
    pub realtime: RealtimeSection,
    pub presence: PresenceSection,
    pub send: SendSection,
    pub reconnect: ReconnectSection,
    pub server: ServerSection,
}

impl ChatConfig {
    /// Parse a TOML document. Unknown keys are ignored, missing keys fall
    /// back to defaults.
    pub fn from_toml_str(raw: &str) -> ChatResult<Self> {
        let config: ChatConfig =
            toml::from_str(raw).map_err(|e| ChatError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an optional file path, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> ChatResult<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| ChatError::Config(format!("{}: {e}", p.display())))?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(db) = env::var("SALON_CHAT_DB") {
            if !db.is_empty() {
                self.server.db_path = db;
            }
        }
        if let Ok(port) = env::var("SALON_CHAT_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
    }

    fn validate(&self) -> ChatResult<()> {
        if self.chat.message_cap == 0 {
            return Err(ChatError::Config("chat.message_cap must be at least 1".into()));
        }
        if self.chat.page_size == 0 || self.chat.page_size > self.chat.max_page_size {
            return Err(ChatError::Config(
                "chat.page_size must be between 1 and chat.max_page_size".into(),
            ));
        }
        if self.realtime.channel_capacity == 0 {
            return Err(ChatError::Config("realtime.channel_capacity must be at least 1".into()));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ChatError::Config("reconnect.max_attempts must be at least 1".into()));
        }
        if self.server.hello_timeout_ms == 0 {
            return Err(ChatError::Config("server.hello_timeout_ms must be at least 1".into()));
        }
        Ok(())
    }
}
