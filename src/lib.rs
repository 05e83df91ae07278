pub mod channel;
pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod messages;
pub mod presence;
pub mod rooms;
pub mod server;
pub mod store;

#[cfg(feature = "redis-relay")]
pub mod relay;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use channel::{ChannelHub, ChannelSignal, RoomEvent, Subscription};
pub use config::ChatConfig;
pub use controller::{ControllerUpdate, RoomController, RoomPhase, TimelineEntry};
pub use error::{ChatError, ChatResult};
pub use messages::{ChatMessage, MessageLog};
pub use presence::{PresenceEntry, PresenceTracker};
pub use rooms::{JoinOutcome, MemberRole, Membership, MembershipGate, Room, RoomKind};
pub use store::ChatStore;

// ---------------------------------------------------------------------------
// Session identity
// ---------------------------------------------------------------------------

/// Who is acting, as established by the host's authentication layer.
///
/// This crate never verifies credentials and never reads identity from
/// ambient state: a `Session` travels explicitly through every call where
/// authorship or access matters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: Uuid,
    pub display_name: String,
}

impl Session {
    pub fn new(user_id: Uuid, display_name: impl Into<String>) -> Self {
        Self { user_id, display_name: display_name.into() }
    }

    /// Fresh identity with just a name. Guests, tooling, tests.
    pub fn ephemeral(display_name: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4(), display_name)
    }
}

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Every service a chat deployment needs, wired over one store and one hub.
/// Cloning is cheap; all fields are shared handles.
#[derive(Clone)]
pub struct Chat {
    pub config: Arc<ChatConfig>,
    pub store: Arc<ChatStore>,
    pub hub: Arc<ChannelHub>,
    pub gate: Arc<MembershipGate>,
    pub log: Arc<MessageLog>,
    pub presence: Arc<PresenceTracker>,
}

impl Chat {
    /// Open (or create) the backing database and wire every service.
    pub fn open(config: ChatConfig) -> ChatResult<Self> {
        let store = Arc::new(ChatStore::open(&config.server.db_path)?);
        let hub = Arc::new(ChannelHub::new(config.realtime.channel_capacity));
        let gate = Arc::new(MembershipGate::new(store.clone(), hub.clone()));
        let mut log = MessageLog::new(store.clone(), gate.clone(), config.chat.clone());
        log.attach_hub(hub.clone());
        let presence = Arc::new(PresenceTracker::new(hub.clone(), config.presence.ttl_ms()));
        Ok(Self {
            config: Arc::new(config),
            store,
            hub,
            gate,
            log: Arc::new(log),
            presence,
        })
    }

    /// Ephemeral instance over an in-memory database.
    pub fn in_memory() -> ChatResult<Self> {
        let mut config = ChatConfig::default();
        config.server.db_path = ":memory:".to_string();
        Self::open(config)
    }

    /// Like [`Chat::in_memory`] with custom tuning; the database path is
    /// forced to `:memory:`.
    pub fn in_memory_with(mut config: ChatConfig) -> ChatResult<Self> {
        config.server.db_path = ":memory:".to_string();
        Self::open(config)
    }
}
