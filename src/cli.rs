use std::path::PathBuf;

use clap::Parser;
use uuid::Uuid;

use crate::config::ChatConfig;
use crate::error::ChatResult;

#[derive(Parser, Debug)]
#[command(name = "salon-chat")]
#[command(version)]
#[command(about = "Membership-gated realtime chat rooms with presence and invite codes")]
pub struct Args {
    /// Path to a TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// SQLite database path (`:memory:` for an ephemeral store)
    #[arg(long)]
    pub db: Option<String>,

    /// Bind address for the server
    #[arg(long)]
    pub bind: Option<String>,

    /// Port for the server
    #[arg(long)]
    pub port: Option<u16>,

    /// Create a room with this name, print it, and exit
    #[arg(long, value_name = "NAME")]
    pub create_room: Option<String>,

    /// Make the created room private (invite-code gated)
    #[arg(long)]
    pub private: bool,

    /// List public rooms and exit
    #[arg(long)]
    pub list_rooms: bool,

    /// User id to attribute --create-room to (random when omitted)
    #[arg(long)]
    pub as_user: Option<Uuid>,

    /// Display name for --create-room attribution
    #[arg(long, default_value = "operator")]
    pub as_name: String,

    /// Redis URL for the cross-process event relay
    #[cfg(feature = "redis-relay")]
    #[arg(long, value_name = "URL")]
    pub relay: Option<String>,
}

/// Layer the config sources: file (or defaults), then environment, then
/// whatever flags were given.
pub fn resolve_config(args: &Args) -> ChatResult<ChatConfig> {
    let mut config = ChatConfig::load(args.config.as_deref())?;
    if let Some(db) = &args.db {
        config.server.db_path = db.clone();
    }
    if let Some(bind) = &args.bind {
        config.server.bind = bind.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    Ok(config)
}
