use clap::Parser;
use colored::*;
use uuid::Uuid;

use salon_chat::cli::{resolve_config, Args};
use salon_chat::rooms::RoomKind;
use salon_chat::{server, Chat, ChatResult, Session};

#[tokio::main]
async fn main() -> ChatResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = resolve_config(&args)?;
    let chat = Chat::open(config)?;

    if args.list_rooms {
        let rooms = chat.gate.list_public_rooms()?;
        if rooms.is_empty() {
            println!("{}", "no public rooms yet".bright_black());
        }
        for room in rooms {
            println!("{}  {}", room.id, room.name);
        }
        return Ok(());
    }

    if let Some(name) = &args.create_room {
        let operator = Session::new(
            args.as_user.unwrap_or_else(Uuid::new_v4),
            args.as_name.clone(),
        );
        let kind = if args.private { RoomKind::Private } else { RoomKind::Public };
        let room = chat.gate.create_room(&operator, name, kind)?;
        println!("{} {}", "room id:".bright_green(), room.id);
        if let Some(code) = &room.invite_code {
            println!("{} {}", "invite code:".bright_yellow(), code);
        }
        return Ok(());
    }

    #[cfg(feature = "redis-relay")]
    if let Some(url) = &args.relay {
        let relay = salon_chat::relay::RedisRelay::new(url, chat.hub.clone())?;
        tokio::spawn(async move {
            if let Err(e) = relay.run().await {
                tracing::error!(error = %e, "redis relay exited");
            }
        });
        eprintln!("{}", format!("  relay: {url}").bright_blue());
    }

    let bind = chat.config.server.bind.clone();
    let port = chat.config.server.port;
    eprintln!();
    eprintln!(
        "{}",
        format!("  salon-chat v{}", env!("CARGO_PKG_VERSION"))
            .bright_green()
            .bold()
    );
    eprintln!("{}", format!("  listening on ws://{bind}:{port}").bright_green());
    eprintln!("{}", "  Ctrl+C to stop".bright_blue());
    eprintln!();

    server::serve(chat, &bind, port).await
}
