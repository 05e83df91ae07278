#![allow(dead_code)]

use once_cell::sync::Lazy;

use salon_chat::{Chat, ChatConfig};

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("salon_chat=debug")
        .with_test_writer()
        .try_init();
});

pub fn init() {
    Lazy::force(&TRACING);
}

pub fn chat() -> Chat {
    init();
    Chat::in_memory().expect("in-memory chat")
}

pub fn chat_with(config: ChatConfig) -> Chat {
    init();
    Chat::in_memory_with(config).expect("in-memory chat")
}
