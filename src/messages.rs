//! The append-only message log.
//!
//! `append` is the single write path and the place membership is enforced;
//! nothing ever updates or deletes a message. Fan-out happens after the
//! insert commits, so durability never depends on a live subscriber: a
//! message whose echo nobody saw is still in the next history page.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::channel::{ChannelHub, RoomEvent};
use crate::config::ChatSection;
use crate::error::{ChatError, ChatResult};
use crate::rooms::MembershipGate;
use crate::store::ChatStore;
use crate::{now_ms, Session};

/// One immutable message in a room's log.
///
/// `seq` is the store-assigned ordering key: unique, strictly increasing in
/// insert order, and the cursor for history paging. `created_at` is wall
/// clock and only for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub room_id: Uuid,
    pub author_id: Uuid,
    pub content: String,
    pub created_at: u64,
    pub seq: i64,
}

#[derive(Debug)]
pub struct MessageLog {
    store: Arc<ChatStore>,
    gate: Arc<MembershipGate>,
    hub: Option<Arc<ChannelHub>>,
    cfg: ChatSection,
}

impl MessageLog {
    /// A log with no realtime side. Appends persist but echo nowhere, which
    /// is also how tests starve a controller of confirmations.
    pub fn new(store: Arc<ChatStore>, gate: Arc<MembershipGate>, cfg: ChatSection) -> Self {
        Self { store, gate, hub: None, cfg }
    }

    pub fn attach_hub(&mut self, hub: Arc<ChannelHub>) {
        self.hub = Some(hub);
    }

    /// Validate, persist, then fan out. The message is durable before any
    /// subscriber hears about it.
    pub fn append(&self, session: &Session, room_id: Uuid, content: &str) -> ChatResult<ChatMessage> {
        let room = self
            .store
            .room(room_id)?
            .ok_or(ChatError::RoomNotFound(room_id))?;
        self.gate.authorize_write(session, &room)?;

        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyContent);
        }
        let len = content.chars().count();
        if len > self.cfg.message_cap {
            return Err(ChatError::TooLong { len, max: self.cfg.message_cap });
        }

        let message =
            self.store
                .insert_message(Uuid::new_v4(), room_id, session.user_id, content, now_ms())?;
        debug!(room_id = %room_id, seq = message.seq, "message appended");

        if let Some(hub) = &self.hub {
            hub.publish(room_id, RoomEvent::Message { message: message.clone() });
        }
        Ok(message)
    }

    /// One page of history ending just before `before_id` (or the newest
    /// messages when `None`), returned oldest-first for direct rendering.
    ///
    /// A cursor that no longer resolves in this room yields an empty page
    /// rather than an error. `limit` is clamped to the configured maximum.
    pub fn page(
        &self,
        room_id: Uuid,
        before_id: Option<Uuid>,
        limit: usize,
    ) -> ChatResult<Vec<ChatMessage>> {
        if self.store.room(room_id)?.is_none() {
            return Err(ChatError::RoomNotFound(room_id));
        }
        let limit = limit.min(self.cfg.max_page_size);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let before_seq = match before_id {
            Some(id) => match self.store.message_seq(room_id, id)? {
                Some(seq) => Some(seq),
                None => return Ok(Vec::new()),
            },
            None => None,
        };
        let mut rows = self.store.messages_page(room_id, before_seq, limit)?;
        rows.reverse();
        Ok(rows)
    }

    pub fn default_page_size(&self) -> usize {
        self.cfg.page_size
    }

    pub fn message_cap(&self) -> usize {
        self.cfg.message_cap
    }
}
