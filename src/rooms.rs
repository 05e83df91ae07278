//! Rooms, memberships, and the gate that enforces them.
//!
//! Two room kinds: public rooms are open to any authenticated user and grant
//! membership implicitly on first write or attach; private rooms ("salons")
//! are joined through a shareable 6-character invite code. Re-joining a room
//! you already belong to is an idempotent success, never an error.

use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{debug, info};
use uuid::Uuid;

use crate::channel::{ChannelHub, RoomEvent};
use crate::error::{ChatError, ChatResult};
use crate::store::ChatStore;
use crate::{now_ms, Session};

pub const INVITE_CODE_LEN: usize = 6;

/// Attempts at a fresh code before giving up on a create. Collisions over a
/// 36^6 space are vanishingly rare, so hitting this means a store fault.
const CODE_RETRIES: usize = 16;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    Public,
    Private,
}

impl RoomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomKind::Public => "public",
            RoomKind::Private => "private",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(RoomKind::Public),
            "private" => Some(RoomKind::Private),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Member,
    Owner,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Member => "member",
            MemberRole::Owner => "owner",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "member" => Some(MemberRole::Member),
            "owner" => Some(MemberRole::Owner),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    pub kind: RoomKind,
    pub name: String,
    /// Present only for private rooms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invite_code: Option<String>,
    pub created_by: Uuid,
    pub created_at: u64,
}

impl Room {
    pub fn is_public(&self) -> bool {
        self.kind == RoomKind::Public
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub role: MemberRole,
    pub joined_at: u64,
}

/// Result of a join attempt that did not fail outright.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    /// A membership row was created by this call.
    Joined(Membership),
    /// The user already belonged to the room; nothing changed.
    AlreadyMember(Membership),
}

impl JoinOutcome {
    pub fn membership(&self) -> &Membership {
        match self {
            JoinOutcome::Joined(m) | JoinOutcome::AlreadyMember(m) => m,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, JoinOutcome::Joined(_))
    }
}

// ---------------------------------------------------------------------------
// Invite codes
// ---------------------------------------------------------------------------

/// Random 6-character uppercase alphanumeric code.
pub fn generate_invite_code() -> String {
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..INVITE_CODE_LEN)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

/// Constant-time code comparison. Length is not secret; the content is.
fn code_matches(supplied: &str, stored: &str) -> bool {
    supplied.len() == stored.len()
        && bool::from(supplied.as_bytes().ct_eq(stored.as_bytes()))
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Decides who may read and write each room, and owns every membership
/// mutation. Nothing else in the crate writes membership rows.
#[derive(Debug)]
pub struct MembershipGate {
    store: Arc<ChatStore>,
    hub: Arc<ChannelHub>,
}

impl MembershipGate {
    pub fn new(store: Arc<ChatStore>, hub: Arc<ChannelHub>) -> Self {
        Self { store, hub }
    }

    /// Create a room owned by `session`. Private rooms get a fresh invite
    /// code, retried on the off chance of a collision.
    pub fn create_room(
        &self,
        session: &Session,
        name: &str,
        kind: RoomKind,
    ) -> ChatResult<Room> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::EmptyContent);
        }
        let now = now_ms();
        let mut attempts = 0;
        let room = loop {
            let room = Room {
                id: Uuid::new_v4(),
                kind,
                name: name.to_string(),
                invite_code: match kind {
                    RoomKind::Private => Some(generate_invite_code()),
                    RoomKind::Public => None,
                },
                created_by: session.user_id,
                created_at: now,
            };
            match self.store.insert_room(&room) {
                Ok(()) => break room,
                Err(ChatError::Storage(e)) if is_constraint(&e) && attempts < CODE_RETRIES => {
                    attempts += 1;
                    debug!(attempts, "invite code collision, regenerating");
                }
                Err(e) => return Err(e),
            }
        };
        self.store
            .upsert_membership(room.id, session.user_id, MemberRole::Owner, now)?;
        info!(room_id = %room.id, kind = kind.as_str(), "room created");
        Ok(room)
    }

    /// Fetch a room or fail with a not-found error.
    pub fn room(&self, room_id: Uuid) -> ChatResult<Room> {
        self.store
            .room(room_id)?
            .ok_or(ChatError::RoomNotFound(room_id))
    }

    pub fn list_public_rooms(&self) -> ChatResult<Vec<Room>> {
        self.store.public_rooms()
    }

    /// Whether `session` may see the room's messages and roster.
    pub fn can_read(&self, session: &Session, room: &Room) -> ChatResult<bool> {
        if room.is_public() {
            return Ok(true);
        }
        Ok(self.store.membership(room.id, session.user_id)?.is_some())
    }

    /// Whether `session` may post. Public rooms admit any authenticated user;
    /// the membership row is materialized at write time.
    pub fn can_write(&self, session: &Session, room: &Room) -> ChatResult<bool> {
        self.can_read(session, room)
    }

    /// Enter a public room, materializing the implicit membership. Private
    /// rooms refuse: they are only entered through an invite code.
    pub fn enter_public(&self, session: &Session, room_id: Uuid) -> ChatResult<JoinOutcome> {
        let room = self.room(room_id)?;
        if !room.is_public() {
            return Err(ChatError::Forbidden);
        }
        let (membership, created) = self.store.upsert_membership(
            room.id,
            session.user_id,
            MemberRole::Member,
            now_ms(),
        )?;
        if created {
            self.announce_member(&room, session, membership.joined_at);
            Ok(JoinOutcome::Joined(membership))
        } else {
            Ok(JoinOutcome::AlreadyMember(membership))
        }
    }

    /// Redeem an invite code. Codes are case-insensitive on entry and
    /// compared in constant time against every stored code.
    pub fn join_by_invite_code(
        &self,
        session: &Session,
        code: &str,
    ) -> ChatResult<JoinOutcome> {
        let supplied = code.trim().to_ascii_uppercase();
        let mut matched = None;
        for (room_id, stored) in self.store.private_room_codes()? {
            if code_matches(&supplied, &stored) {
                matched = Some(room_id);
            }
        }
        let room_id = matched.ok_or(ChatError::InvalidCode)?;
        let room = self.room(room_id)?;
        let (membership, created) = self.store.upsert_membership(
            room.id,
            session.user_id,
            MemberRole::Member,
            now_ms(),
        )?;
        if created {
            info!(room_id = %room.id, user_id = %session.user_id, "joined by invite code");
            self.announce_member(&room, session, membership.joined_at);
            Ok(JoinOutcome::Joined(membership))
        } else {
            Ok(JoinOutcome::AlreadyMember(membership))
        }
    }

    /// Write-path enforcement for the message log. Public rooms upsert the
    /// implicit membership; private rooms require an existing row.
    pub(crate) fn authorize_write(&self, session: &Session, room: &Room) -> ChatResult<()> {
        if room.is_public() {
            let (membership, created) = self.store.upsert_membership(
                room.id,
                session.user_id,
                MemberRole::Member,
                now_ms(),
            )?;
            if created {
                self.announce_member(room, session, membership.joined_at);
            }
            return Ok(());
        }
        match self.store.membership(room.id, session.user_id)? {
            Some(_) => Ok(()),
            None => Err(ChatError::Forbidden),
        }
    }

    fn announce_member(&self, room: &Room, session: &Session, joined_at: u64) {
        self.hub.publish(
            room.id,
            RoomEvent::MemberJoined {
                room_id: room.id,
                user_id: session.user_id,
                display_name: session.display_name.clone(),
                joined_at,
            },
        );
    }
}

fn is_constraint(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
