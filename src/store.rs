//! SQLite persistence for rooms, memberships, and the message log.
//!
//! One connection behind a mutex. Critical sections are a handful of
//! statements and nothing awaits while the lock is held. Messages take their
//! total order from the `seq` rowid, which SQLite assigns atomically on
//! insert, so two messages can never tie.

use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::ChatResult;
use crate::messages::ChatMessage;
use crate::rooms::{MemberRole, Membership, Room, RoomKind};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS rooms (
    id          TEXT PRIMARY KEY,
    kind        TEXT NOT NULL CHECK (kind IN ('public', 'private')),
    name        TEXT NOT NULL,
    invite_code TEXT UNIQUE,
    created_by  TEXT NOT NULL,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS memberships (
    room_id   TEXT NOT NULL REFERENCES rooms (id),
    user_id   TEXT NOT NULL,
    role      TEXT NOT NULL CHECK (role IN ('member', 'owner')),
    joined_at INTEGER NOT NULL,
    PRIMARY KEY (room_id, user_id)
);

CREATE TABLE IF NOT EXISTS messages (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    id         TEXT NOT NULL UNIQUE,
    room_id    TEXT NOT NULL REFERENCES rooms (id),
    author_id  TEXT NOT NULL,
    content    TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_room_seq ON messages (room_id, seq);
";

#[derive(Debug)]
pub struct ChatStore {
    conn: Mutex<Connection>,
}

impl ChatStore {
    /// Open (or create) the database at `path` and bootstrap the schema.
    /// `:memory:` selects an ephemeral store.
    pub fn open(path: &str) -> ChatResult<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Rooms
    // -----------------------------------------------------------------------

    pub fn insert_room(&self, room: &Room) -> ChatResult<()> {
        self.conn().execute(
            "INSERT INTO rooms (id, kind, name, invite_code, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                room.id.to_string(),
                room.kind.as_str(),
                room.name,
                room.invite_code,
                room.created_by.to_string(),
                room.created_at
            ],
        )?;
        Ok(())
    }

    pub fn room(&self, id: Uuid) -> ChatResult<Option<Room>> {
        let conn = self.conn();
        let room = conn
            .query_row(
                "SELECT id, kind, name, invite_code, created_by, created_at
                 FROM rooms WHERE id = ?1",
                params![id.to_string()],
                row_to_room,
            )
            .optional()?;
        Ok(room)
    }

    pub fn public_rooms(&self) -> ChatResult<Vec<Room>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, kind, name, invite_code, created_by, created_at
             FROM rooms WHERE kind = 'public' ORDER BY created_at, id",
        )?;
        let rooms = stmt.query_map([], row_to_room)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rooms)
    }

    /// `(room id, invite code)` for every private room. The gate compares
    /// codes in constant time, so the lookup cannot be a SQL equality.
    pub fn private_room_codes(&self) -> ChatResult<Vec<(Uuid, String)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, invite_code FROM rooms
             WHERE kind = 'private' AND invite_code IS NOT NULL",
        )?;
        let codes = stmt
            .query_map([], |row| Ok((uuid_col(row, 0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(codes)
    }

    // -----------------------------------------------------------------------
    // Memberships
    // -----------------------------------------------------------------------

    pub fn membership(&self, room_id: Uuid, user_id: Uuid) -> ChatResult<Option<Membership>> {
        let conn = self.conn();
        let membership = conn
            .query_row(
                "SELECT room_id, user_id, role, joined_at FROM memberships
                 WHERE room_id = ?1 AND user_id = ?2",
                params![room_id.to_string(), user_id.to_string()],
                row_to_membership,
            )
            .optional()?;
        Ok(membership)
    }

    /// Insert a membership if absent. Returns the stored row plus whether
    /// this call created it; re-joins keep the original `joined_at` and role.
    pub fn upsert_membership(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        role: MemberRole,
        joined_at: u64,
    ) -> ChatResult<(Membership, bool)> {
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT INTO memberships (room_id, user_id, role, joined_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (room_id, user_id) DO NOTHING",
            params![room_id.to_string(), user_id.to_string(), role.as_str(), joined_at],
        )?;
        let membership = conn.query_row(
            "SELECT room_id, user_id, role, joined_at FROM memberships
             WHERE room_id = ?1 AND user_id = ?2",
            params![room_id.to_string(), user_id.to_string()],
            row_to_membership,
        )?;
        Ok((membership, inserted > 0))
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    pub fn insert_message(
        &self,
        id: Uuid,
        room_id: Uuid,
        author_id: Uuid,
        content: &str,
        created_at: u64,
    ) -> ChatResult<ChatMessage> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO messages (id, room_id, author_id, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.to_string(),
                room_id.to_string(),
                author_id.to_string(),
                content,
                created_at
            ],
        )?;
        let seq = conn.last_insert_rowid();
        Ok(ChatMessage {
            id,
            room_id,
            author_id,
            content: content.to_string(),
            created_at,
            seq,
        })
    }

    pub fn message_seq(&self, room_id: Uuid, id: Uuid) -> ChatResult<Option<i64>> {
        let conn = self.conn();
        let seq = conn
            .query_row(
                "SELECT seq FROM messages WHERE id = ?1 AND room_id = ?2",
                params![id.to_string(), room_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seq)
    }

    /// Up to `limit` messages strictly older than `before_seq` (or the newest
    /// ones when `None`), newest first.
    pub fn messages_page(
        &self,
        room_id: Uuid,
        before_seq: Option<i64>,
        limit: usize,
    ) -> ChatResult<Vec<ChatMessage>> {
        let conn = self.conn();
        let cursor = before_seq.unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(
            "SELECT seq, id, room_id, author_id, content, created_at FROM messages
             WHERE room_id = ?1 AND seq < ?2
             ORDER BY seq DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![room_id.to_string(), cursor, limit as i64], row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn message_count(&self, room_id: Uuid) -> ChatResult<u64> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE room_id = ?1",
            params![room_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn row_to_room(row: &Row<'_>) -> rusqlite::Result<Room> {
    let kind: String = row.get(1)?;
    let kind = RoomKind::parse(&kind).ok_or_else(|| bad_column(1, &kind))?;
    Ok(Room {
        id: uuid_col(row, 0)?,
        kind,
        name: row.get(2)?,
        invite_code: row.get(3)?,
        created_by: uuid_col(row, 4)?,
        created_at: row.get(5)?,
    })
}

fn row_to_membership(row: &Row<'_>) -> rusqlite::Result<Membership> {
    let role: String = row.get(2)?;
    let role = MemberRole::parse(&role).ok_or_else(|| bad_column(2, &role))?;
    Ok(Membership {
        room_id: uuid_col(row, 0)?,
        user_id: uuid_col(row, 1)?,
        role,
        joined_at: row.get(3)?,
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        seq: row.get(0)?,
        id: uuid_col(row, 1)?,
        room_id: uuid_col(row, 2)?,
        author_id: uuid_col(row, 3)?,
        content: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn bad_column(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unrecognized value: {value}").into(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::now_ms;
    use crate::rooms::RoomKind;

    fn store() -> ChatStore {
        ChatStore::open(":memory:").unwrap()
    }

    fn sample_room(kind: RoomKind) -> Room {
        Room {
            id: Uuid::new_v4(),
            kind,
            name: "lounge".to_string(),
            invite_code: match kind {
                RoomKind::Private => Some("ABC123".to_string()),
                RoomKind::Public => None,
            },
            created_by: Uuid::new_v4(),
            created_at: now_ms(),
        }
    }

    #[test]
    fn test_room_round_trip() {
        let store = store();
        let room = sample_room(RoomKind::Private);
        store.insert_room(&room).unwrap();
        let loaded = store.room(room.id).unwrap().unwrap();
        assert_eq!(loaded.id, room.id);
        assert_eq!(loaded.kind, RoomKind::Private);
        assert_eq!(loaded.invite_code.as_deref(), Some("ABC123"));
    }

    #[test]
    fn test_missing_room_is_none() {
        assert!(store().room(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_public_rooms_excludes_private() {
        let store = store();
        store.insert_room(&sample_room(RoomKind::Public)).unwrap();
        store.insert_room(&sample_room(RoomKind::Private)).unwrap();
        let listed = store.public_rooms().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].kind, RoomKind::Public);
    }

    #[test]
    fn test_duplicate_invite_code_rejected() {
        let store = store();
        let a = sample_room(RoomKind::Private);
        let mut b = sample_room(RoomKind::Private);
        b.invite_code = a.invite_code.clone();
        store.insert_room(&a).unwrap();
        assert!(store.insert_room(&b).is_err());
    }

    #[test]
    fn test_membership_upsert_is_idempotent() {
        let store = store();
        let room = sample_room(RoomKind::Public);
        store.insert_room(&room).unwrap();
        let user = Uuid::new_v4();

        let (first, created) =
            store.upsert_membership(room.id, user, MemberRole::Member, 100).unwrap();
        assert!(created);
        assert_eq!(first.joined_at, 100);

        let (second, created) =
            store.upsert_membership(room.id, user, MemberRole::Member, 999).unwrap();
        assert!(!created);
        assert_eq!(second.joined_at, 100);
    }

    #[test]
    fn test_message_seq_is_strictly_increasing() {
        let store = store();
        let room = sample_room(RoomKind::Public);
        store.insert_room(&room).unwrap();
        let author = Uuid::new_v4();

        let mut last = 0;
        for i in 0..5 {
            let msg = store
                .insert_message(Uuid::new_v4(), room.id, author, &format!("m{i}"), now_ms())
                .unwrap();
            assert!(msg.seq > last);
            last = msg.seq;
        }
    }

    #[test]
    fn test_messages_page_newest_first_with_cursor() {
        let store = store();
        let room = sample_room(RoomKind::Public);
        store.insert_room(&room).unwrap();
        let author = Uuid::new_v4();
        let msgs: Vec<ChatMessage> = (0..4)
            .map(|i| {
                store
                    .insert_message(Uuid::new_v4(), room.id, author, &format!("m{i}"), now_ms())
                    .unwrap()
            })
            .collect();

        let newest = store.messages_page(room.id, None, 2).unwrap();
        assert_eq!(newest[0].content, "m3");
        assert_eq!(newest[1].content, "m2");

        let older = store.messages_page(room.id, Some(msgs[2].seq), 10).unwrap();
        assert_eq!(older.len(), 2);
        assert_eq!(older[0].content, "m1");
    }

    #[test]
    fn test_message_seq_scoped_to_room() {
        let store = store();
        let a = sample_room(RoomKind::Public);
        let b = sample_room(RoomKind::Public);
        store.insert_room(&a).unwrap();
        store.insert_room(&b).unwrap();
        let msg = store
            .insert_message(Uuid::new_v4(), a.id, Uuid::new_v4(), "hi", now_ms())
            .unwrap();

        assert_eq!(store.message_seq(a.id, msg.id).unwrap(), Some(msg.seq));
        assert_eq!(store.message_seq(b.id, msg.id).unwrap(), None);
    }
}
