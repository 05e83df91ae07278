//! Live-viewer tracking.
//!
//! Presence is reconstructed entirely from live connections and never
//! persisted; being listed here means "connected right now", not "is a
//! member". The arena is keyed by connection id, so a user with three tabs
//! open is one roster entry, and joined/left events fire only on the first
//! and last connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::channel::{ChannelHub, RoomEvent};
use crate::{now_ms, Session};

#[derive(Debug, Clone)]
struct Slot {
    user_id: Uuid,
    display_name: String,
    last_seen_ms: u64,
}

/// One user visible in a room, collapsed across their connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: Uuid,
    pub display_name: String,
    pub last_seen_ms: u64,
}

type Arena = HashMap<Uuid, HashMap<Uuid, Slot>>;

#[derive(Debug)]
pub struct PresenceTracker {
    rooms: Mutex<Arena>,
    hub: Arc<ChannelHub>,
    ttl_ms: u64,
}

impl PresenceTracker {
    pub fn new(hub: Arc<ChannelHub>, ttl_ms: u64) -> Self {
        Self { rooms: Mutex::new(HashMap::new()), hub, ttl_ms }
    }

    fn rooms(&self) -> std::sync::MutexGuard<'_, Arena> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a live connection. Fires `presence_joined` only if this is
    /// the user's first connection in the room.
    pub fn connect(&self, room_id: Uuid, conn_id: Uuid, session: &Session) {
        let first = {
            let mut rooms = self.rooms();
            let conns = rooms.entry(room_id).or_default();
            let first = !conns.values().any(|s| s.user_id == session.user_id);
            conns.insert(
                conn_id,
                Slot {
                    user_id: session.user_id,
                    display_name: session.display_name.clone(),
                    last_seen_ms: now_ms(),
                },
            );
            first
        };
        if first {
            debug!(room_id = %room_id, user_id = %session.user_id, "presence joined");
            self.hub.publish(
                room_id,
                RoomEvent::PresenceJoined {
                    user_id: session.user_id,
                    display_name: session.display_name.clone(),
                },
            );
        }
    }

    /// Refresh a connection's liveness window.
    pub fn touch(&self, room_id: Uuid, conn_id: Uuid) {
        let mut rooms = self.rooms();
        if let Some(slot) = rooms.get_mut(&room_id).and_then(|c| c.get_mut(&conn_id)) {
            slot.last_seen_ms = now_ms();
        }
    }

    /// Drop a connection. Fires `presence_left` only if it was the user's
    /// last one in the room.
    pub fn disconnect(&self, room_id: Uuid, conn_id: Uuid) {
        let departed = {
            let mut rooms = self.rooms();
            let Some(conns) = rooms.get_mut(&room_id) else {
                return;
            };
            let Some(slot) = conns.remove(&conn_id) else {
                return;
            };
            let gone = !conns.values().any(|s| s.user_id == slot.user_id);
            if conns.is_empty() {
                rooms.remove(&room_id);
            }
            gone.then_some(slot.user_id)
        };
        if let Some(user_id) = departed {
            debug!(room_id = %room_id, user_id = %user_id, "presence left");
            self.hub
                .publish(room_id, RoomEvent::PresenceLeft { user_id });
        }
    }

    /// Current viewers, one entry per user, sorted by display name then id
    /// so repeated reads render stably.
    pub fn roster(&self, room_id: Uuid) -> Vec<PresenceEntry> {
        let rooms = self.rooms();
        let Some(conns) = rooms.get(&room_id) else {
            return Vec::new();
        };
        let mut by_user: HashMap<Uuid, PresenceEntry> = HashMap::new();
        for slot in conns.values() {
            let entry = by_user.entry(slot.user_id).or_insert_with(|| PresenceEntry {
                user_id: slot.user_id,
                display_name: slot.display_name.clone(),
                last_seen_ms: slot.last_seen_ms,
            });
            entry.last_seen_ms = entry.last_seen_ms.max(slot.last_seen_ms);
        }
        let mut roster: Vec<PresenceEntry> = by_user.into_values().collect();
        roster.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then(a.user_id.cmp(&b.user_id))
        });
        roster
    }

    pub fn viewer_count(&self, room_id: Uuid) -> usize {
        let rooms = self.rooms();
        let Some(conns) = rooms.get(&room_id) else {
            return 0;
        };
        let mut users: Vec<Uuid> = conns.values().map(|s| s.user_id).collect();
        users.sort();
        users.dedup();
        users.len()
    }

    /// Evict connections silent past the TTL, announcing departures for
    /// users with no connection left. Returns evicted connection count.
    pub fn prune_stale(&self) -> usize {
        self.prune_before(now_ms().saturating_sub(self.ttl_ms))
    }

    /// Evict connections last seen before `cutoff` (epoch ms).
    pub fn prune_before(&self, cutoff: u64) -> usize {
        let mut departures: Vec<(Uuid, Uuid)> = Vec::new();
        let mut evicted = 0;
        {
            let mut rooms = self.rooms();
            for (room_id, conns) in rooms.iter_mut() {
                let stale: Vec<Uuid> = conns
                    .iter()
                    .filter(|(_, s)| s.last_seen_ms < cutoff)
                    .map(|(id, _)| *id)
                    .collect();
                for conn_id in stale {
                    if let Some(slot) = conns.remove(&conn_id) {
                        evicted += 1;
                        if !conns.values().any(|s| s.user_id == slot.user_id) {
                            departures.push((*room_id, slot.user_id));
                        }
                    }
                }
            }
            rooms.retain(|_, conns| !conns.is_empty());
        }
        for (room_id, user_id) in departures {
            debug!(room_id = %room_id, user_id = %user_id, "presence expired");
            self.hub
                .publish(room_id, RoomEvent::PresenceLeft { user_id });
        }
        evicted
    }
}
