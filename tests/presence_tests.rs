//! Tests for the presence module — connection tracking, rosters, and pruning.

mod common;

use std::thread::sleep;
use std::time::Duration;

use uuid::Uuid;

use salon_chat::rooms::RoomKind;
use salon_chat::{now_ms, ChannelSignal, Chat, Room, RoomEvent, Session};

fn seeded_room(chat: &Chat) -> (Room, Session) {
    let owner = Session::ephemeral("mira");
    let room = chat.gate.create_room(&owner, "lobby", RoomKind::Public).unwrap();
    (room, owner)
}

// ---------------------------------------------------------------------------
// Joining and leaving
// ---------------------------------------------------------------------------

#[test]
fn test_first_connection_announces_joined() {
    let chat = common::chat();
    let (room, _) = seeded_room(&chat);
    let viewer = Session::ephemeral("theo");
    let mut sub = chat.hub.subscribe(room.id).unwrap();

    chat.presence.connect(room.id, Uuid::new_v4(), &viewer);

    match sub.try_next() {
        Some(ChannelSignal::Event(RoomEvent::PresenceJoined { user_id, display_name })) => {
            assert_eq!(user_id, viewer.user_id);
            assert_eq!(display_name, "theo");
        }
        other => panic!("expected presence_joined, got {other:?}"),
    }
}

#[test]
fn test_second_tab_is_silent() {
    let chat = common::chat();
    let (room, _) = seeded_room(&chat);
    let viewer = Session::ephemeral("theo");
    chat.presence.connect(room.id, Uuid::new_v4(), &viewer);

    let mut sub = chat.hub.subscribe(room.id).unwrap();
    chat.presence.connect(room.id, Uuid::new_v4(), &viewer);
    assert!(sub.try_next().is_none());
}

#[test]
fn test_leave_announced_only_when_last_tab_closes() {
    let chat = common::chat();
    let (room, _) = seeded_room(&chat);
    let viewer = Session::ephemeral("theo");
    let tab_a = Uuid::new_v4();
    let tab_b = Uuid::new_v4();
    chat.presence.connect(room.id, tab_a, &viewer);
    chat.presence.connect(room.id, tab_b, &viewer);

    let mut sub = chat.hub.subscribe(room.id).unwrap();
    chat.presence.disconnect(room.id, tab_a);
    assert!(sub.try_next().is_none());

    chat.presence.disconnect(room.id, tab_b);
    assert!(matches!(
        sub.try_next(),
        Some(ChannelSignal::Event(RoomEvent::PresenceLeft { user_id }))
            if user_id == viewer.user_id
    ));
}

#[test]
fn test_disconnect_of_unknown_connection_is_quiet() {
    let chat = common::chat();
    let (room, _) = seeded_room(&chat);
    let mut sub = chat.hub.subscribe(room.id).unwrap();
    chat.presence.disconnect(room.id, Uuid::new_v4());
    assert!(sub.try_next().is_none());
}

// ---------------------------------------------------------------------------
// Roster
// ---------------------------------------------------------------------------

#[test]
fn test_roster_collapses_tabs_to_one_entry() {
    let chat = common::chat();
    let (room, _) = seeded_room(&chat);
    let viewer = Session::ephemeral("theo");
    chat.presence.connect(room.id, Uuid::new_v4(), &viewer);
    chat.presence.connect(room.id, Uuid::new_v4(), &viewer);

    let roster = chat.presence.roster(room.id);
    assert_eq!(roster.len(), 1);
    assert_eq!(roster[0].user_id, viewer.user_id);
    assert_eq!(chat.presence.viewer_count(room.id), 1);
}

#[test]
fn test_roster_sorted_by_display_name() {
    let chat = common::chat();
    let (room, _) = seeded_room(&chat);
    for name in ["zoe", "abe", "mira"] {
        chat.presence
            .connect(room.id, Uuid::new_v4(), &Session::ephemeral(name));
    }

    let roster = chat.presence.roster(room.id);
    let names: Vec<&str> = roster.iter().map(|e| e.display_name.as_str()).collect();
    assert_eq!(names, ["abe", "mira", "zoe"]);
}

#[test]
fn test_empty_room_has_no_roster() {
    let chat = common::chat();
    let (room, _) = seeded_room(&chat);
    assert!(chat.presence.roster(room.id).is_empty());
    assert_eq!(chat.presence.viewer_count(room.id), 0);
}

#[test]
fn test_rooms_do_not_share_presence() {
    let chat = common::chat();
    let (room_a, owner) = seeded_room(&chat);
    let room_b = chat.gate.create_room(&owner, "garden", RoomKind::Public).unwrap();
    chat.presence
        .connect(room_a.id, Uuid::new_v4(), &Session::ephemeral("theo"));

    assert_eq!(chat.presence.viewer_count(room_a.id), 1);
    assert_eq!(chat.presence.viewer_count(room_b.id), 0);
}

// ---------------------------------------------------------------------------
// Heartbeats and pruning
// ---------------------------------------------------------------------------

#[test]
fn test_stale_connection_is_pruned() {
    let chat = common::chat();
    let (room, _) = seeded_room(&chat);
    let stale = Session::ephemeral("ghost");
    chat.presence.connect(room.id, Uuid::new_v4(), &stale);

    sleep(Duration::from_millis(5));
    let cutoff = now_ms();
    let fresh = Session::ephemeral("theo");
    chat.presence.connect(room.id, Uuid::new_v4(), &fresh);

    let mut sub = chat.hub.subscribe(room.id).unwrap();
    assert_eq!(chat.presence.prune_before(cutoff), 1);

    assert!(matches!(
        sub.try_next(),
        Some(ChannelSignal::Event(RoomEvent::PresenceLeft { user_id }))
            if user_id == stale.user_id
    ));
    let roster = chat.presence.roster(room.id);
    assert_eq!(roster.len(), 1);
    assert_eq!(roster[0].user_id, fresh.user_id);
}

#[test]
fn test_prune_keeps_user_with_one_live_tab() {
    let chat = common::chat();
    let (room, _) = seeded_room(&chat);
    let viewer = Session::ephemeral("theo");
    chat.presence.connect(room.id, Uuid::new_v4(), &viewer);

    sleep(Duration::from_millis(5));
    let cutoff = now_ms();
    chat.presence.connect(room.id, Uuid::new_v4(), &viewer);

    let mut sub = chat.hub.subscribe(room.id).unwrap();
    assert_eq!(chat.presence.prune_before(cutoff), 1);

    // One tab died, but the user is still here.
    assert!(sub.try_next().is_none());
    assert_eq!(chat.presence.viewer_count(room.id), 1);
}

#[test]
fn test_heartbeat_keeps_connection_alive() {
    let chat = common::chat();
    let (room, _) = seeded_room(&chat);
    let viewer = Session::ephemeral("theo");
    let conn = Uuid::new_v4();
    chat.presence.connect(room.id, conn, &viewer);

    sleep(Duration::from_millis(5));
    let cutoff = now_ms();
    chat.presence.touch(room.id, conn);

    assert_eq!(chat.presence.prune_before(cutoff), 0);
    assert_eq!(chat.presence.viewer_count(room.id), 1);
}
