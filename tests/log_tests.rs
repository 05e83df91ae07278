//! Tests for the messages module — append validation, fan-out, and paging.

mod common;

use proptest::prelude::*;
use rstest::rstest;
use uuid::Uuid;

use salon_chat::rooms::RoomKind;
use salon_chat::{ChannelSignal, Chat, ChatConfig, ChatError, Room, RoomEvent, Session};

fn seeded_room(chat: &Chat) -> (Room, Session) {
    let owner = Session::ephemeral("mira");
    let room = chat.gate.create_room(&owner, "lobby", RoomKind::Public).unwrap();
    (room, owner)
}

fn capped_chat(cap: usize) -> Chat {
    let mut config = ChatConfig::default();
    config.chat.message_cap = cap;
    common::chat_with(config)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[rstest]
#[case("")]
#[case("   ")]
#[case("\n\t  \n")]
fn test_blank_content_rejected(#[case] content: &str) {
    let chat = common::chat();
    let (room, owner) = seeded_room(&chat);
    let err = chat.log.append(&owner, room.id, content).unwrap_err();
    assert!(matches!(err, ChatError::EmptyContent));
}

#[test]
fn test_content_is_trimmed_before_storing() {
    let chat = common::chat();
    let (room, owner) = seeded_room(&chat);
    let msg = chat.log.append(&owner, room.id, "  hello there  ").unwrap();
    assert_eq!(msg.content, "hello there");
}

#[test]
fn test_cap_is_inclusive() {
    let chat = capped_chat(5);
    let (room, owner) = seeded_room(&chat);
    assert!(chat.log.append(&owner, room.id, "12345").is_ok());
    match chat.log.append(&owner, room.id, "123456").unwrap_err() {
        ChatError::TooLong { len, max } => {
            assert_eq!(len, 6);
            assert_eq!(max, 5);
        }
        other => panic!("expected TooLong, got {other:?}"),
    }
}

#[test]
fn test_cap_counts_characters_not_bytes() {
    let chat = capped_chat(5);
    let (room, owner) = seeded_room(&chat);
    // Five two-byte characters fit a five-character cap.
    assert!(chat.log.append(&owner, room.id, "ééééé").is_ok());
}

#[test]
fn test_cap_applies_after_trimming() {
    let chat = capped_chat(5);
    let (room, owner) = seeded_room(&chat);
    assert!(chat.log.append(&owner, room.id, "   12345   ").is_ok());
}

#[test]
fn test_append_to_missing_room_fails() {
    let chat = common::chat();
    let owner = Session::ephemeral("mira");
    let err = chat.log.append(&owner, Uuid::new_v4(), "hi").unwrap_err();
    assert!(matches!(err, ChatError::RoomNotFound(_)));
}

#[test]
fn test_private_append_requires_membership() {
    let chat = common::chat();
    let owner = Session::ephemeral("mira");
    let room = chat.gate.create_room(&owner, "salon", RoomKind::Private).unwrap();

    let stranger = Session::ephemeral("drifter");
    let err = chat.log.append(&stranger, room.id, "let me in").unwrap_err();
    assert!(matches!(err, ChatError::Forbidden));
    // The refused write left nothing behind.
    assert!(chat.log.page(room.id, None, 10).unwrap().is_empty());

    // Members write fine.
    let code = room.invite_code.clone().unwrap();
    chat.gate.join_by_invite_code(&stranger, &code).unwrap();
    assert!(chat.log.append(&stranger, room.id, "thanks").is_ok());
}

// ---------------------------------------------------------------------------
// Fan-out and durability
// ---------------------------------------------------------------------------

#[test]
fn test_echo_follows_persist() {
    let chat = common::chat();
    let (room, owner) = seeded_room(&chat);
    let mut sub = chat.hub.subscribe(room.id).unwrap();

    let sent = chat.log.append(&owner, room.id, "first light").unwrap();
    match sub.try_next() {
        Some(ChannelSignal::Event(RoomEvent::Message { message })) => {
            assert_eq!(message.id, sent.id);
            assert_eq!(message.seq, sent.seq);
            assert_eq!(message.content, "first light");
        }
        other => panic!("expected the echo, got {other:?}"),
    }
}

#[test]
fn test_first_public_write_announces_membership_then_message() {
    let chat = common::chat();
    let (room, _owner) = seeded_room(&chat);
    let writer = Session::ephemeral("theo");
    let mut sub = chat.hub.subscribe(room.id).unwrap();

    chat.log.append(&writer, room.id, "hi all").unwrap();

    assert!(matches!(
        sub.try_next(),
        Some(ChannelSignal::Event(RoomEvent::MemberJoined { user_id, .. }))
            if user_id == writer.user_id
    ));
    assert!(matches!(
        sub.try_next(),
        Some(ChannelSignal::Event(RoomEvent::Message { .. }))
    ));
}

#[test]
fn test_append_durable_without_any_subscriber() {
    let chat = common::chat();
    let (room, owner) = seeded_room(&chat);
    // The only listener detaches before the send; the write must not care.
    let sub = chat.hub.subscribe(room.id).unwrap();
    drop(sub);

    let sent = chat.log.append(&owner, room.id, "persisted anyway").unwrap();
    let page = chat.log.page(room.id, None, 10).unwrap();
    assert_eq!(page.last().unwrap().id, sent.id);
}

#[test]
fn test_log_survives_reopen() {
    common::init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chat.db3");
    let mut config = ChatConfig::default();
    config.server.db_path = path.to_string_lossy().into_owned();

    let owner = Session::ephemeral("mira");
    let (room_id, code) = {
        let chat = Chat::open(config.clone()).unwrap();
        let room = chat.gate.create_room(&owner, "salon", RoomKind::Private).unwrap();
        chat.log.append(&owner, room.id, "before the restart").unwrap();
        (room.id, room.invite_code.clone().unwrap())
    };

    let chat = Chat::open(config).unwrap();
    let page = chat.log.page(room_id, None, 10).unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].content, "before the restart");

    // Invite codes survive too.
    let guest = Session::ephemeral("theo");
    assert!(chat.gate.join_by_invite_code(&guest, &code).unwrap().is_new());
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

#[test]
fn test_history_pages_walk_backwards() {
    let chat = common::chat();
    let (room, owner) = seeded_room(&chat);
    for i in 0..15 {
        chat.log.append(&owner, room.id, &format!("m{i}")).unwrap();
    }

    let newest = chat.log.page(room.id, None, 10).unwrap();
    assert_eq!(newest.len(), 10);
    assert_eq!(newest[0].content, "m5");
    assert_eq!(newest[9].content, "m14");

    let older = chat.log.page(room.id, Some(newest[0].id), 10).unwrap();
    assert_eq!(older.len(), 5);
    assert_eq!(older[0].content, "m0");
    assert_eq!(older[4].content, "m4");

    let done = chat.log.page(room.id, Some(older[0].id), 10).unwrap();
    assert!(done.is_empty());
}

#[test]
fn test_pages_are_ascending_for_rendering() {
    let chat = common::chat();
    let (room, owner) = seeded_room(&chat);
    for i in 0..8 {
        chat.log.append(&owner, room.id, &format!("m{i}")).unwrap();
    }
    let page = chat.log.page(room.id, None, 5).unwrap();
    for pair in page.windows(2) {
        assert!(pair[0].seq < pair[1].seq);
    }
}

#[test]
fn test_limit_is_clamped_to_configured_max() {
    let mut config = ChatConfig::default();
    config.chat.page_size = 5;
    config.chat.max_page_size = 5;
    let chat = common::chat_with(config);
    let (room, owner) = seeded_room(&chat);
    for i in 0..10 {
        chat.log.append(&owner, room.id, &format!("m{i}")).unwrap();
    }
    assert_eq!(chat.log.page(room.id, None, 50).unwrap().len(), 5);
}

#[test]
fn test_zero_limit_yields_empty_page() {
    let chat = common::chat();
    let (room, owner) = seeded_room(&chat);
    chat.log.append(&owner, room.id, "hi").unwrap();
    assert!(chat.log.page(room.id, None, 0).unwrap().is_empty());
}

#[test]
fn test_unknown_cursor_yields_empty_page() {
    let chat = common::chat();
    let (room, owner) = seeded_room(&chat);
    chat.log.append(&owner, room.id, "hi").unwrap();
    assert!(chat.log.page(room.id, Some(Uuid::new_v4()), 10).unwrap().is_empty());
}

#[test]
fn test_cursor_does_not_cross_rooms() {
    let chat = common::chat();
    let (room_a, owner) = seeded_room(&chat);
    let room_b = chat.gate.create_room(&owner, "garden", RoomKind::Public).unwrap();
    let in_a = chat.log.append(&owner, room_a.id, "only in a").unwrap();
    chat.log.append(&owner, room_b.id, "only in b").unwrap();

    assert!(chat.log.page(room_b.id, Some(in_a.id), 10).unwrap().is_empty());
}

#[test]
fn test_page_on_missing_room_fails() {
    let chat = common::chat();
    let err = chat.log.page(Uuid::new_v4(), None, 10).unwrap_err();
    assert!(matches!(err, ChatError::RoomNotFound(_)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Walking pages by cursor reconstructs the whole log, in order, with
    /// no duplicates, for any page size.
    #[test]
    fn prop_page_walk_reconstructs_log(count in 0usize..40, page_size in 1usize..20) {
        let chat = common::chat();
        let (room, owner) = seeded_room(&chat);
        let mut expected = Vec::with_capacity(count);
        for i in 0..count {
            expected.push(chat.log.append(&owner, room.id, &format!("m{i}")).unwrap().id);
        }

        let mut batches = Vec::new();
        let mut cursor = None;
        loop {
            let batch = chat.log.page(room.id, cursor, page_size).unwrap();
            if batch.is_empty() {
                break;
            }
            prop_assert!(batch.len() <= page_size);
            cursor = Some(batch[0].id);
            batches.push(batch);
        }

        let mut walked: Vec<Uuid> = Vec::new();
        for batch in batches.iter().rev() {
            walked.extend(batch.iter().map(|m| m.id));
        }
        prop_assert_eq!(walked, expected);
    }
}
