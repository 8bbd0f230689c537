//! Property-based wire-format tests.
//!
//! Uses proptest to verify:
//! 1. Any valid `ServerEvent` survives serialize → `parse_event` as a
//!    recognized envelope.
//! 2. An envelope with an unrecognized `type` is forwarded as
//!    `Envelope::Unknown`, never dropped and never an error.
//! 3. Arbitrary text never causes a panic in `parse_event` (returns `Err`
//!    gracefully).
//! 4. Any valid `Message` survives a JSON round-trip.

use proptest::prelude::*;

use chatloop_proto::event::{CompletionMetadata, Envelope, ServerEvent, parse_event};
use chatloop_proto::message::{
    Attachment, Chunk, ConversationId, Message, MessageId, MessageStatus, Role, Timestamp,
};

// --- Arbitrary implementations for protocol types ---

/// Strategy for generating arbitrary backend-issued `MessageId` values.
fn arb_message_id() -> impl Strategy<Value = MessageId> {
    "[a-zA-Z0-9_-]{1,32}".prop_map(MessageId::new)
}

/// Strategy for generating arbitrary `ConversationId` values.
fn arb_conversation_id() -> impl Strategy<Value = ConversationId> {
    "[a-zA-Z0-9_-]{1,32}".prop_map(ConversationId::new)
}

/// Strategy for generating arbitrary `CompletionMetadata`.
fn arb_metadata() -> impl Strategy<Value = CompletionMetadata> {
    (
        prop::option::of(any::<u64>()),
        prop::option::of(any::<u64>()),
        prop::option::of(any::<bool>()),
    )
        .prop_map(|(tokens, processing_time_ms, cached)| CompletionMetadata {
            tokens,
            processing_time_ms,
            cached,
        })
}

/// Strategy for generating every recognized channel event.
fn arb_server_event() -> impl Strategy<Value = ServerEvent> {
    prop_oneof![
        prop::option::of("[^\x00]{0,64}")
            .prop_map(|message| ServerEvent::Connection { message }),
        (arb_message_id(), "[^\x00]{0,256}")
            .prop_map(|(message_id, content)| ServerEvent::Chunk { message_id, content }),
        (arb_message_id(), prop::collection::vec("[^\x00]{1,64}", 0..4))
            .prop_map(|(message_id, sources)| ServerEvent::Sources { message_id, sources }),
        prop::option::of(arb_message_id())
            .prop_map(|message_id| ServerEvent::ProcessingStarted { message_id }),
        (arb_message_id(), prop::option::of(arb_metadata())).prop_map(
            |(message_id, metadata)| ServerEvent::ProcessingCompleted { message_id, metadata }
        ),
        (prop::option::of(arb_message_id()), "[^\x00]{1,128}")
            .prop_map(|(message_id, error)| ServerEvent::Error { message_id, error }),
        ("[a-z0-9]{1,16}", any::<bool>())
            .prop_map(|(user_id, is_typing)| ServerEvent::Typing { user_id, is_typing }),
        Just(ServerEvent::Pong),
    ]
}

/// Strategy for a `type` discriminant the engine does not recognize.
fn arb_unknown_type() -> impl Strategy<Value = String> {
    "[a-z_]{1,24}".prop_filter("must not collide with a recognized type", |kind| {
        !ServerEvent::KNOWN_TYPES.contains(&kind.as_str())
    })
}

/// Strategy for generating arbitrary `Chunk` values. Scores are derived
/// from small integers so equality survives the JSON round-trip.
fn arb_chunk() -> impl Strategy<Value = Chunk> {
    (
        "[^\x00]{0,128}",
        prop::option::of("[^\x00]{1,64}"),
        prop::option::of((0u32..=1000).prop_map(|n| f64::from(n) / 1000.0)),
    )
        .prop_map(|(content, source, score)| Chunk {
            content,
            source,
            score,
        })
}

/// Strategy for generating arbitrary `Attachment` values.
fn arb_attachment() -> impl Strategy<Value = Attachment> {
    (
        "[a-z0-9._-]{1,32}",
        "[a-z]{1,10}/[a-z0-9.+-]{1,20}",
        any::<u64>(),
        prop::option::of("[a-z0-9/-]{1,48}"),
    )
        .prop_map(|(file_name, content_type, size, object_key)| Attachment {
            file_name,
            content_type,
            size,
            object_key,
        })
}

/// Strategy for generating arbitrary `Role` values.
fn arb_role() -> impl Strategy<Value = Role> {
    prop_oneof![Just(Role::User), Just(Role::Assistant), Just(Role::System)]
}

/// Strategy for generating arbitrary `MessageStatus` values.
fn arb_status() -> impl Strategy<Value = MessageStatus> {
    prop_oneof![
        Just(MessageStatus::Pending),
        Just(MessageStatus::Processing),
        Just(MessageStatus::Completed),
        Just(MessageStatus::Failed),
    ]
}

/// Strategy for generating arbitrary `Message` values.
fn arb_message() -> impl Strategy<Value = Message> {
    (
        (
            arb_message_id(),
            prop::option::of(arb_conversation_id()),
            arb_role(),
            "[^\x00]{0,256}",
            arb_status(),
            prop::collection::vec("[^\x00]{1,64}", 0..3),
            prop::collection::vec(arb_chunk(), 0..3),
            prop::collection::vec(arb_attachment(), 0..3),
        ),
        (
            any::<u64>(),
            any::<u64>(),
            any::<bool>(),
            prop::option::of("[^\x00]{1,96}"),
            any::<u64>().prop_map(Timestamp::from_millis),
            any::<u64>().prop_map(Timestamp::from_millis),
        ),
    )
        .prop_map(
            |(
                (id, conversation_id, role, content, status, sources, chunks, attachments),
                (tokens, processing_time_ms, cached, error_message, created_at, updated_at),
            )| Message {
                id,
                conversation_id,
                role,
                content,
                status,
                sources,
                chunks,
                attachments,
                tokens,
                processing_time_ms,
                cached,
                error_message,
                created_at,
                updated_at,
            },
        )
}

proptest! {
    /// Every recognized event survives a serialize → parse round-trip.
    #[test]
    fn server_events_survive_a_frame_round_trip(event in arb_server_event()) {
        let frame = serde_json::to_string(&event).unwrap();
        let envelope = parse_event(&frame).unwrap();
        prop_assert_eq!(envelope, Envelope::Known(event));
    }

    /// An unrecognized `type` is forwarded with its full payload rather
    /// than dropped or rejected.
    #[test]
    fn unrecognized_types_are_forwarded_with_payload(
        kind in arb_unknown_type(),
        remaining in any::<u32>(),
    ) {
        let payload = serde_json::json!({ "type": kind, "remaining": remaining });
        let frame = payload.to_string();
        let envelope = parse_event(&frame).unwrap();
        prop_assert_eq!(envelope, Envelope::Unknown(payload));
    }

    /// Arbitrary text never panics the frame parser.
    #[test]
    fn arbitrary_text_never_panics_the_parser(text in "[^\x00]{0,512}") {
        let _ = parse_event(&text);
    }

    /// Arbitrary JSON objects never panic the frame parser, whatever
    /// their `type` field holds.
    #[test]
    fn arbitrary_objects_never_panic_the_parser(
        kind in prop::option::of("[^\x00]{0,32}"),
        extra in any::<i64>(),
    ) {
        let frame = match kind {
            Some(kind) => serde_json::json!({ "type": kind, "extra": extra }).to_string(),
            None => serde_json::json!({ "extra": extra }).to_string(),
        };
        let _ = parse_event(&frame);
    }

    /// Any valid message survives a JSON round-trip.
    #[test]
    fn messages_survive_a_json_round_trip(message in arb_message()) {
        let json = serde_json::to_string(&message).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(back, message);
    }
}
