//! Property tests for the wire codec: encode/decode round-trips over
//! generated documents and messages, and chunked-feed equivalence for the
//! push decoder.

use proptest::prelude::*;

use mongogate::bson::{Document, Value};
use mongogate::codec::{encode, Decoder, DecoderCallbacks, MessageDecoder};
use mongogate::message::{
    GetMoreMessage, InsertMessage, KillCursorsMessage, Message, QueryMessage, ReplyMessage,
};
use mongogate::WatermarkBuffer;

#[derive(Default)]
struct CollectingCallbacks {
    messages: Vec<Message>,
}

impl DecoderCallbacks for CollectingCallbacks {
    fn decode_query(&mut self, message: QueryMessage) {
        self.messages.push(Message::Query(message));
    }
    fn decode_get_more(&mut self, message: GetMoreMessage) {
        self.messages.push(Message::GetMore(message));
    }
    fn decode_insert(&mut self, message: InsertMessage) {
        self.messages.push(Message::Insert(message));
    }
    fn decode_kill_cursors(&mut self, message: KillCursorsMessage) {
        self.messages.push(Message::KillCursors(message));
    }
    fn decode_reply(&mut self, message: ReplyMessage) {
        self.messages.push(Message::Reply(message));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Strategies
// ─────────────────────────────────────────────────────────────────────────────

fn arb_key() -> impl Strategy<Value = String> {
    "[a-zA-Z_$][a-zA-Z0-9_]{0,8}"
}

fn arb_text() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 .,:/-]{0,12}"
}

fn document_from(elements: Vec<(String, Value)>) -> Document {
    elements
        .into_iter()
        .fold(Document::new(), |doc, (key, value)| doc.add(key, value))
}

fn array_from(values: Vec<Value>) -> Document {
    values
        .into_iter()
        .enumerate()
        .fold(Document::new(), |doc, (index, value)| {
            doc.add(index.to_string(), value)
        })
}

fn arb_scalar_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        (-1.0e9f64..1.0e9).prop_map(Value::Double),
        arb_text().prop_map(Value::String),
        any::<i32>().prop_map(Value::Int32),
        any::<i64>().prop_map(Value::Int64),
        any::<bool>().prop_map(Value::Boolean),
        any::<i64>().prop_map(Value::Datetime),
        any::<u64>().prop_map(Value::Timestamp),
        arb_text().prop_map(Value::Symbol),
    ]
}

fn arb_special_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        Just(Value::MinKey),
        Just(Value::MaxKey),
        proptest::array::uniform12(any::<u8>()).prop_map(Value::ObjectId),
        (arb_text(), "[imsx]{0,3}").prop_map(|(pattern, options)| Value::Regex {
            pattern,
            options
        }),
        (any::<u8>(), proptest::collection::vec(any::<u8>(), 0..16))
            .prop_map(|(subtype, data)| Value::Binary { subtype, data }),
    ]
}

fn arb_leaf_value() -> impl Strategy<Value = Value> {
    prop_oneof![arb_scalar_value(), arb_special_value()]
}

fn arb_value() -> impl Strategy<Value = Value> {
    arb_leaf_value().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            proptest::collection::vec((arb_key(), inner.clone()), 0..4)
                .prop_map(|elements| Value::Document(document_from(elements))),
            proptest::collection::vec(inner, 0..4)
                .prop_map(|values| Value::Array(array_from(values))),
        ]
    })
}

fn arb_document() -> impl Strategy<Value = Document> {
    proptest::collection::vec((arb_key(), arb_value()), 0..5).prop_map(document_from)
}

fn arb_namespace() -> impl Strategy<Value = String> {
    "db\\.[a-z]{1,8}"
}

fn arb_query() -> impl Strategy<Value = Message> {
    (
        any::<i32>(),
        prop::bits::u32::masked(0b111_0010),
        arb_namespace(),
        any::<i32>(),
        any::<i32>(),
        arb_document(),
        proptest::option::of(arb_document()),
    )
        .prop_map(
            |(
                request_id,
                flags,
                full_collection_name,
                number_to_skip,
                number_to_return,
                query,
                return_fields_selector,
            )| {
                Message::Query(QueryMessage {
                    request_id,
                    response_to: 0,
                    flags,
                    full_collection_name,
                    number_to_skip,
                    number_to_return,
                    query,
                    return_fields_selector,
                })
            },
        )
}

fn arb_get_more() -> impl Strategy<Value = Message> {
    (any::<i32>(), arb_namespace(), any::<i32>(), any::<i64>()).prop_map(
        |(request_id, full_collection_name, number_to_return, cursor_id)| {
            Message::GetMore(GetMoreMessage {
                request_id,
                response_to: 0,
                full_collection_name,
                number_to_return,
                cursor_id,
            })
        },
    )
}

fn arb_insert() -> impl Strategy<Value = Message> {
    (
        any::<i32>(),
        any::<u32>(),
        arb_namespace(),
        proptest::collection::vec(arb_document(), 1..3),
    )
        .prop_map(|(request_id, flags, full_collection_name, documents)| {
            Message::Insert(InsertMessage {
                request_id,
                response_to: 0,
                flags: flags & 1,
                full_collection_name,
                documents,
            })
        })
}

fn arb_kill_cursors() -> impl Strategy<Value = Message> {
    (any::<i32>(), proptest::collection::vec(any::<i64>(), 0..4)).prop_map(
        |(request_id, cursor_ids)| {
            Message::KillCursors(KillCursorsMessage {
                request_id,
                response_to: 0,
                cursor_ids,
            })
        },
    )
}

fn arb_reply() -> impl Strategy<Value = Message> {
    (
        any::<i32>(),
        any::<i32>(),
        prop::bits::u32::masked(0b11),
        any::<i64>(),
        any::<i32>(),
        proptest::collection::vec(arb_document(), 0..3),
    )
        .prop_map(
            |(request_id, response_to, flags, cursor_id, starting_from, documents)| {
                Message::Reply(ReplyMessage {
                    request_id,
                    response_to,
                    flags,
                    cursor_id,
                    starting_from,
                    number_returned: documents.len() as i32,
                    documents,
                })
            },
        )
}

fn arb_message() -> impl Strategy<Value = Message> {
    prop_oneof![
        arb_query(),
        arb_get_more(),
        arb_insert(),
        arb_kill_cursors(),
        arb_reply(),
    ]
}

fn decode_all(wire: &[u8]) -> Vec<Message> {
    let mut buffer = WatermarkBuffer::default();
    buffer.add(wire);
    let mut decoder = MessageDecoder::new();
    let mut callbacks = CollectingCallbacks::default();
    decoder.on_data(&mut buffer, &mut callbacks).unwrap();
    assert_eq!(buffer.len(), 0, "decoder left bytes behind");
    callbacks.messages
}

// ─────────────────────────────────────────────────────────────────────────────
// Properties
// ─────────────────────────────────────────────────────────────────────────────

proptest! {
    /// BSON documents survive an encode/decode round trip, and canonical
    /// bytes survive a decode/encode round trip.
    #[test]
    fn bson_round_trip(document in arb_document()) {
        let bytes = document.to_bytes();
        prop_assert_eq!(bytes.len(), document.byte_size());

        let decoded = Document::from_bytes(&bytes).unwrap();
        prop_assert_eq!(&decoded, &document);
        prop_assert_eq!(decoded.to_bytes(), bytes);
    }

    /// Any message survives an encode/decode round trip.
    #[test]
    fn message_round_trip(message in arb_message()) {
        let wire = encode(&message);
        let decoded = decode_all(&wire);
        prop_assert_eq!(decoded, vec![message]);
    }

    /// Feeding a stream byte-by-byte produces the same callback sequence as
    /// feeding it in one call.
    #[test]
    fn chunked_feed_matches_single_feed(messages in proptest::collection::vec(arb_message(), 1..4)) {
        let mut wire = Vec::new();
        for message in &messages {
            wire.extend_from_slice(&encode(message));
        }

        let single = decode_all(&wire);

        let mut buffer = WatermarkBuffer::default();
        let mut decoder = MessageDecoder::new();
        let mut callbacks = CollectingCallbacks::default();
        for byte in &wire {
            buffer.add(std::slice::from_ref(byte));
            decoder.on_data(&mut buffer, &mut callbacks).unwrap();
        }

        prop_assert_eq!(&callbacks.messages, &single);
        prop_assert_eq!(&callbacks.messages, &messages);
        prop_assert_eq!(buffer.len(), 0);
    }
}
