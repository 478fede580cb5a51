//! MongoDB wire-protocol codec.
//!
//! [`MessageDecoder`] is a push-style state machine over a caller-owned
//! buffer: feed bytes as they arrive and each completed message is handed to
//! a [`DecoderCallbacks`] implementation in wire order. Incomplete input is
//! never consumed past a parse point, so feeding a stream byte-by-byte
//! produces the same callback sequence as feeding it whole.
//!
//! One decoder instance serves either direction of a connection; the op-code
//! distinguishes requests from replies and no partial message survives a
//! completed parse, so request and reply buffers cannot interleave framing
//! state.
//!
//! Structural violations (runt or oversized length fields, unknown op-codes,
//! malformed BSON) surface as [`DecodeError`] and are fatal for the stream;
//! the caller decides the connection's fate.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::bson::{Document, SliceReader};
use crate::buffer::WatermarkBuffer;
use crate::error::DecodeError;
use crate::message::{
    GetMoreMessage, InsertMessage, KillCursorsMessage, Message, OpCode, QueryMessage,
    ReplyMessage, MESSAGE_HEADER_SIZE,
};

/// Default cap on a single wire message, matching MongoDB's maximum
/// accepted message size.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 48 * 1024 * 1024;

/// Per-op-code delivery of decoded messages.
pub trait DecoderCallbacks {
    /// A complete OP_QUERY was decoded.
    fn decode_query(&mut self, message: QueryMessage);
    /// A complete OP_GET_MORE was decoded.
    fn decode_get_more(&mut self, message: GetMoreMessage);
    /// A complete OP_INSERT was decoded.
    fn decode_insert(&mut self, message: InsertMessage);
    /// A complete OP_KILL_CURSORS was decoded.
    fn decode_kill_cursors(&mut self, message: KillCursorsMessage);
    /// A complete OP_REPLY was decoded.
    fn decode_reply(&mut self, message: ReplyMessage);
}

/// Push decoder over a byte stream.
///
/// Abstracted so the proxy filter can be driven by a scripted double in
/// tests; [`MessageDecoder`] is the production implementation.
pub trait Decoder {
    /// Consume as many complete messages from `buffer` as are available,
    /// delivering each through `callbacks`. Returns without consuming when
    /// the next message is incomplete.
    fn on_data(
        &mut self,
        buffer: &mut WatermarkBuffer,
        callbacks: &mut dyn DecoderCallbacks,
    ) -> Result<(), DecodeError>;
}

/// Decoded common message header.
#[derive(Debug, Clone, Copy)]
struct MessageHeader {
    length: i32,
    request_id: i32,
    response_to: i32,
    op_code: i32,
}

enum DecodeState {
    /// Waiting for the 16-byte header.
    NeedHeader,
    /// Header parsed and consumed; waiting for `length - 16` body bytes.
    NeedBody(MessageHeader),
}

/// Production wire decoder.
pub struct MessageDecoder {
    state: DecodeState,
    max_message_bytes: usize,
}

impl MessageDecoder {
    /// A decoder with the default message size cap.
    pub fn new() -> Self {
        Self::with_max_message_bytes(DEFAULT_MAX_MESSAGE_BYTES)
    }

    /// A decoder with a custom message size cap.
    pub fn with_max_message_bytes(max_message_bytes: usize) -> Self {
        Self {
            state: DecodeState::NeedHeader,
            max_message_bytes,
        }
    }

    /// Attempt one state transition. `Ok(true)` means progress was made and
    /// the caller should try again; `Ok(false)` means more bytes are needed.
    fn decode_step(
        &mut self,
        buffer: &mut WatermarkBuffer,
        callbacks: &mut dyn DecoderCallbacks,
    ) -> Result<bool, DecodeError> {
        match self.state {
            DecodeState::NeedHeader => {
                if buffer.len() < MESSAGE_HEADER_SIZE {
                    return Ok(false);
                }
                let mut reader = SliceReader::new(buffer.as_slice());
                let header = MessageHeader {
                    length: reader.read_i32_le("message length")?,
                    request_id: reader.read_i32_le("request id")?,
                    response_to: reader.read_i32_le("response to")?,
                    op_code: reader.read_i32_le("op code")?,
                };
                if header.length < MESSAGE_HEADER_SIZE as i32 {
                    return Err(DecodeError::RuntMessage {
                        length: header.length,
                    });
                }
                if header.length as usize > self.max_message_bytes {
                    return Err(DecodeError::OversizedMessage {
                        length: i64::from(header.length),
                        max: self.max_message_bytes,
                    });
                }
                buffer.drain(MESSAGE_HEADER_SIZE);
                self.state = DecodeState::NeedBody(header);
                Ok(true)
            }
            DecodeState::NeedBody(header) => {
                let body_len = header.length as usize - MESSAGE_HEADER_SIZE;
                if buffer.len() < body_len {
                    return Ok(false);
                }
                let message = Self::decode_body(&header, &buffer.as_slice()[..body_len])?;
                buffer.drain(body_len);
                self.state = DecodeState::NeedHeader;

                trace!(
                    op_code = header.op_code,
                    request_id = header.request_id,
                    response_to = header.response_to,
                    length = header.length,
                    "decoded message"
                );
                match message {
                    Message::Query(m) => callbacks.decode_query(m),
                    Message::GetMore(m) => callbacks.decode_get_more(m),
                    Message::Insert(m) => callbacks.decode_insert(m),
                    Message::KillCursors(m) => callbacks.decode_kill_cursors(m),
                    Message::Reply(m) => callbacks.decode_reply(m),
                }
                Ok(true)
            }
        }
    }

    fn decode_body(header: &MessageHeader, body: &[u8]) -> Result<Message, DecodeError> {
        let op_code = OpCode::from_i32(header.op_code).ok_or(DecodeError::UnknownOpCode {
            op_code: header.op_code,
        })?;
        let mut reader = SliceReader::new(body);

        let message = match op_code {
            OpCode::Query => {
                let flags = reader.read_i32_le("query flags")? as u32;
                let full_collection_name = reader.read_cstring("query collection name")?;
                let number_to_skip = reader.read_i32_le("number to skip")?;
                let number_to_return = reader.read_i32_le("number to return")?;
                let query = Document::decode(&mut reader)?;
                let return_fields_selector = if reader.remaining() > 0 {
                    Some(Document::decode(&mut reader)?)
                } else {
                    None
                };
                Message::Query(QueryMessage {
                    request_id: header.request_id,
                    response_to: header.response_to,
                    flags,
                    full_collection_name,
                    number_to_skip,
                    number_to_return,
                    query,
                    return_fields_selector,
                })
            }
            OpCode::GetMore => {
                let _reserved = reader.read_i32_le("reserved")?;
                let full_collection_name = reader.read_cstring("get more collection name")?;
                let number_to_return = reader.read_i32_le("number to return")?;
                let cursor_id = reader.read_i64_le("cursor id")?;
                Message::GetMore(GetMoreMessage {
                    request_id: header.request_id,
                    response_to: header.response_to,
                    full_collection_name,
                    number_to_return,
                    cursor_id,
                })
            }
            OpCode::Insert => {
                let flags = reader.read_i32_le("insert flags")? as u32;
                let full_collection_name = reader.read_cstring("insert collection name")?;
                let mut documents = Vec::new();
                while reader.remaining() > 0 {
                    documents.push(Document::decode(&mut reader)?);
                }
                if documents.is_empty() {
                    return Err(DecodeError::InvalidMessage(
                        "insert message carries no documents",
                    ));
                }
                Message::Insert(InsertMessage {
                    request_id: header.request_id,
                    response_to: header.response_to,
                    flags,
                    full_collection_name,
                    documents,
                })
            }
            OpCode::KillCursors => {
                let _reserved = reader.read_i32_le("reserved")?;
                let count = reader.read_i32_le("number of cursor ids")?;
                // The count field must agree with the bytes that follow
                // before any allocation happens.
                if count < 0 || (count as usize).checked_mul(8) != Some(reader.remaining()) {
                    return Err(DecodeError::InvalidMessage("cursor id count mismatch"));
                }
                let mut cursor_ids = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    cursor_ids.push(reader.read_i64_le("cursor id")?);
                }
                Message::KillCursors(KillCursorsMessage {
                    request_id: header.request_id,
                    response_to: header.response_to,
                    cursor_ids,
                })
            }
            OpCode::Reply => {
                let flags = reader.read_i32_le("reply flags")? as u32;
                let cursor_id = reader.read_i64_le("cursor id")?;
                let starting_from = reader.read_i32_le("starting from")?;
                let number_returned = reader.read_i32_le("number returned")?;
                // A document is at least 5 bytes; bound the count by the
                // body before any allocation happens.
                if number_returned < 0 || number_returned as usize > reader.remaining() / 5 {
                    return Err(DecodeError::InvalidMessage(
                        "document count exceeds message body",
                    ));
                }
                let mut documents = Vec::with_capacity(number_returned as usize);
                for _ in 0..number_returned {
                    documents.push(Document::decode(&mut reader)?);
                }
                Message::Reply(ReplyMessage {
                    request_id: header.request_id,
                    response_to: header.response_to,
                    flags,
                    cursor_id,
                    starting_from,
                    number_returned,
                    documents,
                })
            }
        };

        if reader.remaining() != 0 {
            return Err(DecodeError::InvalidMessage(
                "trailing bytes after message body",
            ));
        }
        Ok(message)
    }
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageDecoder {
    fn on_data(
        &mut self,
        buffer: &mut WatermarkBuffer,
        callbacks: &mut dyn DecoderCallbacks,
    ) -> Result<(), DecodeError> {
        while self.decode_step(buffer, callbacks)? {}
        Ok(())
    }
}

/// Encode a message into its wire form.
pub fn encode(message: &Message) -> Bytes {
    let mut body = BytesMut::new();
    match message {
        Message::Query(m) => {
            body.put_i32_le(m.flags as i32);
            put_cstring(&mut body, &m.full_collection_name);
            body.put_i32_le(m.number_to_skip);
            body.put_i32_le(m.number_to_return);
            m.query.encode(&mut body);
            if let Some(selector) = &m.return_fields_selector {
                selector.encode(&mut body);
            }
        }
        Message::GetMore(m) => {
            body.put_i32_le(0);
            put_cstring(&mut body, &m.full_collection_name);
            body.put_i32_le(m.number_to_return);
            body.put_i64_le(m.cursor_id);
        }
        Message::Insert(m) => {
            body.put_i32_le(m.flags as i32);
            put_cstring(&mut body, &m.full_collection_name);
            for document in &m.documents {
                document.encode(&mut body);
            }
        }
        Message::KillCursors(m) => {
            body.put_i32_le(0);
            body.put_i32_le(m.cursor_ids.len() as i32);
            for cursor_id in &m.cursor_ids {
                body.put_i64_le(*cursor_id);
            }
        }
        Message::Reply(m) => {
            body.put_i32_le(m.flags as i32);
            body.put_i64_le(m.cursor_id);
            body.put_i32_le(m.starting_from);
            body.put_i32_le(m.documents.len() as i32);
            for document in &m.documents {
                document.encode(&mut body);
            }
        }
    }

    let mut out = BytesMut::with_capacity(MESSAGE_HEADER_SIZE + body.len());
    out.put_i32_le((MESSAGE_HEADER_SIZE + body.len()) as i32);
    out.put_i32_le(message.request_id());
    out.put_i32_le(message.response_to());
    out.put_i32_le(message.op_code() as i32);
    out.extend_from_slice(&body);
    out.freeze()
}

fn put_cstring(dst: &mut BytesMut, value: &str) {
    dst.put_slice(value.as_bytes());
    dst.put_u8(0);
}
