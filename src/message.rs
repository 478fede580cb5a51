//! MongoDB wire-protocol message model.
//!
//! Messages share a 16-byte little-endian header (`length`, `request_id`,
//! `response_to`, `op_code`) followed by an op-specific body. The model is a
//! tagged union: one struct per op-code with public fields, gathered under
//! [`Message`] for code that handles any op.

use crate::bson::{Document, Value};

/// Fixed size of the common message header in bytes.
pub const MESSAGE_HEADER_SIZE: usize = 16;

/// Wire op-codes understood by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OpCode {
    /// OP_REPLY: server response to a query or get-more.
    Reply = 1,
    /// OP_INSERT: insert one or more documents.
    Insert = 2002,
    /// OP_QUERY: query a collection or run a command.
    Query = 2004,
    /// OP_GET_MORE: continue reading from a cursor.
    GetMore = 2005,
    /// OP_KILL_CURSORS: release server-side cursors.
    KillCursors = 2007,
}

impl OpCode {
    /// Map a wire op-code value, `None` for codes the proxy does not sniff.
    pub fn from_i32(value: i32) -> Option<OpCode> {
        match value {
            1 => Some(OpCode::Reply),
            2002 => Some(OpCode::Insert),
            2004 => Some(OpCode::Query),
            2005 => Some(OpCode::GetMore),
            2007 => Some(OpCode::KillCursors),
            _ => None,
        }
    }
}

/// OP_QUERY flag bits.
pub mod query_flags {
    /// Cursor stays open after the initial batch is exhausted.
    pub const TAILABLE_CURSOR: u32 = 1 << 1;
    /// Server keeps the cursor alive past the idle timeout.
    pub const NO_CURSOR_TIMEOUT: u32 = 1 << 4;
    /// Block on a tailable cursor until data is available.
    pub const AWAIT_DATA: u32 = 1 << 5;
    /// Stream multiple replies without waiting for get-more.
    pub const EXHAUST: u32 = 1 << 6;
}

/// OP_REPLY response flag bits.
pub mod reply_flags {
    /// The requested cursor no longer exists on the server.
    pub const CURSOR_NOT_FOUND: u32 = 1 << 0;
    /// The query failed; the single reply document holds the error.
    pub const QUERY_FAILURE: u32 = 1 << 1;
}

/// Shape of a query's selector with respect to `_id`, used for scatter-get
/// and multi-get accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    /// No `_id` predicate: the query fans out to every shard.
    ScatterGet,
    /// `_id` matched against an `$in` array: a batched point lookup.
    MultiGet,
    /// Any other `_id` predicate: a single point lookup.
    PrimaryKey,
}

/// OP_QUERY message.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryMessage {
    /// Client-chosen identifier echoed by the matching reply.
    pub request_id: i32,
    /// Identifier of the message this one responds to (zero for requests).
    pub response_to: i32,
    /// Query flag bits, see [`query_flags`].
    pub flags: u32,
    /// Namespace, `"db.collection"` or `"db.$cmd"` for commands.
    pub full_collection_name: String,
    /// Number of documents to skip before returning results.
    pub number_to_skip: i32,
    /// Batch size hint; zero for the server default.
    pub number_to_return: i32,
    /// The selector document.
    pub query: Document,
    /// Optional projection document.
    pub return_fields_selector: Option<Document>,
}

impl QueryMessage {
    /// A query with the given ids and empty remaining fields.
    pub fn new(request_id: i32, response_to: i32) -> Self {
        Self {
            request_id,
            response_to,
            flags: 0,
            full_collection_name: String::new(),
            number_to_skip: 0,
            number_to_return: 0,
            query: Document::new(),
            return_fields_selector: None,
        }
    }

    /// Collection part of the namespace (everything after the first `.`).
    pub fn collection(&self) -> &str {
        match self.full_collection_name.split_once('.') {
            Some((_, collection)) => collection,
            None => &self.full_collection_name,
        }
    }

    /// True when the query targets the `$cmd` pseudo-collection.
    pub fn is_command(&self) -> bool {
        self.collection() == "$cmd"
    }

    /// Command name: the first key of the selector for `$cmd` queries.
    pub fn command(&self) -> Option<&str> {
        if self.is_command() {
            self.filter_document().first_key()
        } else {
            None
        }
    }

    /// The effective filter document. Wrapped queries of the form
    /// `{"query": {...}, "$orderby": ...}` are unwrapped one level.
    pub fn filter_document(&self) -> &Document {
        match self.query.get("query") {
            Some(Value::Document(inner)) => inner,
            _ => &self.query,
        }
    }

    /// Classify the selector by its `_id` shape.
    pub fn query_type(&self) -> QueryType {
        match self.filter_document().get("_id") {
            None => QueryType::ScatterGet,
            Some(Value::Document(spec)) => match spec.get("$in") {
                Some(Value::Array(_)) => QueryType::MultiGet,
                _ => QueryType::PrimaryKey,
            },
            Some(_) => QueryType::PrimaryKey,
        }
    }
}

/// OP_GET_MORE message.
#[derive(Debug, Clone, PartialEq)]
pub struct GetMoreMessage {
    /// Client-chosen identifier echoed by the matching reply.
    pub request_id: i32,
    /// Identifier of the message this one responds to (zero for requests).
    pub response_to: i32,
    /// Namespace, `"db.collection"`.
    pub full_collection_name: String,
    /// Batch size hint; zero for the server default.
    pub number_to_return: i32,
    /// Cursor being continued.
    pub cursor_id: i64,
}

impl GetMoreMessage {
    /// A get-more with the given ids and empty remaining fields.
    pub fn new(request_id: i32, response_to: i32) -> Self {
        Self {
            request_id,
            response_to,
            full_collection_name: String::new(),
            number_to_return: 0,
            cursor_id: 0,
        }
    }
}

/// OP_INSERT message.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertMessage {
    /// Client-chosen identifier echoed by the matching reply.
    pub request_id: i32,
    /// Identifier of the message this one responds to (zero for requests).
    pub response_to: i32,
    /// Insert flag bits (bit 0: continue on error).
    pub flags: u32,
    /// Namespace, `"db.collection"`.
    pub full_collection_name: String,
    /// Documents to insert; the wire format requires at least one.
    pub documents: Vec<Document>,
}

impl InsertMessage {
    /// An insert with the given ids and empty remaining fields.
    pub fn new(request_id: i32, response_to: i32) -> Self {
        Self {
            request_id,
            response_to,
            flags: 0,
            full_collection_name: String::new(),
            documents: Vec::new(),
        }
    }
}

/// OP_KILL_CURSORS message.
#[derive(Debug, Clone, PartialEq)]
pub struct KillCursorsMessage {
    /// Client-chosen identifier echoed by the matching reply.
    pub request_id: i32,
    /// Identifier of the message this one responds to (zero for requests).
    pub response_to: i32,
    /// Cursors to release.
    pub cursor_ids: Vec<i64>,
}

impl KillCursorsMessage {
    /// A kill-cursors with the given ids and no cursors.
    pub fn new(request_id: i32, response_to: i32) -> Self {
        Self {
            request_id,
            response_to,
            cursor_ids: Vec::new(),
        }
    }
}

/// OP_REPLY message.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyMessage {
    /// Server-chosen identifier.
    pub request_id: i32,
    /// `request_id` of the query or get-more being answered.
    pub response_to: i32,
    /// Response flag bits, see [`reply_flags`].
    pub flags: u32,
    /// Cursor to pass to get-more, zero when exhausted.
    pub cursor_id: i64,
    /// Offset of this batch within the cursor.
    pub starting_from: i32,
    /// Number of documents in this batch.
    pub number_returned: i32,
    /// The returned documents.
    pub documents: Vec<Document>,
}

impl ReplyMessage {
    /// A reply with the given ids and empty remaining fields.
    pub fn new(request_id: i32, response_to: i32) -> Self {
        Self {
            request_id,
            response_to,
            flags: 0,
            cursor_id: 0,
            starting_from: 0,
            number_returned: 0,
            documents: Vec::new(),
        }
    }

    /// Total encoded size of the reply documents in bytes.
    pub fn documents_byte_size(&self) -> u64 {
        self.documents
            .iter()
            .map(|doc| doc.byte_size() as u64)
            .sum()
    }
}

/// Any sniffed wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// OP_QUERY.
    Query(QueryMessage),
    /// OP_GET_MORE.
    GetMore(GetMoreMessage),
    /// OP_INSERT.
    Insert(InsertMessage),
    /// OP_KILL_CURSORS.
    KillCursors(KillCursorsMessage),
    /// OP_REPLY.
    Reply(ReplyMessage),
}

impl Message {
    /// The message's wire op-code.
    pub fn op_code(&self) -> OpCode {
        match self {
            Message::Query(_) => OpCode::Query,
            Message::GetMore(_) => OpCode::GetMore,
            Message::Insert(_) => OpCode::Insert,
            Message::KillCursors(_) => OpCode::KillCursors,
            Message::Reply(_) => OpCode::Reply,
        }
    }

    /// The common `request_id` header field.
    pub fn request_id(&self) -> i32 {
        match self {
            Message::Query(m) => m.request_id,
            Message::GetMore(m) => m.request_id,
            Message::Insert(m) => m.request_id,
            Message::KillCursors(m) => m.request_id,
            Message::Reply(m) => m.request_id,
        }
    }

    /// The common `response_to` header field.
    pub fn response_to(&self) -> i32 {
        match self {
            Message::Query(m) => m.response_to,
            Message::GetMore(m) => m.response_to,
            Message::Insert(m) => m.response_to,
            Message::KillCursors(m) => m.response_to,
            Message::Reply(m) => m.response_to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_extraction() {
        let mut query = QueryMessage::new(1, 0);
        query.full_collection_name = "db.test".to_string();
        assert_eq!(query.collection(), "test");
        assert!(!query.is_command());
        assert_eq!(query.command(), None);

        query.full_collection_name = "db.$cmd".to_string();
        query.query = Document::new().add_string("isMaster", "1");
        assert!(query.is_command());
        assert_eq!(query.command(), Some("isMaster"));
    }

    #[test]
    fn test_query_type_classification() {
        let mut query = QueryMessage::new(1, 0);
        query.full_collection_name = "db.test".to_string();

        assert_eq!(query.query_type(), QueryType::ScatterGet);

        query.query = Document::new().add_string("_id", "abc123");
        assert_eq!(query.query_type(), QueryType::PrimaryKey);

        query.query = Document::new().add_document(
            "_id",
            Document::new().add_array("$in", Document::new()),
        );
        assert_eq!(query.query_type(), QueryType::MultiGet);

        // $in that is not an array is still a point lookup.
        query.query = Document::new()
            .add_document("_id", Document::new().add_string("$in", "oops"));
        assert_eq!(query.query_type(), QueryType::PrimaryKey);
    }

    #[test]
    fn test_wrapped_query_is_unwrapped() {
        let mut query = QueryMessage::new(1, 0);
        query.full_collection_name = "db.test".to_string();
        query.query = Document::new()
            .add_document("query", Document::new().add_string("_id", "k"))
            .add_document("$orderby", Document::new().add_int32("x", 1));
        assert_eq!(query.query_type(), QueryType::PrimaryKey);
    }

    #[test]
    fn test_reply_documents_byte_size() {
        let mut reply = ReplyMessage::new(1, 1);
        reply.documents.push(Document::new().add_string("hello", "world"));
        assert_eq!(reply.documents_byte_size(), 22);
    }

    #[test]
    fn test_op_code_mapping() {
        assert_eq!(OpCode::from_i32(1), Some(OpCode::Reply));
        assert_eq!(OpCode::from_i32(2004), Some(OpCode::Query));
        assert_eq!(OpCode::from_i32(2013), None);
    }
}
