//! BSON document codec.
//!
//! MongoDB wire messages carry their payloads as BSON: length-prefixed
//! documents of typed elements keyed by cstring. This module provides the
//! owned [`Document`] / [`Value`] model, the wire codec for it, and a
//! chainable builder used by tests and by callers that inject `$comment`
//! metadata on the fly.
//!
//! Round-trip laws: `decode(encode(d)) == d` for any document, and
//! `encode(decode(b)) == b` for canonical input (the decoder rejects
//! documents whose length prefix disagrees with their contents).

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::DecodeError;

const ELEMENT_TYPE_DOUBLE: u8 = 0x01;
const ELEMENT_TYPE_STRING: u8 = 0x02;
const ELEMENT_TYPE_DOCUMENT: u8 = 0x03;
const ELEMENT_TYPE_ARRAY: u8 = 0x04;
const ELEMENT_TYPE_BINARY: u8 = 0x05;
const ELEMENT_TYPE_OBJECT_ID: u8 = 0x07;
const ELEMENT_TYPE_BOOLEAN: u8 = 0x08;
const ELEMENT_TYPE_DATETIME: u8 = 0x09;
const ELEMENT_TYPE_NULL: u8 = 0x0A;
const ELEMENT_TYPE_REGEX: u8 = 0x0B;
const ELEMENT_TYPE_SYMBOL: u8 = 0x0E;
const ELEMENT_TYPE_INT32: u8 = 0x10;
const ELEMENT_TYPE_TIMESTAMP: u8 = 0x11;
const ELEMENT_TYPE_INT64: u8 = 0x12;
const ELEMENT_TYPE_MIN_KEY: u8 = 0xFF;
const ELEMENT_TYPE_MAX_KEY: u8 = 0x7F;

/// A typed BSON element value.
///
/// Arrays are documents whose keys are the decimal indices "0", "1", … and
/// share the document representation.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// 64-bit IEEE 754 floating point.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// Embedded document.
    Document(Document),
    /// Embedded array (a document keyed "0", "1", …).
    Array(Document),
    /// Binary data with its subtype byte preserved.
    Binary {
        /// BSON binary subtype byte.
        subtype: u8,
        /// Raw payload.
        data: Vec<u8>,
    },
    /// 12-byte ObjectId.
    ObjectId([u8; 12]),
    /// Boolean.
    Boolean(bool),
    /// UTC datetime, milliseconds since the epoch.
    Datetime(i64),
    /// Null sentinel.
    Null,
    /// Regular expression: pattern and option flags.
    Regex {
        /// Expression pattern.
        pattern: String,
        /// Option flags string.
        options: String,
    },
    /// Symbol (deprecated in BSON but still seen on the wire).
    Symbol(String),
    /// 32-bit integer.
    Int32(i32),
    /// Internal MongoDB timestamp.
    Timestamp(u64),
    /// 64-bit integer.
    Int64(i64),
    /// Min-key sentinel.
    MinKey,
    /// Max-key sentinel.
    MaxKey,
}

impl Value {
    /// The embedded document, when this value is one.
    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(doc) => Some(doc),
            _ => None,
        }
    }

    /// The embedded array, when this value is one.
    pub fn as_array(&self) -> Option<&Document> {
        match self {
            Value::Array(doc) => Some(doc),
            _ => None,
        }
    }

    /// The string payload, when this value is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// The integer payload, when this value is a 32-bit integer.
    pub fn as_int32(&self) -> Option<i32> {
        match self {
            Value::Int32(v) => Some(*v),
            _ => None,
        }
    }

    /// The integer payload, when this value is a 64-bit integer.
    pub fn as_int64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    fn type_byte(&self) -> u8 {
        match self {
            Value::Double(_) => ELEMENT_TYPE_DOUBLE,
            Value::String(_) => ELEMENT_TYPE_STRING,
            Value::Document(_) => ELEMENT_TYPE_DOCUMENT,
            Value::Array(_) => ELEMENT_TYPE_ARRAY,
            Value::Binary { .. } => ELEMENT_TYPE_BINARY,
            Value::ObjectId(_) => ELEMENT_TYPE_OBJECT_ID,
            Value::Boolean(_) => ELEMENT_TYPE_BOOLEAN,
            Value::Datetime(_) => ELEMENT_TYPE_DATETIME,
            Value::Null => ELEMENT_TYPE_NULL,
            Value::Regex { .. } => ELEMENT_TYPE_REGEX,
            Value::Symbol(_) => ELEMENT_TYPE_SYMBOL,
            Value::Int32(_) => ELEMENT_TYPE_INT32,
            Value::Timestamp(_) => ELEMENT_TYPE_TIMESTAMP,
            Value::Int64(_) => ELEMENT_TYPE_INT64,
            Value::MinKey => ELEMENT_TYPE_MIN_KEY,
            Value::MaxKey => ELEMENT_TYPE_MAX_KEY,
        }
    }

    fn payload_size(&self) -> usize {
        match self {
            Value::Double(_) => 8,
            Value::String(s) | Value::Symbol(s) => 4 + s.len() + 1,
            Value::Document(doc) | Value::Array(doc) => doc.byte_size(),
            Value::Binary { data, .. } => 4 + 1 + data.len(),
            Value::ObjectId(_) => 12,
            Value::Boolean(_) => 1,
            Value::Datetime(_) | Value::Timestamp(_) | Value::Int64(_) => 8,
            Value::Null | Value::MinKey | Value::MaxKey => 0,
            Value::Regex { pattern, options } => pattern.len() + 1 + options.len() + 1,
            Value::Int32(_) => 4,
        }
    }

    fn encode_payload(&self, dst: &mut BytesMut) {
        match self {
            Value::Double(v) => dst.put_f64_le(*v),
            Value::String(s) | Value::Symbol(s) => {
                dst.put_i32_le(s.len() as i32 + 1);
                dst.put_slice(s.as_bytes());
                dst.put_u8(0);
            }
            Value::Document(doc) | Value::Array(doc) => doc.encode(dst),
            Value::Binary { subtype, data } => {
                dst.put_i32_le(data.len() as i32);
                dst.put_u8(*subtype);
                dst.put_slice(data);
            }
            Value::ObjectId(id) => dst.put_slice(id),
            Value::Boolean(v) => dst.put_u8(u8::from(*v)),
            Value::Datetime(v) => dst.put_i64_le(*v),
            Value::Null | Value::MinKey | Value::MaxKey => {}
            Value::Regex { pattern, options } => {
                dst.put_slice(pattern.as_bytes());
                dst.put_u8(0);
                dst.put_slice(options.as_bytes());
                dst.put_u8(0);
            }
            Value::Int32(v) => dst.put_i32_le(*v),
            Value::Timestamp(v) => dst.put_u64_le(*v),
            Value::Int64(v) => dst.put_i64_le(*v),
        }
    }
}

/// An ordered BSON document: a list of `(key, value)` elements.
///
/// Order is preserved because the wire format is ordered and the proxy's
/// command extraction depends on the first key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    elements: Vec<(String, Value)>,
}

impl Document {
    /// Create an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an element, returning the document for chaining.
    pub fn add(mut self, key: impl Into<String>, value: Value) -> Self {
        self.elements.push((key.into(), value));
        self
    }

    /// Append a double element.
    pub fn add_double(self, key: impl Into<String>, value: f64) -> Self {
        self.add(key, Value::Double(value))
    }

    /// Append a string element.
    pub fn add_string(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add(key, Value::String(value.into()))
    }

    /// Append an embedded document element.
    pub fn add_document(self, key: impl Into<String>, value: Document) -> Self {
        self.add(key, Value::Document(value))
    }

    /// Append an embedded array element.
    pub fn add_array(self, key: impl Into<String>, value: Document) -> Self {
        self.add(key, Value::Array(value))
    }

    /// Append a binary element.
    pub fn add_binary(self, key: impl Into<String>, subtype: u8, data: Vec<u8>) -> Self {
        self.add(key, Value::Binary { subtype, data })
    }

    /// Append an ObjectId element.
    pub fn add_object_id(self, key: impl Into<String>, id: [u8; 12]) -> Self {
        self.add(key, Value::ObjectId(id))
    }

    /// Append a boolean element.
    pub fn add_boolean(self, key: impl Into<String>, value: bool) -> Self {
        self.add(key, Value::Boolean(value))
    }

    /// Append a UTC datetime element.
    pub fn add_datetime(self, key: impl Into<String>, millis: i64) -> Self {
        self.add(key, Value::Datetime(millis))
    }

    /// Append a null element.
    pub fn add_null(self, key: impl Into<String>) -> Self {
        self.add(key, Value::Null)
    }

    /// Append a regex element.
    pub fn add_regex(
        self,
        key: impl Into<String>,
        pattern: impl Into<String>,
        options: impl Into<String>,
    ) -> Self {
        self.add(
            key,
            Value::Regex {
                pattern: pattern.into(),
                options: options.into(),
            },
        )
    }

    /// Append a symbol element.
    pub fn add_symbol(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add(key, Value::Symbol(value.into()))
    }

    /// Append a 32-bit integer element.
    pub fn add_int32(self, key: impl Into<String>, value: i32) -> Self {
        self.add(key, Value::Int32(value))
    }

    /// Append a timestamp element.
    pub fn add_timestamp(self, key: impl Into<String>, value: u64) -> Self {
        self.add(key, Value::Timestamp(value))
    }

    /// Append a 64-bit integer element.
    pub fn add_int64(self, key: impl Into<String>, value: i64) -> Self {
        self.add(key, Value::Int64(value))
    }

    /// Value of the first element with the given key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.elements
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Key of the first element, when any.
    pub fn first_key(&self) -> Option<&str> {
        self.elements.first().map(|(k, _)| k.as_str())
    }

    /// The elements in wire order.
    pub fn elements(&self) -> &[(String, Value)] {
        &self.elements
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// True when the document has no elements.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Size of the encoded form in bytes, including the length prefix and
    /// the trailing NUL.
    pub fn byte_size(&self) -> usize {
        let elements: usize = self
            .elements
            .iter()
            .map(|(key, value)| 1 + key.len() + 1 + value.payload_size())
            .sum();
        4 + elements + 1
    }

    /// Encode into `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_i32_le(self.byte_size() as i32);
        for (key, value) in &self.elements {
            dst.put_u8(value.type_byte());
            dst.put_slice(key.as_bytes());
            dst.put_u8(0);
            value.encode_payload(dst);
        }
        dst.put_u8(0);
    }

    /// Encode into a freshly allocated byte string.
    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.byte_size());
        self.encode(&mut dst);
        dst.freeze()
    }

    /// Decode a document that occupies the entire input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Document, DecodeError> {
        let mut reader = SliceReader::new(bytes);
        let doc = Self::decode(&mut reader)?;
        if reader.remaining() != 0 {
            return Err(DecodeError::InvalidMessage(
                "trailing bytes after BSON document",
            ));
        }
        Ok(doc)
    }

    /// Decode one document from the reader's current position.
    pub(crate) fn decode(reader: &mut SliceReader<'_>) -> Result<Document, DecodeError> {
        let start = reader.pos();
        let size = reader.read_i32_le("document size")?;
        if size < 5 {
            return Err(DecodeError::BadSize { size });
        }
        let end = start + size as usize;
        if end > reader.total_len() {
            return Err(DecodeError::ShortBuffer {
                context: "document body",
                needed: size as usize,
                available: reader.total_len() - start,
            });
        }

        let mut document = Document::new();
        loop {
            let type_byte = reader.read_u8("element type")?;
            if type_byte == 0 {
                break;
            }
            let key = reader.read_cstring("element key")?;
            let value = Self::decode_value(reader, type_byte, &key)?;
            document.elements.push((key, value));
        }

        // The length prefix must agree with the decoded contents.
        if reader.pos() != end {
            return Err(DecodeError::BadSize { size });
        }
        Ok(document)
    }

    fn decode_value(
        reader: &mut SliceReader<'_>,
        type_byte: u8,
        key: &str,
    ) -> Result<Value, DecodeError> {
        let value = match type_byte {
            ELEMENT_TYPE_DOUBLE => Value::Double(reader.read_f64_le("double")?),
            ELEMENT_TYPE_STRING => Value::String(reader.read_string("string")?),
            ELEMENT_TYPE_DOCUMENT => Value::Document(Self::decode(reader)?),
            ELEMENT_TYPE_ARRAY => Value::Array(Self::decode(reader)?),
            ELEMENT_TYPE_BINARY => {
                let len = reader.read_i32_le("binary size")?;
                if len < 0 {
                    return Err(DecodeError::BadSize { size: len });
                }
                let subtype = reader.read_u8("binary subtype")?;
                let data = reader.read_bytes(len as usize, "binary data")?.to_vec();
                Value::Binary { subtype, data }
            }
            ELEMENT_TYPE_OBJECT_ID => {
                let raw = reader.read_bytes(12, "object id")?;
                let mut id = [0u8; 12];
                id.copy_from_slice(raw);
                Value::ObjectId(id)
            }
            ELEMENT_TYPE_BOOLEAN => Value::Boolean(reader.read_u8("boolean")? != 0),
            ELEMENT_TYPE_DATETIME => Value::Datetime(reader.read_i64_le("datetime")?),
            ELEMENT_TYPE_NULL => Value::Null,
            ELEMENT_TYPE_REGEX => Value::Regex {
                pattern: reader.read_cstring("regex pattern")?,
                options: reader.read_cstring("regex options")?,
            },
            ELEMENT_TYPE_SYMBOL => Value::Symbol(reader.read_string("symbol")?),
            ELEMENT_TYPE_INT32 => Value::Int32(reader.read_i32_le("int32")?),
            ELEMENT_TYPE_TIMESTAMP => Value::Timestamp(reader.read_u64_le("timestamp")?),
            ELEMENT_TYPE_INT64 => Value::Int64(reader.read_i64_le("int64")?),
            ELEMENT_TYPE_MIN_KEY => Value::MinKey,
            ELEMENT_TYPE_MAX_KEY => Value::MaxKey,
            other => {
                return Err(DecodeError::BadType {
                    key: key.to_string(),
                    type_byte: other,
                });
            }
        };
        Ok(value)
    }
}

/// Bounds-checked little-endian reader over a byte slice.
///
/// Shared by the BSON decoder and the message codec; every failure carries
/// the context of the field being decoded.
pub(crate) struct SliceReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SliceReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    pub(crate) fn total_len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn read_bytes(
        &mut self,
        n: usize,
        context: &'static str,
    ) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::ShortBuffer {
                context,
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn read_u8(&mut self, context: &'static str) -> Result<u8, DecodeError> {
        Ok(self.read_bytes(1, context)?[0])
    }

    pub(crate) fn read_i32_le(&mut self, context: &'static str) -> Result<i32, DecodeError> {
        let raw = self.read_bytes(4, context)?;
        Ok(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub(crate) fn read_i64_le(&mut self, context: &'static str) -> Result<i64, DecodeError> {
        let raw = self.read_bytes(8, context)?;
        Ok(i64::from_le_bytes([
            raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
        ]))
    }

    pub(crate) fn read_u64_le(&mut self, context: &'static str) -> Result<u64, DecodeError> {
        Ok(self.read_i64_le(context)? as u64)
    }

    pub(crate) fn read_f64_le(&mut self, context: &'static str) -> Result<f64, DecodeError> {
        Ok(f64::from_bits(self.read_i64_le(context)? as u64))
    }

    /// NUL-terminated string; the terminator is consumed and excluded.
    pub(crate) fn read_cstring(&mut self, context: &'static str) -> Result<String, DecodeError> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::BadString { context })?;
        let out = String::from_utf8_lossy(&rest[..nul]).into_owned();
        self.pos += nul + 1;
        Ok(out)
    }

    /// Length-prefixed string: i32 byte count including the trailing NUL.
    pub(crate) fn read_string(&mut self, context: &'static str) -> Result<String, DecodeError> {
        let len = self.read_i32_le(context)?;
        if len < 1 {
            return Err(DecodeError::BadSize { size: len });
        }
        let raw = self.read_bytes(len as usize, context)?;
        if raw[raw.len() - 1] != 0 {
            return Err(DecodeError::BadString { context });
        }
        Ok(String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_encoding() {
        // {"hello": "world"} has the canonical 22-byte form.
        let doc = Document::new().add_string("hello", "world");
        let bytes = doc.to_bytes();
        assert_eq!(
            bytes.as_ref(),
            b"\x16\x00\x00\x00\x02hello\x00\x06\x00\x00\x00world\x00\x00"
        );
        assert_eq!(doc.byte_size(), 22);
        assert_eq!(bytes.len(), doc.byte_size());
    }

    #[test]
    fn test_empty_document() {
        let doc = Document::new();
        let bytes = doc.to_bytes();
        assert_eq!(bytes.as_ref(), b"\x05\x00\x00\x00\x00");
        assert_eq!(Document::from_bytes(&bytes).unwrap(), doc);
    }

    #[test]
    fn test_round_trip_all_types() {
        let doc = Document::new()
            .add_double("double", 1.5)
            .add_string("string", "value")
            .add_document("doc", Document::new().add_int32("inner", 1))
            .add_array("array", Document::new().add_int32("0", 7).add_int32("1", 8))
            .add_binary("binary", 0x02, vec![1, 2, 3])
            .add_object_id("oid", [9; 12])
            .add_boolean("bool", true)
            .add_datetime("when", 1_234_567)
            .add_null("nothing")
            .add_regex("re", "^a.*b$", "i")
            .add_symbol("sym", "legacy")
            .add_int32("i32", -5)
            .add_timestamp("ts", 42)
            .add_int64("i64", i64::MIN)
            .add("min", Value::MinKey)
            .add("max", Value::MaxKey);

        let bytes = doc.to_bytes();
        assert_eq!(bytes.len(), doc.byte_size());
        let decoded = Document::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, doc);
        assert_eq!(decoded.to_bytes(), bytes);
    }

    #[test]
    fn test_first_key_and_get() {
        let doc = Document::new()
            .add_string("isMaster", "1")
            .add_int32("$maxTimeMS", 50);
        assert_eq!(doc.first_key(), Some("isMaster"));
        assert_eq!(doc.get("$maxTimeMS").and_then(Value::as_int32), Some(50));
        assert!(doc.get("absent").is_none());
    }

    #[test]
    fn test_bad_type_is_fatal() {
        // Valid frame with an element of type 0x42.
        let bytes = b"\x0b\x00\x00\x00\x42k\x00\x01\x00\x00\x00";
        let err = Document::from_bytes(bytes).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::BadType { type_byte: 0x42, .. }
        ));
    }

    #[test]
    fn test_missing_terminator_is_fatal() {
        // String element whose payload claims 6 bytes but ends in 'x'.
        let bytes = b"\x16\x00\x00\x00\x02hello\x00\x06\x00\x00\x00worldx\x00";
        let err = Document::from_bytes(bytes).unwrap_err();
        assert!(matches!(err, DecodeError::BadString { .. }));
    }

    #[test]
    fn test_short_buffer() {
        let full = Document::new().add_string("hello", "world").to_bytes();
        let err = Document::from_bytes(&full[..10]).unwrap_err();
        assert!(matches!(err, DecodeError::ShortBuffer { .. }));
    }

    #[test]
    fn test_size_mismatch_is_fatal() {
        // Well-formed 22-byte document with the prefix bumped to 23.
        let mut bytes = Document::new().add_string("hello", "world").to_bytes().to_vec();
        bytes[0] = 23;
        bytes.push(0);
        let err = Document::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, DecodeError::BadSize { size: 23 }));
    }

    #[test]
    fn test_nested_length_prefixes_match_payload() {
        let inner = Document::new().add_string("a", "b");
        let doc = Document::new().add_document("outer", inner.clone());
        let bytes = doc.to_bytes();

        // The inner document's prefix sits after the outer prefix, the type
        // byte and the "outer\0" key.
        let inner_start = 4 + 1 + 6;
        let inner_size = i32::from_le_bytes([
            bytes[inner_start],
            bytes[inner_start + 1],
            bytes[inner_start + 2],
            bytes[inner_start + 3],
        ]);
        assert_eq!(inner_size as usize, inner.byte_size());
    }
}
