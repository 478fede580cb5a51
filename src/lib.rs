//! mongogate - MongoDB wire-protocol data plane for Layer-7 proxies.
//!
//! This library provides the per-connection filter, wire codec and
//! flow-controlled buffering that a proxy host composes into a MongoDB
//! sniffing listener.
//!
//! # Components
//!
//! - [`buffer`]: watermark buffer with edge-triggered backpressure
//!   callbacks.
//! - [`bson`] and [`codec`]: BSON document codec and the push-style wire
//!   message decoder/encoder.
//! - [`filter`]: the proxy filter: per-connection statistics derivation,
//!   access logging and fixed-delay fault injection.
//! - [`network`], [`runtime`], [`stats`], [`access_log`]: the narrow
//!   interfaces the filter consumes from its host, each implementable by a
//!   test double.
//!
//! # Data flow
//!
//! Downstream bytes enter at `ProxyFilter::on_data`, upstream bytes at
//! `ProxyFilter::on_write`. Both directions run through the same decoder;
//! decoded requests join the active-request list and decoded replies close
//! them out, emitting per-collection, per-command and per-callsite counters,
//! histograms and access-log records. A configured fault rule can hold the
//! read side of the filter chain with a one-shot delay timer.

pub mod access_log;
pub mod bson;
pub mod buffer;
pub mod codec;
pub mod config;
pub mod error;
pub mod fault;
pub mod filter;
pub mod message;
pub mod network;
pub mod runtime;
pub mod stats;

pub use access_log::{AccessLog, AccessLogEntry, InMemorySink, LogSink};
pub use bson::{Document, Value};
pub use buffer::WatermarkBuffer;
pub use codec::{Decoder, DecoderCallbacks, MessageDecoder, DEFAULT_MAX_MESSAGE_BYTES};
pub use config::MongoProxyConfig;
pub use error::{ConfigError, DecodeError};
pub use fault::FaultConfig;
pub use filter::{MongoProxyStats, ProxyFilter};
pub use message::{
    GetMoreMessage, InsertMessage, KillCursorsMessage, Message, OpCode, QueryMessage, QueryType,
    ReplyMessage,
};
pub use network::{
    ConnectionEvent, Dispatcher, FilterStatus, NetworkFilter, ReadFilterCallbacks, Timer,
};
pub use runtime::{RandomSamplingRuntime, RuntimeLoader};
pub use stats::{Counter, Gauge, IsolatedStatsStore, StatsStore};
