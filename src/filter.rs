//! Per-connection MongoDB proxy filter.
//!
//! The filter sits inline on a TCP connection, feeds both directions of the
//! stream through the wire decoder, and turns decoded messages into
//! statistics, access-log records and (optionally) injected delay faults.
//! It never modifies the byte stream.
//!
//! # Data flow
//!
//! Downstream bytes arrive at [`ProxyFilter::on_data`], upstream bytes at
//! [`ProxyFilter::on_write`]; each direction accumulates into its own buffer
//! and is pushed through the decoder. Decoded requests are recorded in the
//! active-request list; each decoded reply is matched to the oldest pending
//! request with the same id, closing the timing and emitting the reply
//! histograms.
//!
//! # Failure containment
//!
//! A decode error is counted once per connection and permanently stops
//! sniffing in both directions; the connection itself is left to the host.
//! Runtime lookups, sink writes and timer arming can never fail the data
//! path.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::access_log::{AccessLog, AccessLogEntry};
use crate::buffer::WatermarkBuffer;
use crate::codec::{Decoder, DecoderCallbacks, MessageDecoder};
use crate::config::MongoProxyConfig;
use crate::error::ConfigError;
use crate::fault::FaultConfig;
use crate::message::{
    query_flags, reply_flags, GetMoreMessage, InsertMessage, KillCursorsMessage, QueryMessage,
    QueryType, ReplyMessage,
};
use crate::network::{ConnectionEvent, FilterStatus, NetworkFilter, ReadFilterCallbacks, Timer};
use crate::runtime::{keys, RuntimeLoader};
use crate::stats::{Counter, Gauge, StatsStore};

/// Fixed-name statistics for one listener prefix.
///
/// Resolved once at filter construction so the per-message path never
/// formats these names. Collection, command and callsite counters are
/// name-dependent and resolved through the store on demand.
pub struct MongoProxyStats {
    /// Total OP_QUERY messages decoded.
    pub op_query: Counter,
    /// Queries with the tailable-cursor flag.
    pub op_query_tailable_cursor: Counter,
    /// Queries with the no-cursor-timeout flag.
    pub op_query_no_cursor_timeout: Counter,
    /// Queries with the await-data flag.
    pub op_query_await_data: Counter,
    /// Queries with the exhaust flag.
    pub op_query_exhaust: Counter,
    /// Queries that carry no `$maxTimeMS`.
    pub op_query_no_max_time: Counter,
    /// Queries with no `_id` predicate.
    pub op_query_scatter_get: Counter,
    /// Queries with an `_id` `$in` array predicate.
    pub op_query_multi_get: Counter,
    /// Queries whose reply has not yet been observed.
    pub op_query_active: Gauge,
    /// Total OP_GET_MORE messages decoded.
    pub op_get_more: Counter,
    /// Total OP_INSERT messages decoded.
    pub op_insert: Counter,
    /// Total OP_KILL_CURSORS messages decoded.
    pub op_kill_cursors: Counter,
    /// Total OP_REPLY messages decoded.
    pub op_reply: Counter,
    /// Replies with the cursor-not-found flag.
    pub op_reply_cursor_not_found: Counter,
    /// Replies with the query-failure flag.
    pub op_reply_query_failure: Counter,
    /// Replies carrying a live cursor id.
    pub op_reply_valid_cursor: Counter,
    /// Connections that hit a wire decode error.
    pub decoding_error: Counter,
    /// Delay faults armed.
    pub delays_injected: Counter,
    /// Local closes that interrupted in-flight requests.
    pub cx_destroy_local_with_active_rq: Counter,
    /// Remote closes that interrupted in-flight requests.
    pub cx_destroy_remote_with_active_rq: Counter,
}

impl MongoProxyStats {
    /// Resolve every fixed-name stat under `prefix`.
    pub fn new(store: &dyn StatsStore, prefix: &str) -> Self {
        let counter = |name: &str| store.counter(&format!("{prefix}.{name}"));
        Self {
            op_query: counter("op_query"),
            op_query_tailable_cursor: counter("op_query_tailable_cursor"),
            op_query_no_cursor_timeout: counter("op_query_no_cursor_timeout"),
            op_query_await_data: counter("op_query_await_data"),
            op_query_exhaust: counter("op_query_exhaust"),
            op_query_no_max_time: counter("op_query_no_max_time"),
            op_query_scatter_get: counter("op_query_scatter_get"),
            op_query_multi_get: counter("op_query_multi_get"),
            op_query_active: store.gauge(&format!("{prefix}.op_query_active")),
            op_get_more: counter("op_get_more"),
            op_insert: counter("op_insert"),
            op_kill_cursors: counter("op_kill_cursors"),
            op_reply: counter("op_reply"),
            op_reply_cursor_not_found: counter("op_reply_cursor_not_found"),
            op_reply_query_failure: counter("op_reply_query_failure"),
            op_reply_valid_cursor: counter("op_reply_valid_cursor"),
            decoding_error: counter("decoding_error"),
            delays_injected: counter("delays_injected"),
            cx_destroy_local_with_active_rq: counter("cx_destroy_local_with_active_rq"),
            cx_destroy_remote_with_active_rq: counter("cx_destroy_remote_with_active_rq"),
        }
    }
}

/// A request whose reply has not yet been observed.
///
/// The stat bases are pre-resolved at decode time so reply accounting never
/// re-parses the query.
struct ActiveQuery {
    request_id: i32,
    start: Instant,
    /// Histogram/timing base names for this request: collection, command
    /// and callsite bases as applicable, prefix included.
    stat_bases: Vec<String>,
    /// Namespace (or command name) for the access-log record.
    namespace: String,
    callsite: Option<String>,
    flags: u32,
}

/// Which side of the connection a buffer belongs to.
#[derive(Debug, Clone, Copy)]
enum StreamDirection {
    Request,
    Reply,
}

/// The decoder-facing half of the filter.
///
/// Split from [`ProxyFilter`] so the decoder can borrow it as its callback
/// target while the filter keeps hold of the buffers and the decoder
/// itself.
struct FilterCore {
    stat_prefix: String,
    stats: MongoProxyStats,
    store: Arc<dyn StatsStore>,
    runtime: Arc<dyn RuntimeLoader>,
    access_log: Arc<AccessLog>,
    fault_config: Option<FaultConfig>,
    active_queries: Vec<ActiveQuery>,
    /// Mirrors whether a delay timer is armed on the owning filter.
    delay_active: bool,
    /// Delay selected by the fault gate, waiting for the filter to arm it.
    pending_delay: Option<Duration>,
}

impl FilterCore {
    /// Consult the fault rule for a newly decoded request. At most one
    /// outstanding delay per connection: armed or already-selected delays
    /// suppress the runtime lookup entirely.
    fn try_inject_delay(&mut self) {
        if self.delay_active || self.pending_delay.is_some() {
            return;
        }
        let Some(fault) = self.fault_config else {
            return;
        };
        if !self
            .runtime
            .feature_enabled(keys::FAULT_DELAY_PERCENT, u64::from(fault.delay_percent()))
        {
            return;
        }
        let duration_ms = self.runtime.get_integer(
            keys::FAULT_DELAY_DURATION_MS,
            fault.delay_duration().as_millis() as i64,
        );
        self.pending_delay = Some(Duration::from_millis(duration_ms.max(0) as u64));
    }

    fn charge_query_stats(&self, base: &str, query_type: QueryType) {
        self.store.counter(&format!("{base}.total")).inc();
        match query_type {
            QueryType::ScatterGet => self.store.counter(&format!("{base}.scatter_get")).inc(),
            QueryType::MultiGet => self.store.counter(&format!("{base}.multi_get")).inc(),
            QueryType::PrimaryKey => {}
        }
    }

    /// Caller annotation from `$comment`, a JSON string whose
    /// `callingFunction` field names the application call site.
    fn callsite(message: &QueryMessage) -> Option<String> {
        let comment = message.query.get("$comment")?.as_str()?;
        let annotation: serde_json::Value = serde_json::from_str(comment).ok()?;
        annotation
            .get("callingFunction")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    fn has_max_time(message: &QueryMessage) -> bool {
        message.query.get("$maxTimeMS").is_some() || message.query.get("maxTimeMS").is_some()
    }
}

impl DecoderCallbacks for FilterCore {
    fn decode_query(&mut self, message: QueryMessage) {
        self.stats.op_query.inc();
        if message.flags & query_flags::TAILABLE_CURSOR != 0 {
            self.stats.op_query_tailable_cursor.inc();
        }
        if message.flags & query_flags::NO_CURSOR_TIMEOUT != 0 {
            self.stats.op_query_no_cursor_timeout.inc();
        }
        if message.flags & query_flags::AWAIT_DATA != 0 {
            self.stats.op_query_await_data.inc();
        }
        if message.flags & query_flags::EXHAUST != 0 {
            self.stats.op_query_exhaust.inc();
        }
        if !Self::has_max_time(&message) {
            self.stats.op_query_no_max_time.inc();
        }

        self.stats.op_query_active.inc();
        let callsite = Self::callsite(&message);
        let mut stat_bases = Vec::with_capacity(2);
        let namespace;

        if message.is_command() {
            let command = message.filter_document().first_key().unwrap_or("unknown");
            let base = format!("{}.cmd.{}", self.stat_prefix, command);
            self.charge_query_stats(&base, QueryType::PrimaryKey);
            namespace = command.to_string();
            stat_bases.push(base);
        } else {
            let collection = message.collection();
            let query_type = message.query_type();

            let base = format!("{}.collection.{}.query", self.stat_prefix, collection);
            self.charge_query_stats(&base, query_type);
            stat_bases.push(base);

            if let Some(callsite) = &callsite {
                let base = format!(
                    "{}.collection.{}.callsite.{}.query",
                    self.stat_prefix, collection, callsite
                );
                self.charge_query_stats(&base, query_type);
                stat_bases.push(base);
            }

            match query_type {
                QueryType::ScatterGet => self.stats.op_query_scatter_get.inc(),
                QueryType::MultiGet => self.stats.op_query_multi_get.inc(),
                QueryType::PrimaryKey => {}
            }
            namespace = message.full_collection_name.clone();
        }

        trace!(
            request_id = message.request_id,
            namespace = %namespace,
            "decoded query"
        );
        self.active_queries.push(ActiveQuery {
            request_id: message.request_id,
            start: Instant::now(),
            stat_bases,
            namespace,
            callsite,
            flags: message.flags,
        });
        self.try_inject_delay();
    }

    fn decode_get_more(&mut self, message: GetMoreMessage) {
        self.stats.op_get_more.inc();
        trace!(
            request_id = message.request_id,
            cursor_id = message.cursor_id,
            "decoded get more"
        );
        self.try_inject_delay();
    }

    fn decode_insert(&mut self, message: InsertMessage) {
        self.stats.op_insert.inc();
        trace!(
            request_id = message.request_id,
            documents = message.documents.len(),
            "decoded insert"
        );
        self.try_inject_delay();
    }

    fn decode_kill_cursors(&mut self, message: KillCursorsMessage) {
        self.stats.op_kill_cursors.inc();
        trace!(
            request_id = message.request_id,
            cursors = message.cursor_ids.len(),
            "decoded kill cursors"
        );
        self.try_inject_delay();
    }

    fn decode_reply(&mut self, message: ReplyMessage) {
        self.stats.op_reply.inc();
        if message.flags & reply_flags::CURSOR_NOT_FOUND != 0 {
            self.stats.op_reply_cursor_not_found.inc();
        }
        if message.flags & reply_flags::QUERY_FAILURE != 0 {
            self.stats.op_reply_query_failure.inc();
        }
        if message.cursor_id != 0 {
            self.stats.op_reply_valid_cursor.inc();
        }

        let Some(position) = self
            .active_queries
            .iter()
            .position(|query| query.request_id == message.response_to)
        else {
            trace!(response_to = message.response_to, "reply with no pending request");
            return;
        };
        let active = self.active_queries.remove(position);
        self.stats.op_query_active.dec();

        let reply_documents = message.documents.len() as u64;
        let reply_size = message.documents_byte_size();
        let took = active.start.elapsed();
        for base in &active.stat_bases {
            self.store
                .deliver_histogram_to_sinks(&format!("{base}.reply_num_docs"), reply_documents);
            self.store
                .deliver_histogram_to_sinks(&format!("{base}.reply_size"), reply_size);
            self.store
                .deliver_timing_to_sinks(&format!("{base}.reply_time_ms"), took);
        }

        if self.runtime.feature_enabled(keys::LOGGING_ENABLED, 100) {
            self.access_log.log_request(&AccessLogEntry {
                operation: "query",
                namespace: &active.namespace,
                callsite: active.callsite.as_deref(),
                flags: active.flags,
                request_id: active.request_id,
                reply_documents,
                reply_size_bytes: reply_size,
                reply_duration: took,
            });
        }
    }
}

impl Drop for FilterCore {
    fn drop(&mut self) {
        // Requests still in flight release their share of the gauge.
        for _ in &self.active_queries {
            self.stats.op_query_active.dec();
        }
    }
}

/// Network filter sniffing the MongoDB wire protocol on one connection.
pub struct ProxyFilter {
    decoder: Box<dyn Decoder>,
    read_buffer: WatermarkBuffer,
    write_buffer: WatermarkBuffer,
    /// Cleared permanently by the first decode error.
    sniffing: bool,
    delay_timer: Option<Box<dyn Timer>>,
    callbacks: Option<Rc<RefCell<dyn ReadFilterCallbacks>>>,
    core: FilterCore,
}

impl ProxyFilter {
    /// A filter with the production wire decoder.
    pub fn new(
        stat_prefix: &str,
        store: Arc<dyn StatsStore>,
        runtime: Arc<dyn RuntimeLoader>,
        access_log: Arc<AccessLog>,
        fault_config: Option<FaultConfig>,
    ) -> Self {
        Self::with_decoder(
            stat_prefix,
            store,
            runtime,
            access_log,
            fault_config,
            Box::new(MessageDecoder::new()),
        )
    }

    /// A filter built from a parsed listener configuration.
    pub fn from_config(
        config: &MongoProxyConfig,
        store: Arc<dyn StatsStore>,
        runtime: Arc<dyn RuntimeLoader>,
        access_log: Arc<AccessLog>,
    ) -> Result<Self, ConfigError> {
        let fault_config = config.fault_config()?;
        Ok(Self::with_decoder(
            &config.stat_prefix,
            store,
            runtime,
            access_log,
            fault_config,
            Box::new(MessageDecoder::with_max_message_bytes(
                config.max_message_bytes,
            )),
        ))
    }

    /// A filter with an injected decoder, for tests and doubles.
    pub fn with_decoder(
        stat_prefix: &str,
        store: Arc<dyn StatsStore>,
        runtime: Arc<dyn RuntimeLoader>,
        access_log: Arc<AccessLog>,
        fault_config: Option<FaultConfig>,
        decoder: Box<dyn Decoder>,
    ) -> Self {
        let stats = MongoProxyStats::new(store.as_ref(), stat_prefix);
        Self {
            decoder,
            read_buffer: WatermarkBuffer::default(),
            write_buffer: WatermarkBuffer::default(),
            sniffing: true,
            delay_timer: None,
            callbacks: None,
            core: FilterCore {
                stat_prefix: stat_prefix.to_string(),
                stats,
                store,
                runtime,
                access_log,
                fault_config,
                active_queries: Vec::new(),
                delay_active: false,
                pending_delay: None,
            },
        }
    }

    /// Entry point for delay timer expiry. The host (or the test driving
    /// the filter) invokes this when the timer armed through its dispatcher
    /// fires; reading resumes on the connection.
    pub fn on_delay_timer(&mut self) {
        if let Some(mut timer) = self.delay_timer.take() {
            timer.disable();
        }
        self.core.delay_active = false;
        debug!(connection_id = self.connection_id(), "delay fault elapsed");
        if let Some(callbacks) = self.callbacks.as_ref() {
            callbacks.borrow_mut().continue_reading();
        }
    }

    /// True while an injected delay is holding the read side.
    pub fn is_delay_pending(&self) -> bool {
        self.delay_timer.is_some()
    }

    fn connection_id(&self) -> u64 {
        self.callbacks
            .as_ref()
            .map(|callbacks| callbacks.borrow().connection_id())
            .unwrap_or(0)
    }

    fn do_decode(&mut self, direction: StreamDirection) {
        let buffer = match direction {
            StreamDirection::Request => &mut self.read_buffer,
            StreamDirection::Reply => &mut self.write_buffer,
        };

        if !self.sniffing
            || !self
                .core
                .runtime
                .feature_enabled(keys::PROXY_ENABLED, 100)
        {
            let len = buffer.len();
            buffer.drain(len);
            return;
        }

        if let Err(error) = self.decoder.on_data(buffer, &mut self.core) {
            warn!(?direction, %error, "mongo decoding error; sniffing disabled");
            self.core.stats.decoding_error.inc();
            self.sniffing = false;
            let len = buffer.len();
            buffer.drain(len);
        }
    }

    /// Arm the delay timer when a decode pass selected a delay. Without an
    /// initialized callbacks handle there is no dispatcher to arm through;
    /// the delay is then treated as already elapsed.
    fn maybe_arm_delay(&mut self) {
        if self.delay_timer.is_some() {
            self.core.pending_delay = None;
            return;
        }
        let Some(duration) = self.core.pending_delay.take() else {
            return;
        };
        let Some(callbacks) = self.callbacks.as_ref() else {
            return;
        };
        let mut timer = callbacks.borrow_mut().dispatcher().create_timer();
        timer.enable(duration);
        self.delay_timer = Some(timer);
        self.core.delay_active = true;
        self.core.stats.delays_injected.inc();
        debug!(
            connection_id = self.connection_id(),
            delay_ms = duration.as_millis() as u64,
            "delay fault armed"
        );
    }
}

impl NetworkFilter for ProxyFilter {
    fn initialize_read_filter_callbacks(
        &mut self,
        callbacks: Rc<RefCell<dyn ReadFilterCallbacks>>,
    ) {
        self.callbacks = Some(callbacks);
    }

    fn on_new_connection(&mut self) -> FilterStatus {
        if self
            .core
            .runtime
            .feature_enabled(keys::CONNECTION_LOGGING_ENABLED, 100)
        {
            debug!(connection_id = self.connection_id(), "new mongo connection");
        }
        FilterStatus::Continue
    }

    fn on_data(&mut self, data: &mut WatermarkBuffer) -> FilterStatus {
        self.read_buffer.move_from(data);
        self.do_decode(StreamDirection::Request);
        self.maybe_arm_delay();
        if self.delay_timer.is_some() {
            FilterStatus::StopIteration
        } else {
            FilterStatus::Continue
        }
    }

    fn on_write(&mut self, data: &mut WatermarkBuffer) -> FilterStatus {
        self.write_buffer.move_from(data);
        self.do_decode(StreamDirection::Reply);
        FilterStatus::Continue
    }

    fn on_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {}
            ConnectionEvent::LocalClose | ConnectionEvent::RemoteClose => {
                if self
                    .core
                    .runtime
                    .feature_enabled(keys::CONNECTION_LOGGING_ENABLED, 100)
                {
                    debug!(
                        connection_id = self.connection_id(),
                        ?event,
                        active_requests = self.core.active_queries.len(),
                        "mongo connection closed"
                    );
                }
                if !self.core.active_queries.is_empty() {
                    match event {
                        ConnectionEvent::LocalClose => {
                            self.core.stats.cx_destroy_local_with_active_rq.inc();
                        }
                        ConnectionEvent::RemoteClose => {
                            self.core.stats.cx_destroy_remote_with_active_rq.inc();
                        }
                        ConnectionEvent::Connected => {}
                    }
                }
                if let Some(mut timer) = self.delay_timer.take() {
                    timer.disable();
                }
                self.core.delay_active = false;
            }
        }
    }
}
