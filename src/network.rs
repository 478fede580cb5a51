//! The network-filter contract between the proxy filter and its host.
//!
//! The host owns sockets, the event loop and the filter chain; the filter
//! sees only these interfaces. Everything here is sized for test doubles:
//! the proxy's tests drive a filter through mock callbacks, a mock
//! dispatcher and a mock timer exactly as the host would.
//!
//! The connection model is single-threaded and cooperative: all filter
//! calls, decoder callbacks and timer callbacks run on the thread that owns
//! the connection, so the callbacks handle is shared as
//! `Rc<RefCell<dyn ReadFilterCallbacks>>`.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::buffer::WatermarkBuffer;

/// Verdict a filter returns to the chain after processing bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    /// Keep iterating through the remaining filters.
    Continue,
    /// Stop the chain; the filter will resume it via `continue_reading`.
    StopIteration,
}

/// Connection lifecycle events raised by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The transport connected.
    Connected,
    /// The peer closed the connection.
    RemoteClose,
    /// This side closed the connection.
    LocalClose,
}

/// One-shot timer armed by the filter through the host dispatcher.
///
/// Expiry is delivered by the host invoking the filter's timer entry point
/// (`ProxyFilter::on_delay_timer`); the handle only arms and disarms.
pub trait Timer {
    /// Arm the timer to fire once after `duration`. Re-arming resets it.
    fn enable(&mut self, duration: Duration);
    /// Disarm without firing.
    fn disable(&mut self);
    /// True while armed and not yet fired.
    fn is_enabled(&self) -> bool;
}

/// Host event-loop services available to a filter.
pub trait Dispatcher {
    /// Create a disarmed one-shot timer.
    fn create_timer(&mut self) -> Box<dyn Timer>;
}

/// Handle into the host connection, given to the filter once at setup.
pub trait ReadFilterCallbacks {
    /// Resume a filter chain previously stopped with
    /// [`FilterStatus::StopIteration`].
    fn continue_reading(&mut self);
    /// Identifier of the underlying connection, for log correlation.
    fn connection_id(&self) -> u64;
    /// The event loop owning this connection.
    fn dispatcher(&mut self) -> &mut dyn Dispatcher;
}

/// A per-connection filter sitting on both directions of the stream.
pub trait NetworkFilter {
    /// One-shot setup with the host connection handle. Called before any
    /// data or events.
    fn initialize_read_filter_callbacks(&mut self, callbacks: Rc<RefCell<dyn ReadFilterCallbacks>>);

    /// Called once when the connection is accepted.
    fn on_new_connection(&mut self) -> FilterStatus;

    /// Bytes from the downstream client. The filter takes what it needs
    /// from `data`.
    fn on_data(&mut self, data: &mut WatermarkBuffer) -> FilterStatus;

    /// Bytes from the upstream server, headed back to the client.
    fn on_write(&mut self, data: &mut WatermarkBuffer) -> FilterStatus;

    /// A connection lifecycle event.
    fn on_event(&mut self, event: ConnectionEvent);
}
