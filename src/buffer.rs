//! Flow-controlled byte buffer with edge-triggered watermark callbacks.
//!
//! `WatermarkBuffer` wraps a linear byte buffer and fires two callbacks when
//! its occupancy crosses configured thresholds:
//!
//! - the **high** callback fires on the operation that takes the length
//!   strictly above the high watermark while the buffer was below it;
//! - the **low** callback fires on the operation that takes the length
//!   strictly below the low watermark while the buffer was above the high
//!   watermark.
//!
//! The pair of callbacks is edge-triggered through an internal latch:
//! hovering between the two thresholds fires nothing, and each edge fires
//! exactly once until the opposite edge resets the latch. The host proxy
//! uses the callbacks to pause and resume reads on the peer connection,
//! propagating backpressure across the pipeline without copying.
//!
//! Callbacks run synchronously inside the operation that crossed the
//! threshold, before that operation returns.

use std::io::{self, Read, Write};

/// Callback invoked when a watermark edge is crossed.
pub type WatermarkCallback = Box<dyn FnMut()>;

/// Linear byte buffer with high/low watermark callbacks.
pub struct WatermarkBuffer {
    data: Vec<u8>,
    /// Space handed out by `reserve` and not yet committed. Reserved bytes
    /// do not count toward `len()` until `commit`.
    pending: Vec<u8>,
    low_watermark: usize,
    high_watermark: usize,
    /// Latch: set by the high edge, cleared by the low edge.
    above_high: bool,
    below_low_cb: WatermarkCallback,
    above_high_cb: WatermarkCallback,
}

impl WatermarkBuffer {
    /// Create a buffer with the given edge callbacks. Watermarks start
    /// disabled; call [`set_watermarks`](Self::set_watermarks) to arm them.
    pub fn new(below_low_cb: WatermarkCallback, above_high_cb: WatermarkCallback) -> Self {
        Self {
            data: Vec::new(),
            pending: Vec::new(),
            low_watermark: 0,
            high_watermark: 0,
            above_high: false,
            below_low_cb,
            above_high_cb,
        }
    }

    /// Reconfigure both thresholds and re-evaluate the edges under the new
    /// values: if the buffer is now above the new high watermark and the
    /// latch is clear, the high callback fires; if the latch is set and the
    /// buffer is now below the new low watermark, the low callback fires.
    /// Re-issuing the same thresholds is callback-neutral.
    pub fn set_watermarks(&mut self, low_watermark: usize, high_watermark: usize) {
        debug_assert!(low_watermark <= high_watermark);
        self.low_watermark = low_watermark;
        self.high_watermark = high_watermark;
        self.check_high_watermark();
        self.check_low_watermark();
    }

    /// Number of committed bytes in the buffer.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the buffer holds no committed bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The committed contents as one contiguous slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// First `size` bytes as a contiguous slice (the whole buffer when
    /// shorter). The buffer is linear so this never copies.
    pub fn linearize(&self, size: usize) -> &[u8] {
        &self.data[..size.min(self.data.len())]
    }

    /// Byte offset of the first occurrence of `needle` at or after `start`.
    pub fn search(&self, needle: &[u8], start: usize) -> Option<usize> {
        if needle.is_empty() || start > self.data.len() {
            return None;
        }
        self.data[start..]
            .windows(needle.len())
            .position(|window| window == needle)
            .map(|pos| start + pos)
    }

    /// Append bytes. May fire the high edge.
    pub fn add(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        self.check_high_watermark();
    }

    /// Append a copy of another buffer's contents without draining it.
    /// May fire this buffer's high edge; the source is untouched.
    pub fn add_buffer(&mut self, other: &WatermarkBuffer) {
        self.data.extend_from_slice(&other.data);
        self.check_high_watermark();
    }

    /// Hand out `size` bytes of zeroed scratch space for a subsequent
    /// [`commit`](Self::commit). Reserved space does not count toward
    /// `len()` and a new `reserve` discards any uncommitted one.
    pub fn reserve(&mut self, size: usize) -> &mut [u8] {
        self.pending.clear();
        self.pending.resize(size, 0);
        &mut self.pending
    }

    /// Finalize the first `len` bytes of the reserved region into the
    /// buffer. May fire the high edge.
    pub fn commit(&mut self, len: usize) {
        debug_assert!(len <= self.pending.len());
        let take = len.min(self.pending.len());
        self.data.extend_from_slice(&self.pending[..take]);
        self.pending.clear();
        self.check_high_watermark();
    }

    /// Transfer the entire contents of `src` into this buffer. Re-evaluates
    /// both buffers: this one may fire its high edge, the source may fire
    /// its low edge, and both may fire on a single call.
    pub fn move_from(&mut self, src: &mut WatermarkBuffer) {
        self.data.append(&mut src.data);
        self.check_high_watermark();
        src.check_low_watermark();
    }

    /// Transfer up to `n` bytes from the front of `src` into this buffer.
    /// Same edge behavior as [`move_from`](Self::move_from).
    pub fn move_from_n(&mut self, src: &mut WatermarkBuffer, n: usize) {
        let take = n.min(src.data.len());
        self.data.extend_from_slice(&src.data[..take]);
        src.data.drain(..take);
        self.check_high_watermark();
        src.check_low_watermark();
    }

    /// Discard up to `n` bytes from the front. May fire the low edge.
    pub fn drain(&mut self, n: usize) {
        let take = n.min(self.data.len());
        self.data.drain(..take);
        self.check_low_watermark();
    }

    /// Read up to `max` bytes from `reader` into the buffer. May fire the
    /// high edge. Reader errors (including `WouldBlock`) pass through
    /// unchanged and leave the buffer contents as they were.
    pub fn read_from(&mut self, reader: &mut impl Read, max: usize) -> io::Result<usize> {
        let dst = self.reserve(max);
        let n = reader.read(dst)?;
        self.commit(n);
        Ok(n)
    }

    /// Write buffered bytes to `writer`, draining what was written. May fire
    /// the low edge. Writer errors pass through unchanged.
    pub fn write_to(&mut self, writer: &mut impl Write) -> io::Result<usize> {
        if self.data.is_empty() {
            return Ok(0);
        }
        let n = writer.write(&self.data)?;
        self.drain(n);
        Ok(n)
    }

    fn check_high_watermark(&mut self) {
        if self.high_watermark > 0 && !self.above_high && self.data.len() > self.high_watermark {
            self.above_high = true;
            (self.above_high_cb)();
        }
    }

    fn check_low_watermark(&mut self) {
        if self.above_high && self.data.len() < self.low_watermark {
            self.above_high = false;
            (self.below_low_cb)();
        }
    }
}

impl Default for WatermarkBuffer {
    /// A buffer with no-op callbacks and watermarks disabled, for callers
    /// that only need the byte mechanics.
    fn default() -> Self {
        Self::new(Box::new(|| {}), Box::new(|| {}))
    }
}

impl std::fmt::Debug for WatermarkBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatermarkBuffer")
            .field("len", &self.data.len())
            .field("low_watermark", &self.low_watermark)
            .field("high_watermark", &self.high_watermark)
            .field("above_high", &self.above_high)
            .finish()
    }
}
