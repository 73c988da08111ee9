//! Session data buffers.
//!
//! Each session owns two buffers: `req` carries client-to-server bytes and
//! `rep` the reverse. A buffer is a bounded byte queue plus the flags the
//! forwarding engine communicates through: producers and consumers never
//! call each other, they flip flags here and the session handler reacts on
//! its next wakeup.

use bytes::BytesMut;

// ============================================================================
// Flags
// ============================================================================

/// Producer side saw EOF; no more input will arrive.
pub const BUF_SHUTR: u32 = 0x0001;
/// Consumer side is closed; pending output is discarded.
pub const BUF_SHUTW: u32 = 0x0002;
/// A read error occurred on the producer.
pub const BUF_READ_ERROR: u32 = 0x0004;
/// A write error occurred on the consumer.
pub const BUF_WRITE_ERROR: u32 = 0x0008;
/// The consumer may write (forwarding enabled past analysis).
pub const BUF_WRITE_ENA: u32 = 0x0010;
/// Send partial data immediately, never wait to aggregate.
pub const BUF_NEVER_WAIT: u32 = 0x0020;
/// Data arrived since the last handler run.
pub const BUF_READ_ACTIVITY: u32 = 0x0040;
/// Data left since the last handler run.
pub const BUF_WRITE_ACTIVITY: u32 = 0x0080;

/// Bounded byte queue with forwarding flags.
pub struct Buffer {
    data: BytesMut,
    cap: usize,
    flags: u32,
    /// Cumulative bytes that transited this buffer.
    total: u64,
}

impl Buffer {
    pub fn new(cap: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(cap),
            cap,
            flags: 0,
            total: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Free space left before the buffer is full.
    #[inline]
    pub fn space(&self) -> usize {
        self.cap - self.data.len()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.data.len() >= self.cap
    }

    /// Bytes that have transited the buffer since creation.
    #[inline]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Pending bytes, oldest first.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Append bytes; the caller must respect [`Buffer::space`].
    pub fn put(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.space());
        self.data.extend_from_slice(bytes);
        self.total += bytes.len() as u64;
        self.flags |= BUF_READ_ACTIVITY;
    }

    /// Drop `n` bytes from the head after they were written out.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.data.len());
        let _ = self.data.split_to(n);
        if n > 0 {
            self.flags |= BUF_WRITE_ACTIVITY;
        }
    }

    /// Discard everything pending (consumer gone).
    pub fn clear(&mut self) {
        self.data.clear();
    }

    // ------------------------------------------------------------------
    // Flags
    // ------------------------------------------------------------------

    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    #[inline]
    pub fn set(&mut self, flag: u32) {
        self.flags |= flag;
    }

    #[inline]
    pub fn clr(&mut self, flag: u32) {
        self.flags &= !flag;
    }

    #[inline]
    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// Clear the per-iteration activity flags, returning what was set.
    pub fn take_activity(&mut self) -> u32 {
        let act = self.flags & (BUF_READ_ACTIVITY | BUF_WRITE_ACTIVITY);
        self.flags &= !(BUF_READ_ACTIVITY | BUF_WRITE_ACTIVITY);
        act
    }

    /// Input is finished: either shut or errored.
    #[inline]
    pub fn input_closed(&self) -> bool {
        self.flags & (BUF_SHUTR | BUF_READ_ERROR) != 0
    }

    /// Output is finished: either shut or errored.
    #[inline]
    pub fn output_closed(&self) -> bool {
        self.flags & (BUF_SHUTW | BUF_WRITE_ERROR) != 0
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.data.len())
            .field("cap", &self.cap)
            .field("flags", &format_args!("{:#06x}", self.flags))
            .field("total", &self.total)
            .finish()
    }
}
