#![cfg_attr(not(test), no_std)]

//! Types shared between the eBPF program and userspace, plus the
//! call-correlation engine that both sides run.
//!
//! Everything in here must stay `no_std`, allocation free and `#[repr(C)]`
//! where it crosses the kernel/userspace boundary.

pub mod engine;

pub use engine::{
    CorrelationStore, EventChannel, EventSlot, ForeignMemory, Interceptor, MemoryFault, Task,
};

/// Maximum payload bytes captured per event (4KB to stay within eBPF limits)
pub const MAX_CAPTURE: usize = 4096;

/// Command name length (matches TASK_COMM_LEN in kernel)
pub const COMM_LEN: usize = 16;

/// Default number of in-flight calls the correlation store can hold
pub const DEFAULT_STORE_CAPACITY: u32 = 1024;

/// Default byte size of the event ring buffer (256KB, ~60 records)
pub const DEFAULT_CHANNEL_BYTES: u32 = 256 * 1024;

// Map and program names, shared so the loader and the object never drift apart.
pub const IN_FLIGHT_MAP: &str = "IN_FLIGHT";
pub const EVENTS_MAP: &str = "SSL_EVENTS";
pub const OUTCOMES_MAP: &str = "OUTCOMES";

pub const PROG_SSL_READ: &str = "ssl_read";
pub const PROG_SSL_READ_RET: &str = "ssl_read_ret";
pub const PROG_SSL_WRITE: &str = "ssl_write";
pub const PROG_SSL_WRITE_RET: &str = "ssl_write_ret";

// =============================================================================
// Call identity
// =============================================================================

/// Which side of the TLS boundary a call moves plaintext across
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// SSL_write (outgoing plaintext)
    Write = 1,
    /// SSL_read (incoming plaintext)
    Read = 2,
}

impl CallKind {
    /// Decode the raw byte stored in [`CapturedEvent::kind`]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(CallKind::Write),
            2 => Some(CallKind::Read),
            _ => None,
        }
    }

    const fn key_bit(self) -> u64 {
        match self {
            CallKind::Read => CallKey::READ_BIT,
            CallKind::Write => CallKey::WRITE_BIT,
        }
    }
}

/// Identity of an in-flight call: thread id with one high bit per call kind.
///
/// A thread can have at most one outstanding call of each kind recorded, so
/// the key only needs to be unique per thread at a given instant. A packed
/// key always has exactly one kind bit set and is therefore never zero.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallKey(u64);

impl CallKey {
    const READ_BIT: u64 = 1 << 62;
    const WRITE_BIT: u64 = 1 << 63;
    const THREAD_MASK: u64 = Self::READ_BIT - 1;

    #[inline(always)]
    pub const fn new(thread_id: u64, kind: CallKind) -> Self {
        CallKey((thread_id & Self::THREAD_MASK) | kind.key_bit())
    }

    #[inline(always)]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn thread_id(self) -> u64 {
        self.0 & Self::THREAD_MASK
    }

    pub const fn kind(self) -> CallKind {
        if self.0 & Self::WRITE_BIT != 0 {
            CallKind::Write
        } else {
            CallKind::Read
        }
    }
}

/// Arguments stored at call entry for correlation with the return probe
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InFlightCall {
    /// Buffer pointer in the traced process
    pub buf: u64,
    /// Length the caller asked for
    pub requested_len: i32,
    /// Process ID (tgid) that issued the call
    pub pid: u32,
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for InFlightCall {}

// =============================================================================
// Captured events
// =============================================================================

/// Plaintext record sent from the exit interceptor to the consumer.
///
/// Fixed size so ring slots have a static, verifiable size. Every field is a
/// plain integer or byte array, so any byte pattern read back from the ring
/// is a valid value.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CapturedEvent {
    /// Timestamp in nanoseconds (from bpf_ktime_get_ns)
    pub timestamp_ns: u64,
    /// Thread ID
    pub tid: u64,
    /// Process ID (tgid)
    pub pid: u32,
    /// User ID
    pub uid: u32,
    /// Byte count the call reported (may be > captured_len)
    pub byte_len: i32,
    /// Bytes actually present in `payload`
    pub captured_len: u32,
    /// Length requested at call entry
    pub requested_len: i32,
    /// Raw [`CallKind`]
    pub kind: u8,
    _pad: [u8; 3],
    /// Process command name (null-terminated)
    pub comm: [u8; COMM_LEN],
    /// Captured plaintext
    pub payload: [u8; MAX_CAPTURE],
}

impl CapturedEvent {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    /// Create a new zeroed event
    pub const fn zeroed() -> Self {
        Self {
            timestamp_ns: 0,
            tid: 0,
            pid: 0,
            uid: 0,
            byte_len: 0,
            captured_len: 0,
            requested_len: 0,
            kind: 0,
            _pad: [0; 3],
            comm: [0u8; COMM_LEN],
            payload: [0u8; MAX_CAPTURE],
        }
    }

    pub const fn call_kind(&self) -> Option<CallKind> {
        CallKind::from_raw(self.kind)
    }

    /// Captured payload bytes
    pub fn captured(&self) -> &[u8] {
        let len = (self.captured_len as usize).min(MAX_CAPTURE);
        &self.payload[..len]
    }

    /// Whether the call moved more bytes than were captured
    pub fn is_truncated(&self) -> bool {
        self.byte_len > self.captured_len as i32
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for CapturedEvent {}

/// Bytes to read for a successful call: `min(ret, MAX_CAPTURE)`, or `None`
/// when the return value reports no transfer.
#[inline(always)]
pub const fn capture_len(ret: i32) -> Option<usize> {
    if ret <= 0 {
        return None;
    }
    let ret = ret as usize;
    Some(if ret > MAX_CAPTURE { MAX_CAPTURE } else { ret })
}

// =============================================================================
// Outcomes
// =============================================================================

/// What an interceptor invocation did. Only counted, never reported to the
/// traced process.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Entry stored in the correlation store
    Recorded = 0,
    /// Entry skipped, buffer pointer was null
    NullBuffer = 1,
    /// Event committed to the channel
    Emitted = 2,
    /// Exit without a recorded entry
    Unmatched = 3,
    /// Exit with a non-positive return value
    NoTransfer = 4,
    /// Channel had no free slot
    ChannelFull = 5,
    /// Traced buffer could not be read
    ReadFault = 6,
}

impl Outcome {
    /// Number of outcome counters (size of the per-CPU counter array)
    pub const COUNT: u32 = 7;

    pub const ALL: [Outcome; Self::COUNT as usize] = [
        Outcome::Recorded,
        Outcome::NullBuffer,
        Outcome::Emitted,
        Outcome::Unmatched,
        Outcome::NoTransfer,
        Outcome::ChannelFull,
        Outcome::ReadFault,
    ];

    #[inline(always)]
    pub const fn index(self) -> u32 {
        self as u32
    }

    pub const fn name(self) -> &'static str {
        match self {
            Outcome::Recorded => "recorded",
            Outcome::NullBuffer => "null_buffer",
            Outcome::Emitted => "emitted",
            Outcome::Unmatched => "unmatched",
            Outcome::NoTransfer => "no_transfer",
            Outcome::ChannelFull => "channel_full",
            Outcome::ReadFault => "read_fault",
        }
    }

    /// True for the silent drop paths of the exit interceptor
    pub const fn is_drop(self) -> bool {
        matches!(
            self,
            Outcome::Unmatched | Outcome::NoTransfer | Outcome::ChannelFull | Outcome::ReadFault
        )
    }
}

/// Split a `bpf_get_current_pid_tgid` value into `(pid, tid)`
#[inline(always)]
pub const fn split_pid_tgid(pid_tgid: u64) -> (u32, u64) {
    ((pid_tgid >> 32) as u32, pid_tgid as u32 as u64)
}
