//! Entry/exit correlation engine.
//!
//! The engine is generic over the three shared resources it touches so the
//! same code runs inside the eBPF program (kernel maps and helpers) and in
//! userspace tests (native store, ring and `process_vm_readv`). None of the
//! operations here block, allocate or report an error to the traced call.

use crate::{
    capture_len, split_pid_tgid, CallKey, CallKind, CapturedEvent, InFlightCall, Outcome,
    COMM_LEN,
};

/// Bounded table of in-flight calls.
///
/// `put` always succeeds from the caller's point of view (last writer wins,
/// eviction when full is up to the implementation). `take` removes and
/// returns the entry atomically for that key; a miss is not an error.
pub trait CorrelationStore {
    fn put(&self, key: CallKey, call: InFlightCall);
    fn take(&self, key: CallKey) -> Option<InFlightCall>;
}

/// Failure of a foreign memory read
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryFault {
    /// Address not mapped or not readable (carries the errno-style code)
    Unreadable(i64),
    /// Fewer bytes were available than requested
    Short { read: usize },
}

/// Fault-tolerant read from the traced process's address space.
///
/// Must never fault the caller on an unmapped or protected address.
pub trait ForeignMemory {
    fn read(&self, pid: u32, addr: u64, dst: &mut [u8]) -> Result<(), MemoryFault>;
}

/// A reserved, not yet visible channel slot.
///
/// Dropping a slot without calling `commit` must behave like `discard`.
pub trait EventSlot {
    fn event(&mut self) -> &mut CapturedEvent;
    fn commit(self);
    fn discard(self);
}

/// Bounded event channel with non-blocking reservation
pub trait EventChannel {
    type Slot<'a>: EventSlot
    where
        Self: 'a;

    /// Claim one record slot, or `None` when the channel is full
    fn reserve(&self) -> Option<Self::Slot<'_>>;
}

/// Identity and metadata of the task an interceptor fires on
pub trait Task {
    /// `(tgid << 32) | tid`, same layout as `bpf_get_current_pid_tgid`
    fn pid_tgid(&self) -> u64;
    fn uid(&self) -> u32;
    fn comm(&self) -> [u8; COMM_LEN];
    fn now_ns(&self) -> u64;
}

/// Entry and exit interceptors bound to a store, a memory reader and a channel
pub struct Interceptor<S, M, C> {
    store: S,
    memory: M,
    channel: C,
}

impl<S, M, C> Interceptor<S, M, C>
where
    S: CorrelationStore,
    M: ForeignMemory,
    C: EventChannel,
{
    pub const fn new(store: S, memory: M, channel: C) -> Self {
        Self {
            store,
            memory,
            channel,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Record the buffer of a call that is about to run.
    #[inline(always)]
    pub fn on_entry<T: Task>(&self, task: &T, kind: CallKind, buf: u64, requested_len: i32) -> Outcome {
        if buf == 0 {
            return Outcome::NullBuffer;
        }

        let (pid, tid) = split_pid_tgid(task.pid_tgid());
        self.store.put(
            CallKey::new(tid, kind),
            InFlightCall {
                buf,
                requested_len,
                pid,
            },
        );
        Outcome::Recorded
    }

    /// Match a returning call with its entry and emit the plaintext it moved.
    #[inline(always)]
    pub fn on_exit<T: Task>(&self, task: &T, kind: CallKind, ret: i32) -> Outcome {
        let (_, tid) = split_pid_tgid(task.pid_tgid());

        let Some(call) = self.store.take(CallKey::new(tid, kind)) else {
            return Outcome::Unmatched;
        };

        let Some(captured) = capture_len(ret) else {
            return Outcome::NoTransfer;
        };

        let Some(mut slot) = self.channel.reserve() else {
            return Outcome::ChannelFull;
        };

        let event = slot.event();
        if self
            .memory
            .read(call.pid, call.buf, &mut event.payload[..captured])
            .is_err()
        {
            slot.discard();
            return Outcome::ReadFault;
        }

        event.timestamp_ns = task.now_ns();
        event.tid = tid;
        event.pid = call.pid;
        event.uid = task.uid();
        event.byte_len = ret;
        event.captured_len = captured as u32;
        event.requested_len = call.requested_len;
        event.kind = kind as u8;
        event.comm = task.comm();

        slot.commit();
        Outcome::Emitted
    }
}
