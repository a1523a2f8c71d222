#![no_std]
#![no_main]

use aya_ebpf::{
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_get_current_uid_gid,
        bpf_ktime_get_ns, bpf_probe_read_user_buf,
    },
    macros::{map, uprobe, uretprobe},
    maps::{ring_buf::RingBufEntry, LruHashMap, PerCpuArray, RingBuf},
    programs::{ProbeContext, RetProbeContext},
};
use tlstap_common::{
    CallKey, CallKind, CapturedEvent, CorrelationStore, EventChannel, EventSlot, ForeignMemory,
    InFlightCall, Interceptor, MemoryFault, Outcome, Task, COMM_LEN, DEFAULT_CHANNEL_BYTES,
    DEFAULT_STORE_CAPACITY,
};

// =============================================================================
// Maps
// =============================================================================

/// In-flight SSL_read/SSL_write calls, keyed by `CallKey`.
/// LRU so orphaned entries (exit never fired) are evicted instead of
/// filling the table. Resized by the loader.
#[map]
static IN_FLIGHT: LruHashMap<u64, InFlightCall> =
    LruHashMap::with_max_entries(DEFAULT_STORE_CAPACITY, 0);

/// Ring buffer carrying captured plaintext to userspace. Resized by the loader.
#[map]
static SSL_EVENTS: RingBuf = RingBuf::with_byte_size(DEFAULT_CHANNEL_BYTES, 0);

/// Per-CPU counter for each `Outcome`
#[map]
static OUTCOMES: PerCpuArray<u64> = PerCpuArray::with_max_entries(Outcome::COUNT, 0);

// =============================================================================
// Kernel bindings for the correlation engine
// =============================================================================

struct CurrentTask;

impl Task for CurrentTask {
    #[inline(always)]
    fn pid_tgid(&self) -> u64 {
        bpf_get_current_pid_tgid()
    }

    #[inline(always)]
    fn uid(&self) -> u32 {
        bpf_get_current_uid_gid() as u32
    }

    #[inline(always)]
    fn comm(&self) -> [u8; COMM_LEN] {
        bpf_get_current_comm().unwrap_or([0u8; COMM_LEN])
    }

    #[inline(always)]
    fn now_ns(&self) -> u64 {
        unsafe { bpf_ktime_get_ns() }
    }
}

/// Reads from the current task, which is the caller on both probe sides
struct UserMemory;

impl ForeignMemory for UserMemory {
    #[inline(always)]
    fn read(&self, _pid: u32, addr: u64, dst: &mut [u8]) -> Result<(), MemoryFault> {
        unsafe { bpf_probe_read_user_buf(addr as *const u8, dst) }
            .map_err(|e| MemoryFault::Unreadable(e as i64))
    }
}

struct InFlightMap;

impl CorrelationStore for InFlightMap {
    #[inline(always)]
    fn put(&self, key: CallKey, call: InFlightCall) {
        // A failed insert leaves the exit unmatched
        let _ = IN_FLIGHT.insert(&key.as_u64(), &call, 0);
    }

    #[inline(always)]
    fn take(&self, key: CallKey) -> Option<InFlightCall> {
        let key = key.as_u64();
        let call = unsafe { IN_FLIGHT.get(&key) }.copied()?;
        // Whoever removes the entry owns it
        IN_FLIGHT.remove(&key).ok()?;
        Some(call)
    }
}

struct EventsRing;

struct EventsSlot(RingBufEntry<CapturedEvent>);

impl EventSlot for EventsSlot {
    #[inline(always)]
    fn event(&mut self) -> &mut CapturedEvent {
        unsafe { &mut *self.0.as_mut_ptr() }
    }

    #[inline(always)]
    fn commit(self) {
        self.0.submit(0);
    }

    #[inline(always)]
    fn discard(self) {
        self.0.discard(0);
    }
}

impl EventChannel for EventsRing {
    type Slot<'a>
        = EventsSlot
    where
        Self: 'a;

    #[inline(always)]
    fn reserve(&self) -> Option<EventsSlot> {
        SSL_EVENTS.reserve::<CapturedEvent>(0).map(EventsSlot)
    }
}

static TAP: Interceptor<InFlightMap, UserMemory, EventsRing> =
    Interceptor::new(InFlightMap, UserMemory, EventsRing);

#[inline(always)]
fn count(outcome: Outcome) {
    if let Some(counter) = OUTCOMES.get_ptr_mut(outcome.index()) {
        unsafe { *counter += 1 };
    }
}

// =============================================================================
// Probes
// =============================================================================

/// int SSL_read(SSL *ssl, void *buf, int num);
/// int SSL_write(SSL *ssl, const void *buf, int num);
#[inline(always)]
fn on_entry(ctx: &ProbeContext, kind: CallKind) -> u32 {
    let buf: u64 = ctx.arg(1).unwrap_or(0);
    let num: i32 = ctx.arg(2).unwrap_or(0);
    count(TAP.on_entry(&CurrentTask, kind, buf, num));
    0
}

#[inline(always)]
fn on_exit(ctx: &RetProbeContext, kind: CallKind) -> u32 {
    let ret: i32 = ctx.ret::<i32>();
    count(TAP.on_exit(&CurrentTask, kind, ret));
    0
}

#[uprobe]
pub fn ssl_read(ctx: ProbeContext) -> u32 {
    on_entry(&ctx, CallKind::Read)
}

#[uretprobe]
pub fn ssl_read_ret(ctx: RetProbeContext) -> u32 {
    on_exit(&ctx, CallKind::Read)
}

#[uprobe]
pub fn ssl_write(ctx: ProbeContext) -> u32 {
    on_entry(&ctx, CallKind::Write)
}

#[uretprobe]
pub fn ssl_write_ret(ctx: RetProbeContext) -> u32 {
    on_exit(&ctx, CallKind::Write)
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[unsafe(link_section = "license")]
#[unsafe(no_mangle)]
static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";
