//! In-process correlation store
//!
//! Fixed-capacity, open-addressed table of in-flight calls for hosts that run
//! the interceptors outside the kernel. All slots are allocated up front; the
//! hot path never allocates and never waits on another thread. Each slot owns
//! its own state word: an operation claims a slot by swapping the key it saw
//! for `BUSY`, writes or reads the payload, then publishes the result. Two
//! operations therefore only ever meet on the same slot, never on a shared
//! lock.
//!
//! Keys are owned by one thread (a `CallKey` embeds the thread id), so the
//! only foreign writer a live entry can meet is an eviction. An operation
//! that loses that race sees the key as gone, which is exactly what the
//! eviction did.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tlstap_common::{CallKey, CorrelationStore, InFlightCall};

/// Slot state values that can never be a packed `CallKey`: a key carries
/// exactly one of the two high kind bits.
const EMPTY: u64 = 0;
const TOMBSTONE: u64 = 1;
const BUSY: u64 = u64::MAX;

/// Times a full store retries the oldest entry when a concurrent operation
/// claims it first
const EVICT_ATTEMPTS: u32 = 8;

#[inline]
fn is_live(state: u64) -> bool {
    !matches!(state, EMPTY | TOMBSTONE | BUSY)
}

struct Slot {
    /// Packed key, or one of `EMPTY`, `TOMBSTONE`, `BUSY`
    state: AtomicU64,
    buf: AtomicU64,
    /// `requested_len` in the low half, `pid` in the high half
    args: AtomicU64,
    /// Insertion stamp, smallest is evicted first
    stamp: AtomicU64,
}

impl Slot {
    fn vacant() -> Self {
        Self {
            state: AtomicU64::new(EMPTY),
            buf: AtomicU64::new(0),
            args: AtomicU64::new(0),
            stamp: AtomicU64::new(0),
        }
    }

    /// Swap `seen` for `BUSY`; the winner has the slot to itself
    #[inline]
    fn claim(&self, seen: u64) -> bool {
        self.state
            .compare_exchange(seen, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Fill a claimed slot and publish `key`
    fn publish(&self, key: u64, call: InFlightCall, stamp: u64) {
        self.buf.store(call.buf, Ordering::Relaxed);
        self.args.store(
            u64::from(call.requested_len as u32) | (u64::from(call.pid) << 32),
            Ordering::Relaxed,
        );
        self.stamp.store(stamp, Ordering::Relaxed);
        self.state.store(key, Ordering::Release);
    }

    /// Read a claimed slot and release it as a tombstone
    fn remove(&self) -> InFlightCall {
        let args = self.args.load(Ordering::Relaxed);
        let call = InFlightCall {
            buf: self.buf.load(Ordering::Relaxed),
            requested_len: args as u32 as i32,
            pid: (args >> 32) as u32,
        };
        self.state.store(TOMBSTONE, Ordering::Release);
        call
    }
}

/// Bounded map from [`CallKey`] to [`InFlightCall`] with per-slot atomicity.
///
/// `put` overwrites an existing entry for the same key, otherwise takes the
/// first free slot on the key's lookup path. Only when no slot in the
/// whole table is free does it evict the oldest entry. `take` removes and
/// returns the entry for a key; whoever claims the slot first owns it.
///
/// Lookups stop at the first never-used slot. Slots only return to that state
/// through [`SlotStore::clear`], which excludes every other operation.
pub struct SlotStore {
    slots: Box<[Slot]>,
    clock: AtomicU64,
    /// Shared by put/take, exclusive for clear. Put/take only ever *try* it,
    /// so they still never wait: while a clear runs they give up, and the
    /// clear leaves nothing stale behind them.
    reset: RwLock<()>,
}

impl SlotStore {
    /// Create a store holding at most `capacity` in-flight calls.
    ///
    /// # Panics
    ///
    /// Panics if capacity is 0; validate configuration before construction.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "correlation store capacity must be > 0");

        Self {
            slots: (0..capacity).map(|_| Slot::vacant()).collect(),
            clock: AtomicU64::new(0),
            reset: RwLock::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of entries currently held (in-flight or orphaned)
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| is_live(slot.state.load(Ordering::Acquire)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry, orphans included (detach/reset)
    pub fn clear(&self) {
        let _reset = self.reset.write();
        for slot in self.slots.iter() {
            slot.state.store(EMPTY, Ordering::Release);
        }
    }

    fn home(&self, key: u64) -> usize {
        // Fibonacci hashing, the low bits of thread ids are too regular
        let hash = key.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32;
        hash as usize % self.slots.len()
    }

    /// Every slot index once, starting at the key's home slot
    fn lookup_path(&self, key: u64) -> impl Iterator<Item = usize> {
        let len = self.slots.len();
        let home = self.home(key);
        (0..len).map(move |i| (home + i) % len)
    }

    fn oldest(&self) -> Option<(usize, u64)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let state = slot.state.load(Ordering::Acquire);
                is_live(state).then(|| (index, state, slot.stamp.load(Ordering::Relaxed)))
            })
            .min_by_key(|&(_, _, stamp)| stamp)
            .map(|(index, state, _)| (index, state))
    }
}

impl CorrelationStore for SlotStore {
    fn put(&self, key: CallKey, call: InFlightCall) {
        let Some(_reset) = self.reset.try_read() else {
            return;
        };
        let key = key.as_u64();
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed) + 1;

        // Overwrite in place
        for index in self.lookup_path(key) {
            let slot = &self.slots[index];
            match slot.state.load(Ordering::Acquire) {
                EMPTY => break,
                state if state == key => {
                    if slot.claim(key) {
                        slot.publish(key, call, stamp);
                        return;
                    }
                    // Evicted under us; insert as new
                    break;
                }
                _ => {}
            }
        }

        // First free slot on the lookup path
        for index in self.lookup_path(key) {
            let slot = &self.slots[index];
            let state = slot.state.load(Ordering::Acquire);
            if (state == EMPTY || state == TOMBSTONE) && slot.claim(state) {
                slot.publish(key, call, stamp);
                return;
            }
        }

        // Full: no never-used slot is left, so the key may land anywhere
        for _ in 0..EVICT_ATTEMPTS {
            let Some((index, state)) = self.oldest() else {
                break;
            };
            let slot = &self.slots[index];
            if slot.claim(state) {
                slot.publish(key, call, stamp);
                return;
            }
        }
        // Every candidate was claimed by someone else. The key is absent, so
        // the matching exit finds nothing rather than a stale buffer.
    }

    fn take(&self, key: CallKey) -> Option<InFlightCall> {
        let _reset = self.reset.try_read()?;
        let key = key.as_u64();

        for index in self.lookup_path(key) {
            let slot = &self.slots[index];
            match slot.state.load(Ordering::Acquire) {
                EMPTY => return None,
                state if state == key => {
                    return slot.claim(key).then(|| slot.remove());
                }
                _ => {}
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tlstap_common::CallKind;

    fn call(buf: u64) -> InFlightCall {
        InFlightCall {
            buf,
            requested_len: 256,
            pid: 100,
        }
    }

    #[test]
    fn test_put_then_take() {
        let store = SlotStore::with_capacity(64);
        let key = CallKey::new(7, CallKind::Read);

        store.put(key, call(0x1000));
        assert_eq!(store.len(), 1);
        assert_eq!(store.take(key), Some(call(0x1000)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_args_survive_packing() {
        let store = SlotStore::with_capacity(4);
        let key = CallKey::new(9, CallKind::Write);
        let original = InFlightCall {
            buf: 0x7fff_dead_beef,
            requested_len: -1,
            pid: u32::MAX,
        };

        store.put(key, original);
        assert_eq!(store.take(key), Some(original));
    }

    #[test]
    fn test_take_miss() {
        let store = SlotStore::with_capacity(64);
        assert_eq!(store.take(CallKey::new(1, CallKind::Write)), None);
    }

    #[test]
    fn test_take_is_once() {
        let store = SlotStore::with_capacity(64);
        let key = CallKey::new(3, CallKind::Write);
        store.put(key, call(0x10));
        assert!(store.take(key).is_some());
        assert!(store.take(key).is_none());
    }

    #[test]
    fn test_put_overwrites_same_key() {
        let store = SlotStore::with_capacity(64);
        let key = CallKey::new(7, CallKind::Read);

        store.put(key, call(0x1000));
        store.put(key, call(0x2000));
        assert_eq!(store.len(), 1);
        assert_eq!(store.take(key), Some(call(0x2000)));
    }

    #[test]
    fn test_overwrite_after_tombstone_on_lookup_path() {
        let store = SlotStore::with_capacity(8);
        let (first, second) = colliding_keys(&store);

        store.put(first, call(0x1));
        store.put(second, call(0x2));
        // Leaves a tombstone in front of `second`
        assert_eq!(store.take(first), Some(call(0x1)));

        store.put(second, call(0x3));
        assert_eq!(store.len(), 1);
        assert_eq!(store.take(second), Some(call(0x3)));
        assert_eq!(store.take(second), None);
    }

    #[test]
    fn test_kinds_do_not_collide() {
        let store = SlotStore::with_capacity(64);
        store.put(CallKey::new(7, CallKind::Read), call(0x1));
        store.put(CallKey::new(7, CallKind::Write), call(0x2));

        assert_eq!(store.take(CallKey::new(7, CallKind::Read)), Some(call(0x1)));
        assert_eq!(store.take(CallKey::new(7, CallKind::Write)), Some(call(0x2)));
    }

    /// Two distinct keys whose lookup paths start at the same slot
    fn colliding_keys(store: &SlotStore) -> (CallKey, CallKey) {
        let first = CallKey::new(1, CallKind::Read);
        let home = store.home(first.as_u64());
        let second = (2..)
            .map(|tid| CallKey::new(tid, CallKind::Read))
            .find(|key| store.home(key.as_u64()) == home)
            .unwrap();
        (first, second)
    }

    #[test]
    fn test_colliding_keys_both_kept_below_capacity() {
        let store = SlotStore::with_capacity(16);
        let (first, second) = colliding_keys(&store);

        store.put(first, call(0x1));
        store.put(second, call(0x2));

        assert_eq!(store.len(), 2);
        assert_eq!(store.take(first), Some(call(0x1)));
        assert_eq!(store.take(second), Some(call(0x2)));
    }

    #[test]
    fn test_every_key_kept_up_to_capacity() {
        for capacity in [1, 16, 20, 1024] {
            let store = SlotStore::with_capacity(capacity);
            let keys: Vec<_> = (0..capacity as u64)
                .map(|tid| CallKey::new(tid, CallKind::Read))
                .collect();

            for (i, key) in keys.iter().enumerate() {
                store.put(*key, call(i as u64));
            }
            assert_eq!(store.len(), capacity);

            for (i, key) in keys.iter().enumerate() {
                assert_eq!(store.take(*key), Some(call(i as u64)), "capacity {}", capacity);
            }
            assert!(store.is_empty());
        }
    }

    #[test]
    fn test_full_store_evicts_oldest() {
        let store = SlotStore::with_capacity(3);
        let keys: Vec<_> = (1..=4)
            .map(|tid| CallKey::new(tid, CallKind::Read))
            .collect();

        for (i, key) in keys.iter().enumerate() {
            store.put(*key, call(i as u64));
        }

        assert_eq!(store.len(), 3);
        assert_eq!(store.take(keys[0]), None);
        assert_eq!(store.take(keys[1]), Some(call(1)));
        assert_eq!(store.take(keys[2]), Some(call(2)));
        assert_eq!(store.take(keys[3]), Some(call(3)));
    }

    #[test]
    fn test_overwrite_in_full_store_keeps_other_entries() {
        let store = SlotStore::with_capacity(4);
        let keys: Vec<_> = (1..=4)
            .map(|tid| CallKey::new(tid, CallKind::Write))
            .collect();
        for key in &keys {
            store.put(*key, call(0x1000));
        }

        store.put(keys[0], call(0x2000));

        assert_eq!(store.len(), 4);
        assert_eq!(store.take(keys[0]), Some(call(0x2000)));
        for key in &keys[1..] {
            assert_eq!(store.take(*key), Some(call(0x1000)));
        }
    }

    #[test]
    fn test_overwrite_while_other_slots_are_claimed() {
        let store = SlotStore::with_capacity(4);
        let key = CallKey::new(1, CallKind::Read);
        store.put(key, call(0x1000));
        for tid in 2..=4 {
            store.put(CallKey::new(tid, CallKind::Read), call(tid));
        }

        // Other threads mid-operation on every other slot
        for slot in store.slots.iter() {
            if slot.state.load(Ordering::Relaxed) != key.as_u64() {
                slot.state.store(BUSY, Ordering::Relaxed);
            }
        }

        store.put(key, call(0x2000));
        assert_eq!(store.take(key), Some(call(0x2000)));
    }

    #[test]
    fn test_failed_put_never_leaves_stale_entry() {
        let store = SlotStore::with_capacity(2);
        let key = CallKey::new(1, CallKind::Read);
        store.put(key, call(0x1000));
        store.put(CallKey::new(2, CallKind::Read), call(0x2));

        // The old entry is being evicted and the other slot is claimed too,
        // so the new put has nowhere to land
        for slot in store.slots.iter() {
            slot.state.store(BUSY, Ordering::Relaxed);
        }
        store.put(key, call(0x2000));

        for slot in store.slots.iter() {
            assert_ne!(slot.state.load(Ordering::Relaxed), key.as_u64());
        }
        assert_eq!(store.take(key), None);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let store = SlotStore::with_capacity(20);
        for tid in 0..500 {
            store.put(CallKey::new(tid, CallKind::Read), call(tid));
        }
        assert_eq!(store.len(), 20);
        assert_eq!(store.capacity(), 20);

        // The survivors are the 20 newest
        for tid in 480..500 {
            assert_eq!(store.take(CallKey::new(tid, CallKind::Read)), Some(call(tid)));
        }
    }

    #[test]
    fn test_clear_drops_orphans() {
        let store = SlotStore::with_capacity(16);
        for tid in 0..10 {
            store.put(CallKey::new(tid, CallKind::Write), call(tid));
        }
        store.clear();
        assert!(store.is_empty());

        let key = CallKey::new(3, CallKind::Write);
        assert_eq!(store.take(key), None);
        store.put(key, call(0x30));
        assert_eq!(store.take(key), Some(call(0x30)));
    }

    #[test]
    #[should_panic(expected = "capacity must be > 0")]
    fn test_zero_capacity_panics() {
        let _ = SlotStore::with_capacity(0);
    }

    #[test]
    fn test_concurrent_threads_get_their_own_entries() {
        let store = Arc::new(SlotStore::with_capacity(256));

        let handles: Vec<_> = (0..8u64)
            .map(|tid| {
                let store = store.clone();
                thread::spawn(move || {
                    let key = CallKey::new(tid, CallKind::Read);
                    for i in 0..2_000u64 {
                        let buf = (tid << 32) | i;
                        store.put(key, call(buf));
                        assert_eq!(store.take(key), Some(call(buf)));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_eviction_never_mixes_threads() {
        // More threads than slots, so puts keep evicting each other
        let store = Arc::new(SlotStore::with_capacity(4));

        let handles: Vec<_> = (0..8u64)
            .map(|tid| {
                let store = store.clone();
                thread::spawn(move || {
                    let key = CallKey::new(tid, CallKind::Write);
                    for i in 0..2_000u64 {
                        let buf = (tid << 32) | i;
                        store.put(key, call(buf));
                        if let Some(found) = store.take(key) {
                            assert_eq!(found, call(buf));
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(store.len() <= 4);
    }
}
