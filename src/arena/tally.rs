//! Sharded per-client byte tally.
//!
//! Every client owns one cache-line-padded signed counter per shard plus a
//! single padded aggregate ("estimate").  Writers touch only the shard for
//! their current CPU with relaxed RMWs; once a shard's magnitude passes the
//! client's drain threshold the writer swaps the shard to zero and folds the
//! taken value into the aggregate.  Readers either load the aggregate alone
//! (cheap, within `threshold * shards` of truth) or drain every shard first
//! (precise).
//!
//! Individual shards may legitimately go negative: a thread can free from a
//! different shard than the one that saw the allocation.  The aggregate sum
//! is correct; readers clamp at zero.

use crate::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use crate::sync::OnceLock;
use crossbeam_utils::CachePadded;

use super::client::{DEFAULT_ESTIMATE_THRESHOLD, MAX_CLIENTS, NO_CLIENT_INDEX};

/// Upper bound on the shard array; beyond this the precise readout cost
/// outweighs the contention win.
const MAX_SHARDS: usize = 128;

struct ClientTally {
    /// Sum of everything drained out of the shards.  May transiently go
    /// negative.
    estimate: CachePadded<AtomicI64>,
    /// Per-shard magnitude past which the shard drains into `estimate`.
    threshold: AtomicU32,
    shards: Box<[CachePadded<AtomicI64>]>,
}

impl ClientTally {
    fn new(shards: usize) -> Self {
        Self {
            estimate: CachePadded::new(AtomicI64::new(0)),
            threshold: AtomicU32::new(DEFAULT_ESTIMATE_THRESHOLD),
            shards: (0..shards)
                .map(|_| CachePadded::new(AtomicI64::new(0)))
                .collect(),
        }
    }
}

pub(crate) struct ShardedTally {
    shard_mask: usize,
    clients: Box<[ClientTally]>,
}

impl ShardedTally {
    pub(crate) fn new() -> Self {
        Self::with_shards(detected_shards())
    }

    /// Build a tally with an explicit shard count (power of two).
    pub(crate) fn with_shards(shards: usize) -> Self {
        assert!(shards.is_power_of_two());
        Self {
            shard_mask: shards - 1,
            clients: (0..MAX_CLIENTS).map(|_| ClientTally::new(shards)).collect(),
        }
    }

    pub(crate) fn shard_count(&self) -> usize {
        self.shard_mask + 1
    }

    /// Reset a client's counters when its slot is (re)registered.  A slot
    /// can carry drift from its previous occupant; the new client starts
    /// from zero.
    pub(crate) fn client_registered(&self, index: u8) {
        let client = &self.clients[index as usize];
        client.estimate.store(0, Ordering::Relaxed);
        client
            .threshold
            .store(DEFAULT_ESTIMATE_THRESHOLD, Ordering::Relaxed);
        for shard in client.shards.iter() {
            shard.swap(0, Ordering::Relaxed);
        }
    }

    pub(crate) fn set_threshold(&self, index: u8, bytes: u32) {
        self.clients[index as usize]
            .threshold
            .store(bytes, Ordering::Relaxed);
    }

    pub(crate) fn threshold(&self, index: u8) -> u32 {
        self.clients[index as usize].threshold.load(Ordering::Relaxed)
    }

    /// Charge `bytes` to the client's shard for the current CPU.
    pub(crate) fn mem_allocated(&self, index: u8, bytes: usize) {
        if index == NO_CLIENT_INDEX {
            return;
        }
        let client = &self.clients[index as usize];
        let shard = &client.shards[current_shard() & self.shard_mask];
        let new_value = shard.fetch_add(bytes as i64, Ordering::Relaxed) + bytes as i64;
        self.maybe_drain(client, shard, new_value);
    }

    /// Refund `bytes` from the client's shard for the current CPU.
    pub(crate) fn mem_deallocated(&self, index: u8, bytes: usize) {
        if index == NO_CLIENT_INDEX {
            return;
        }
        let client = &self.clients[index as usize];
        let shard = &client.shards[current_shard() & self.shard_mask];
        let new_value = shard.fetch_sub(bytes as i64, Ordering::Relaxed) - bytes as i64;
        self.maybe_drain(client, shard, new_value);
    }

    /// The comparison uses the shard value after the RMW, so one extreme
    /// delta can briefly exceed the threshold before the drain lands.
    fn maybe_drain(&self, client: &ClientTally, shard: &AtomicI64, new_value: i64) {
        if new_value.unsigned_abs() > u64::from(client.threshold.load(Ordering::Relaxed)) {
            client
                .estimate
                .fetch_add(shard.swap(0, Ordering::Relaxed), Ordering::Relaxed);
        }
    }

    /// Drain every shard into the aggregate and report it.  O(shards); safe
    /// to call from any thread concurrently with writers.  After it returns,
    /// every visited shard has been folded in, so repeated reads stay cheap.
    pub(crate) fn precise_allocated(&self, index: u8) -> u64 {
        let client = &self.clients[index as usize];
        for shard in client.shards.iter() {
            client
                .estimate
                .fetch_add(shard.swap(0, Ordering::Relaxed), Ordering::Relaxed);
        }
        // Can still be negative, e.g. shard 0 allocated after we read it
        // while shard n's deallocation was folded in.
        client.estimate.load(Ordering::Relaxed).max(0) as u64
    }

    /// One relaxed load of the aggregate; within `threshold * shards` of the
    /// precise figure.
    pub(crate) fn estimated_allocated(&self, index: u8) -> u64 {
        self.clients[index as usize]
            .estimate
            .load(Ordering::Relaxed)
            .max(0) as u64
    }
}

static TALLY: OnceLock<ShardedTally> = OnceLock::new();

/// The process-wide tally, built on first client registration.  Never called
/// from the allocation path: building the shard arrays allocates, and the
/// hot path must not re-enter the allocator.
pub(crate) fn global() -> &'static ShardedTally {
    TALLY.get_or_init(ShardedTally::new)
}

/// Hot-path accessor.  `None` simply means no client was ever registered,
/// hence nothing can be tracked.
pub(crate) fn try_global() -> Option<&'static ShardedTally> {
    TALLY.get()
}

fn detected_shards() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
        .next_power_of_two()
        .min(MAX_SHARDS)
}

/// Shard selector: the current CPU on Linux, a sticky per-thread slot
/// elsewhere.  Only distribution matters, not accuracy; a stale CPU id just
/// routes the delta to another shard, which the aggregate absorbs.
#[cfg(all(target_os = "linux", not(loom)))]
fn current_shard() -> usize {
    // sched_getcpu reports -1 only on pre-2.6.20 kernels; fold it to shard 0.
    let cpu = unsafe { libc::sched_getcpu() };
    cpu.max(0) as usize
}

#[cfg(all(not(target_os = "linux"), not(loom)))]
fn current_shard() -> usize {
    use std::sync::atomic::{AtomicUsize, Ordering};
    thread_local! {
        static SLOT: usize = {
            // Plain std atomic: only uniqueness is needed.
            static NEXT: AtomicUsize = AtomicUsize::new(0);
            NEXT.fetch_add(1, Ordering::Relaxed)
        };
    }
    SLOT.with(|slot| *slot)
}

// Loom explorations must be deterministic per schedule, so every thread maps
// to shard 0.  Cross-shard traffic is covered by the non-loom tests.
#[cfg(loom)]
fn current_shard() -> usize {
    0
}
