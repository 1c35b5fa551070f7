//! The public allocator façade.
//!
//! Management calls (register, switch, readout) wire the registry, routing
//! and tally together; the allocation family routes every call through the
//! calling thread's flag word into the back-end and charges the usable size
//! to the bound client.  None of the allocation entry points block or take
//! a lock.

use std::marker::PhantomData;
use std::os::raw::{c_char, c_int};

use super::backend::{AllocBackend, PlatformBackend};
use super::client::{ClientHandle, DEFAULT_ESTIMATE_THRESHOLD, NO_CLIENT_INDEX};
use super::error::ArenaError;
use super::{registry, routing, tally};

/// Zero-byte requests are bumped to this size, mirroring the C library's
/// unique-pointer guarantee.
const MIN_ALLOC: usize = 8;

/// Charge an allocation of `size` (requested bytes) to `index`.  The tally
/// records the usable size the back-end will assign, so the matching free
/// cancels it exactly.
fn note_allocated(index: u8, size: usize, flags: c_int) {
    if !PlatformBackend::CAN_TRACK || index == NO_CLIENT_INDEX {
        return;
    }
    if let Some(tally) = tally::try_global() {
        tally.mem_allocated(index, PlatformBackend::usable_size_for(size, flags));
    }
}

/// Refund the allocation at `ptr` from `index`, sized by the back-end.
unsafe fn note_deallocated(index: u8, ptr: *mut u8, flags: c_int) {
    if !PlatformBackend::CAN_TRACK || index == NO_CLIENT_INDEX {
        return;
    }
    if let Some(tally) = tally::try_global() {
        // Safety: caller guarantees ptr is a live back-end allocation.
        let size = unsafe { PlatformBackend::allocation_size(ptr, flags) };
        tally.mem_deallocated(index, size);
    }
}

/// Entry point for multi-tenant accounting and allocation.
///
/// All state is process-wide; the type exists to namespace the operations
/// and to serve as a [`std::alloc::GlobalAlloc`] when the jemalloc back-end
/// is available.
pub struct ArenaMalloc;

impl ArenaMalloc {
    /// Claim a client slot and its arena.
    ///
    /// `thread_cache` asks for back-end thread caching on threads bound to
    /// this client; the global [`Self::set_thread_cache_enabled`] override
    /// wins when disabled.
    ///
    /// # Errors
    ///
    /// [`ArenaError::NoFreeClientSlots`] when all slots are occupied,
    /// [`ArenaError::ArenaCreationFailed`] when the back-end refuses an
    /// arena.
    pub fn register_client(thread_cache: bool) -> Result<ClientHandle, ArenaError> {
        registry::register_client(thread_cache)
    }

    /// Release a client slot.  The slot's arena is retained and reused by
    /// the next registration of that slot.
    ///
    /// # Errors
    ///
    /// [`ArenaError::ClientNotRegistered`] when the handle does not match a
    /// live slot.
    pub fn unregister_client(client: ClientHandle) -> Result<(), ArenaError> {
        registry::unregister_client(client)
    }

    /// Release the slot of whichever client the calling thread is bound to.
    ///
    /// # Errors
    ///
    /// [`ArenaError::UnboundThread`] when no client is bound,
    /// [`ArenaError::ClientNotRegistered`] when the bound slot is already
    /// free.
    pub fn unregister_current_client() -> Result<(), ArenaError> {
        registry::unregister_current_client()
    }

    /// Bind the calling thread to `client` until the next switch.
    ///
    /// # Errors
    ///
    /// [`ArenaError::TcacheCreationFailed`] when the back-end refuses a
    /// thread cache for this (thread, client) pair; the previous binding is
    /// left in place.
    pub fn switch_to_client(client: &ClientHandle) -> Result<(), ArenaError> {
        routing::switch_to_client(client)
    }

    /// Unbind the calling thread.  Subsequent allocations go to the default
    /// arena and are not tracked.
    pub fn switch_from_client() {
        routing::switch_from_client();
    }

    /// Exact live bytes for `client`: drains every shard into the aggregate.
    /// O(shards), lock-free.
    pub fn precise_allocated(client: &ClientHandle) -> u64 {
        if !PlatformBackend::CAN_TRACK {
            return 0;
        }
        tally::try_global().map_or(0, |tally| tally.precise_allocated(client.index))
    }

    /// Cheap live-bytes estimate for `client`: one atomic load, within
    /// `threshold * shards` of the precise figure.
    pub fn estimated_allocated(client: &ClientHandle) -> u64 {
        if !PlatformBackend::CAN_TRACK {
            return 0;
        }
        tally::try_global().map_or(0, |tally| tally.estimated_allocated(client.index))
    }

    /// Derive the client's shard drain threshold from its memory ceiling:
    /// `max_data_size * percent / 100`, spread over the shards, floored at
    /// 100 KiB so tiny tenants do not thrash the aggregate.
    pub fn set_estimate_update_threshold(client: &ClientHandle, max_data_size: u64, percent: f32) {
        if !PlatformBackend::CAN_TRACK {
            return;
        }
        let tally = tally::global();
        let per_shard =
            (max_data_size as f64 * f64::from(percent) / 100.0 / tally.shard_count() as f64) as u64;
        let bytes = per_shard
            .max(u64::from(DEFAULT_ESTIMATE_THRESHOLD))
            .min(u64::from(u32::MAX)) as u32;
        tally.set_threshold(client.index, bytes);
    }

    /// Globally enable or disable back-end thread caching.  Takes effect on
    /// the next `register_client`/`switch_to_client`.
    pub fn set_thread_cache_enabled(value: bool) {
        routing::set_tcache_enabled(value);
    }

    /// The back-end's own view of the client's arena: live small+large
    /// bytes after a statistics refresh.  Unlike the tally readouts this
    /// includes allocations made by *any* thread routed to the arena.
    ///
    /// # Errors
    ///
    /// [`ArenaError::BackendStatsFailed`] when the control-plane query
    /// fails.
    pub fn arena_allocated(client: &ClientHandle) -> Result<u64, ArenaError> {
        PlatformBackend::arena_allocated(client.arena)
    }

    /// Attach a caller-owned counter that mirrors the client's arena usage.
    /// The counter is written by [`Self::update_total_counters`] and
    /// detached when the client unregisters.
    ///
    /// # Errors
    ///
    /// [`ArenaError::ClientNotRegistered`] when the handle does not match a
    /// live slot.
    pub fn register_total_counter(
        client: &ClientHandle,
        counter: crate::sync::Arc<crate::counter::NonNegativeCounter<crate::counter::Saturate>>,
    ) -> Result<(), ArenaError> {
        registry::register_total_counter(client, counter)
    }

    /// Refresh every counter attached via
    /// [`Self::register_total_counter`] from the back-end's per-arena
    /// statistics.
    ///
    /// # Errors
    ///
    /// [`ArenaError::BackendStatsFailed`] when a statistics query fails.
    pub fn update_total_counters() -> Result<(), ArenaError> {
        registry::update_total_counters()
    }

    /// `malloc` equivalent.  A zero `size` is treated as a minimal 8-byte
    /// request.  Returns null on back-end failure.
    ///
    /// # Safety
    ///
    /// The returned pointer must be released with [`free`](Self::free),
    /// [`sized_free`](Self::sized_free) or [`realloc`](Self::realloc) from
    /// this façade.
    pub unsafe fn malloc(size: usize) -> *mut u8 {
        let size = if size == 0 { MIN_ALLOC } else { size };
        let (index, flags) = routing::current_binding();
        note_allocated(index, size, flags);
        // Safety: size is nonzero.
        unsafe { PlatformBackend::alloc(size, flags) }
    }

    /// `calloc` equivalent: zero-filled.  Returns null when `nmemb * size`
    /// overflows or the back-end fails.
    ///
    /// # Safety
    ///
    /// Same contract as [`malloc`](Self::malloc).
    pub unsafe fn calloc(nmemb: usize, size: usize) -> *mut u8 {
        let Some(total) = nmemb.checked_mul(size) else {
            return std::ptr::null_mut();
        };
        let total = if total == 0 { MIN_ALLOC } else { total };
        let (index, flags) = routing::current_binding();
        let flags = PlatformBackend::zeroed(flags);
        note_allocated(index, total, flags);
        // Safety: total is nonzero.
        unsafe { PlatformBackend::alloc(total, flags) }
    }

    /// `realloc` equivalent.  Null `ptr` degenerates to
    /// [`malloc`](Self::malloc); a zero `size` is treated as a minimal
    /// 8-byte request.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation from this façade; on success
    /// the old pointer must not be used again.
    pub unsafe fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
        let size = if size == 0 { MIN_ALLOC } else { size };
        let (index, flags) = routing::current_binding();
        if ptr.is_null() {
            note_allocated(index, size, flags);
            // Safety: size is nonzero.
            return unsafe { PlatformBackend::alloc(size, flags) };
        }
        // The old usable size must be read off before the resize recycles
        // `ptr`.
        // Safety: ptr is a live allocation per the caller contract.
        unsafe { note_deallocated(index, ptr, flags) };
        note_allocated(index, size, flags);
        // Safety: ptr live, size nonzero.
        unsafe { PlatformBackend::realloc(ptr, size, flags) }
    }

    /// `free` equivalent.  Null is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation from this façade; it must not
    /// be used afterwards.
    pub unsafe fn free(ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let (index, flags) = routing::current_binding();
        // Safety: ptr is a live allocation per the caller contract.
        unsafe {
            note_deallocated(index, ptr, flags);
            PlatformBackend::dealloc(ptr, flags);
        }
    }

    /// `free` with the requested size known to the caller, letting the
    /// back-end skip its size lookup.  Null is a no-op.
    ///
    /// # Safety
    ///
    /// Same contract as [`free`](Self::free); `size` must be the size passed
    /// to the allocating call.
    pub unsafe fn sized_free(ptr: *mut u8, size: usize) {
        if ptr.is_null() {
            return;
        }
        let size = if size == 0 { MIN_ALLOC } else { size };
        let (index, flags) = routing::current_binding();
        // Safety: ptr is a live allocation per the caller contract.
        unsafe {
            note_deallocated(index, ptr, flags);
            PlatformBackend::sized_dealloc(ptr, size, flags);
        }
    }

    /// `malloc_usable_size` equivalent.  Touches no counters; null reports
    /// zero.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation from this façade.
    pub unsafe fn usable_size(ptr: *mut u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        // Safety: ptr is a live allocation per the caller contract.
        unsafe { PlatformBackend::usable_size(ptr) }
    }

    /// `strdup` equivalent: the copy is charged to the bound client and must
    /// be released with [`free`](Self::free).
    ///
    /// # Safety
    ///
    /// `s` must point to a null-terminated string.
    pub unsafe fn strdup(s: *const c_char) -> *mut c_char {
        // Safety: s is null-terminated per the caller contract.
        let len = unsafe { std::ffi::CStr::from_ptr(s) }.to_bytes().len();
        // Safety: façade allocation.
        let dst = unsafe { Self::malloc(len + 1) };
        if !dst.is_null() {
            // Safety: dst has room for len + 1 bytes.
            unsafe { std::ptr::copy_nonoverlapping(s.cast::<u8>(), dst, len + 1) };
        }
        dst.cast::<c_char>()
    }
}

/// Binds a client for a lexical scope; the thread is switched back on every
/// exit path, including unwinding.
///
/// Not `Send`: the binding it manages is thread-local.
pub struct ClientGuard {
    _not_send: PhantomData<*mut ()>,
}

impl ClientGuard {
    /// Bind the calling thread to `client` until the guard drops.
    ///
    /// # Errors
    ///
    /// Same contract as [`ArenaMalloc::switch_to_client`].
    pub fn enter(client: &ClientHandle) -> Result<Self, ArenaError> {
        ArenaMalloc::switch_to_client(client)?;
        Ok(Self {
            _not_send: PhantomData,
        })
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        ArenaMalloc::switch_from_client();
    }
}

// Safety: memory comes from jemalloc sized and aligned per the layout; the
// accounting hooks do not touch the returned region.
#[cfg(all(feature = "jemalloc", not(any(loom, miri))))]
unsafe impl std::alloc::GlobalAlloc for ArenaMalloc {
    unsafe fn alloc(&self, layout: std::alloc::Layout) -> *mut u8 {
        let size = layout.size().max(MIN_ALLOC);
        let (index, flags) = routing::current_binding();
        let flags = super::backend::with_alignment(flags, layout.align());
        note_allocated(index, size, flags);
        // Safety: size is nonzero.
        unsafe { PlatformBackend::alloc(size, flags) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: std::alloc::Layout) {
        let size = layout.size().max(MIN_ALLOC);
        let (index, flags) = routing::current_binding();
        let flags = super::backend::with_alignment(flags, layout.align());
        // Safety: GlobalAlloc contract guarantees ptr/layout match the
        // allocation.
        unsafe {
            note_deallocated(index, ptr, flags);
            PlatformBackend::sized_dealloc(ptr, size, flags);
        }
    }

    unsafe fn alloc_zeroed(&self, layout: std::alloc::Layout) -> *mut u8 {
        let size = layout.size().max(MIN_ALLOC);
        let (index, flags) = routing::current_binding();
        let flags =
            PlatformBackend::zeroed(super::backend::with_alignment(flags, layout.align()));
        note_allocated(index, size, flags);
        // Safety: size is nonzero.
        unsafe { PlatformBackend::alloc(size, flags) }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_floor_wins_for_small_tenants() {
        let _guard = crate::arena::TEST_MUTEX.read().unwrap();
        let client = ArenaMalloc::register_client(false).unwrap();

        // 1 MiB ceiling at 1% spread over the shards lands far below the
        // floor.
        ArenaMalloc::set_estimate_update_threshold(&client, 1 << 20, 1.0);
        if PlatformBackend::CAN_TRACK {
            assert_eq!(
                tally::global().threshold(client.index()),
                DEFAULT_ESTIMATE_THRESHOLD
            );
        }

        ArenaMalloc::unregister_client(client).unwrap();
    }

    #[test]
    fn test_threshold_scales_with_ceiling() {
        let _guard = crate::arena::TEST_MUTEX.read().unwrap();
        let client = ArenaMalloc::register_client(false).unwrap();

        ArenaMalloc::set_estimate_update_threshold(&client, 1 << 30, 50.0);
        if PlatformBackend::CAN_TRACK {
            let tally = tally::global();
            let expected = (512u64 << 20) / tally.shard_count() as u64;
            assert_eq!(u64::from(tally.threshold(client.index())), expected);
        }

        ArenaMalloc::unregister_client(client).unwrap();
    }

    #[test]
    fn test_guard_unbinds_on_unwind() {
        let _guard = crate::arena::TEST_MUTEX.read().unwrap();
        let client = ArenaMalloc::register_client(false).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope = ClientGuard::enter(&client).unwrap();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(super::routing::current_index(), NO_CLIENT_INDEX);

        ArenaMalloc::unregister_client(client).unwrap();
    }

    #[test]
    fn test_guard_binds_for_scope() {
        let _guard = crate::arena::TEST_MUTEX.read().unwrap();
        let client = ArenaMalloc::register_client(false).unwrap();

        {
            let _scope = ClientGuard::enter(&client).unwrap();
            assert_eq!(super::routing::current_index(), client.index());
        }
        assert_eq!(super::routing::current_index(), NO_CLIENT_INDEX);

        ArenaMalloc::unregister_client(client).unwrap();
    }
}
