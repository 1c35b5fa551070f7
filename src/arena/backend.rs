use super::error::ArenaError;
use std::os::raw::c_int;

/// Abstract interface for the native allocator underneath the accounting
/// layer.
///
/// The contract mirrors jemalloc's non-standard API: opaque arena ids
/// (nonzero, never destroyed), opaque thread-cache ids (created and
/// destroyed on demand), allocation entry points taking a composed flag
/// word, and size queries for both a hypothetical request
/// ([`usable_size_for`](AllocBackend::usable_size_for)) and a live
/// allocation ([`allocation_size`](AllocBackend::allocation_size)).
pub(crate) trait AllocBackend {
    /// Whether per-client accounting is meaningful on this back-end.  When
    /// false the tally hooks are skipped and usage queries report zero.
    const CAN_TRACK: bool;

    /// Ask the back-end for a new arena id.  Arena ids are nonzero; 0 means
    /// "default arena" throughout the crate.
    fn create_arena() -> Result<u32, ArenaError>;

    /// Ask the back-end for a new thread-cache id for the calling thread.
    fn create_tcache() -> Result<u32, ArenaError>;

    /// Return a thread-cache id to the back-end.  Must be called from the
    /// thread that created it.
    fn destroy_tcache(id: u32) -> Result<(), ArenaError>;

    /// Flag word for the default arena, with or without thread caching.
    fn default_flags(thread_cache: bool) -> c_int;

    /// Flag word routing to `arena`, with the given thread cache (or none).
    fn client_flags(arena: u32, tcache: Option<u32>) -> c_int;

    /// Add the zero-fill request to a flag word.
    fn zeroed(flags: c_int) -> c_int;

    /// Allocate `size` bytes (`size > 0`) under `flags`.  Null on failure.
    unsafe fn alloc(size: usize, flags: c_int) -> *mut u8;

    /// Resize an allocation (`size > 0`, `ptr` non-null).  Null on failure,
    /// in which case `ptr` is still valid.
    unsafe fn realloc(ptr: *mut u8, size: usize, flags: c_int) -> *mut u8;

    /// Release an allocation.
    unsafe fn dealloc(ptr: *mut u8, flags: c_int);

    /// Release an allocation whose requested size is known to the caller.
    unsafe fn sized_dealloc(ptr: *mut u8, size: usize, flags: c_int);

    /// The usable size the back-end would assign to a request of `size`
    /// under `flags` (`size > 0`).
    fn usable_size_for(size: usize, flags: c_int) -> usize;

    /// The usable size of the live allocation at `ptr`.
    unsafe fn allocation_size(ptr: *mut u8, flags: c_int) -> usize;

    /// Public usable-size query (`malloc_usable_size` equivalent).
    unsafe fn usable_size(ptr: *mut u8) -> usize;

    /// Live small+large bytes of `arena`, refreshing the statistics epoch
    /// first.
    fn arena_allocated(arena: u32) -> Result<u64, ArenaError>;
}

pub(crate) struct PlatformBackend;

#[cfg(all(feature = "jemalloc", not(any(loom, miri))))]
mod jemalloc {
    use super::{AllocBackend, ArenaError, PlatformBackend};
    use crate::sync::OnceLock;
    use std::os::raw::{c_char, c_int, c_uint, c_void};
    use std::ptr::null_mut;
    use tikv_jemalloc_sys as je;

    // mallctl names are null-terminated C strings.
    const ARENAS_CREATE: &[u8] = b"arenas.create\0";
    const TCACHE_CREATE: &[u8] = b"tcache.create\0";
    const TCACHE_DESTROY: &[u8] = b"tcache.destroy\0";
    const EPOCH: &[u8] = b"epoch\0";
    // Index 2 of the translated mib is replaced with the arena id at query
    // time (mib translation is arena-independent).
    const STATS_SMALL: &[u8] = b"stats.arenas.0.small.allocated\0";
    const STATS_LARGE: &[u8] = b"stats.arenas.0.large.allocated\0";

    /// Read a `unsigned`-typed mallctl that creates a resource (arenas.create,
    /// tcache.create).
    fn ctl_read_u32(name: &'static [u8]) -> Result<u32, i32> {
        let mut out: c_uint = 0;
        let mut len = std::mem::size_of::<c_uint>();
        // Safety: name is null-terminated and out/len describe a valid
        // c_uint.
        let rv = unsafe {
            je::mallctl(
                name.as_ptr().cast::<c_char>(),
                (&mut out as *mut c_uint).cast::<c_void>(),
                &mut len,
                null_mut(),
                0,
            )
        };
        if rv != 0 {
            Err(rv)
        } else {
            Ok(out)
        }
    }

    #[derive(Clone, Copy)]
    struct StatsMib {
        mib: [usize; 8],
        len: usize,
    }

    fn name_to_mib(name: &'static [u8]) -> Result<StatsMib, i32> {
        let mut mib = [0usize; 8];
        let mut len = mib.len();
        // Safety: name is null-terminated; mib/len describe the local array.
        let rv = unsafe {
            je::mallctlnametomib(name.as_ptr().cast::<c_char>(), mib.as_mut_ptr(), &mut len)
        };
        if rv != 0 {
            Err(rv)
        } else {
            Ok(StatsMib { mib, len })
        }
    }

    static MIB_SMALL: OnceLock<Result<StatsMib, i32>> = OnceLock::new();
    static MIB_LARGE: OnceLock<Result<StatsMib, i32>> = OnceLock::new();

    /// Per-arena allocated-bytes metric, one of the two size-class families.
    fn read_arena_stat(
        cache: &OnceLock<Result<StatsMib, i32>>,
        name: &'static [u8],
        arena: u32,
    ) -> Result<u64, ArenaError> {
        let mut mib = match cache.get_or_init(|| name_to_mib(name)) {
            Ok(m) => *m,
            Err(rv) => {
                return Err(ArenaError::BackendStatsFailed {
                    what: "mallctlnametomib",
                    rv: *rv,
                })
            }
        };
        mib.mib[2] = arena as usize;

        let mut allocated: usize = 0;
        let mut len = std::mem::size_of::<usize>();
        // Safety: mib/len come from mallctlnametomib; allocated is a valid
        // size_t.
        let rv = unsafe {
            je::mallctlbymib(
                mib.mib.as_ptr(),
                mib.len,
                (&mut allocated as *mut usize).cast::<c_void>(),
                &mut len,
                null_mut(),
                0,
            )
        };
        if rv != 0 {
            return Err(ArenaError::BackendStatsFailed {
                what: "mallctlbymib",
                rv,
            });
        }
        Ok(allocated as u64)
    }

    /// Statistics are cached by jemalloc; bump the epoch so the subsequent
    /// reads see current values.
    fn refresh_epoch() -> Result<(), ArenaError> {
        let mut epoch: u64 = 1;
        let mut len = std::mem::size_of::<u64>();
        // Safety: epoch/len describe a valid u64, passed as both old and new
        // value.
        let rv = unsafe {
            je::mallctl(
                EPOCH.as_ptr().cast::<c_char>(),
                (&mut epoch as *mut u64).cast::<c_void>(),
                &mut len,
                (&mut epoch as *mut u64).cast::<c_void>(),
                std::mem::size_of::<u64>(),
            )
        };
        if rv != 0 {
            return Err(ArenaError::BackendStatsFailed { what: "epoch", rv });
        }
        Ok(())
    }

    /// Compose an alignment request into a flag word (`align` must be a
    /// power of two).  Only needed by the layout-aware `GlobalAlloc`
    /// adapter; the byte-wise API relies on jemalloc's natural alignment.
    pub(crate) fn with_alignment(flags: c_int, align: usize) -> c_int {
        if align > 8 {
            flags | je::MALLOCX_ALIGN(align)
        } else {
            flags
        }
    }

    impl AllocBackend for PlatformBackend {
        const CAN_TRACK: bool = true;

        fn create_arena() -> Result<u32, ArenaError> {
            let arena = ctl_read_u32(ARENAS_CREATE).map_err(ArenaError::ArenaCreationFailed)?;
            // Arena 0 is the default arena and must never be handed to a
            // client.
            if arena == 0 {
                return Err(ArenaError::ArenaCreationFailed(0));
            }
            log::debug!("created jemalloc arena {arena}");
            Ok(arena)
        }

        fn create_tcache() -> Result<u32, ArenaError> {
            ctl_read_u32(TCACHE_CREATE).map_err(ArenaError::TcacheCreationFailed)
        }

        fn destroy_tcache(id: u32) -> Result<(), ArenaError> {
            let mut id: c_uint = id;
            // Safety: name is null-terminated and id is a valid c_uint.
            let rv = unsafe {
                je::mallctl(
                    TCACHE_DESTROY.as_ptr().cast::<c_char>(),
                    null_mut(),
                    null_mut(),
                    (&mut id as *mut c_uint).cast::<c_void>(),
                    std::mem::size_of::<c_uint>(),
                )
            };
            if rv != 0 {
                return Err(ArenaError::TcacheDestructionFailed(rv));
            }
            Ok(())
        }

        fn default_flags(thread_cache: bool) -> c_int {
            if thread_cache {
                0
            } else {
                je::MALLOCX_TCACHE_NONE
            }
        }

        fn client_flags(arena: u32, tcache: Option<u32>) -> c_int {
            let tcache_flags = match tcache {
                Some(id) => je::MALLOCX_TCACHE(id as usize),
                None => je::MALLOCX_TCACHE_NONE,
            };
            je::MALLOCX_ARENA(arena as usize) | tcache_flags
        }

        fn zeroed(flags: c_int) -> c_int {
            flags | je::MALLOCX_ZERO
        }

        unsafe fn alloc(size: usize, flags: c_int) -> *mut u8 {
            debug_assert!(size > 0);
            // Safety: size is nonzero per the trait contract.
            unsafe { je::mallocx(size, flags).cast::<u8>() }
        }

        unsafe fn realloc(ptr: *mut u8, size: usize, flags: c_int) -> *mut u8 {
            debug_assert!(!ptr.is_null() && size > 0);
            // Safety: ptr is a live jemalloc allocation and size is nonzero.
            unsafe { je::rallocx(ptr.cast::<c_void>(), size, flags).cast::<u8>() }
        }

        unsafe fn dealloc(ptr: *mut u8, flags: c_int) {
            // Safety: ptr is a live jemalloc allocation.
            unsafe { je::dallocx(ptr.cast::<c_void>(), flags) }
        }

        unsafe fn sized_dealloc(ptr: *mut u8, size: usize, flags: c_int) {
            // Safety: ptr is a live jemalloc allocation of requested size
            // `size`.
            unsafe { je::sdallocx(ptr.cast::<c_void>(), size, flags) }
        }

        fn usable_size_for(size: usize, flags: c_int) -> usize {
            debug_assert!(size > 0);
            // Safety: nallocx performs no allocation; size is nonzero.
            unsafe { je::nallocx(size, flags) }
        }

        unsafe fn allocation_size(ptr: *mut u8, flags: c_int) -> usize {
            // Safety: ptr is a live jemalloc allocation.
            unsafe { je::sallocx(ptr.cast::<c_void>(), flags) }
        }

        unsafe fn usable_size(ptr: *mut u8) -> usize {
            // Safety: ptr is a live jemalloc allocation.
            unsafe { je::malloc_usable_size(ptr.cast::<c_void>()) }
        }

        fn arena_allocated(arena: u32) -> Result<u64, ArenaError> {
            refresh_epoch()?;
            let small = read_arena_stat(&MIB_SMALL, STATS_SMALL, arena)?;
            let large = read_arena_stat(&MIB_LARGE, STATS_LARGE, arena)?;
            Ok(small + large)
        }
    }
}

#[cfg(all(feature = "jemalloc", not(any(loom, miri))))]
pub(crate) use jemalloc::with_alignment;

// ---------------------------------------------------------------------------
// Fallback: no jemalloc present (or loom/miri, which cannot run the FFI).
//
// Allocations go to the global Rust allocator with a 16-byte size header so
// the layout can be recovered from the pointer alone.  There are no real
// arenas or thread caches; ids are synthetic and accounting is disabled
// (`CAN_TRACK = false`), so usage queries report zero.
// ---------------------------------------------------------------------------
#[cfg(any(not(feature = "jemalloc"), loom, miri))]
mod system {
    use super::{AllocBackend, ArenaError, PlatformBackend};
    use std::alloc::Layout;
    use std::os::raw::c_int;
    use std::ptr::null_mut;

    const HEADER: usize = 16;
    const ALIGN: usize = 16;

    // The one flag bit the fallback honours.
    const ZERO_FLAG: c_int = 0x40;

    fn layout_for(size: usize) -> Option<Layout> {
        Layout::from_size_align(size.checked_add(HEADER)?, ALIGN).ok()
    }

    fn next_id(counter: &std::sync::atomic::AtomicU32) -> u32 {
        // Plain std atomic: only uniqueness is needed, loom does not have to
        // model it.
        counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    impl AllocBackend for PlatformBackend {
        const CAN_TRACK: bool = false;

        fn create_arena() -> Result<u32, ArenaError> {
            static NEXT_ARENA: std::sync::atomic::AtomicU32 =
                std::sync::atomic::AtomicU32::new(1);
            Ok(next_id(&NEXT_ARENA))
        }

        fn create_tcache() -> Result<u32, ArenaError> {
            static NEXT_TCACHE: std::sync::atomic::AtomicU32 =
                std::sync::atomic::AtomicU32::new(1);
            Ok(next_id(&NEXT_TCACHE))
        }

        fn destroy_tcache(_id: u32) -> Result<(), ArenaError> {
            Ok(())
        }

        fn default_flags(_thread_cache: bool) -> c_int {
            0
        }

        fn client_flags(_arena: u32, _tcache: Option<u32>) -> c_int {
            0
        }

        fn zeroed(flags: c_int) -> c_int {
            flags | ZERO_FLAG
        }

        unsafe fn alloc(size: usize, flags: c_int) -> *mut u8 {
            let Some(layout) = layout_for(size) else {
                return null_mut();
            };
            // Safety: layout has nonzero size.
            let raw = unsafe { std::alloc::alloc(layout) };
            if raw.is_null() {
                return null_mut();
            }
            // Safety: the header fits in front of the payload.
            unsafe {
                raw.cast::<usize>().write(size);
                let ptr = raw.add(HEADER);
                if flags & ZERO_FLAG != 0 {
                    ptr.write_bytes(0, size);
                }
                ptr
            }
        }

        unsafe fn realloc(ptr: *mut u8, size: usize, flags: c_int) -> *mut u8 {
            // Safety: ptr carries a header written by alloc.
            let old_size = unsafe { ptr.sub(HEADER).cast::<usize>().read() };
            let new_ptr = unsafe { Self::alloc(size, flags & !ZERO_FLAG) };
            if !new_ptr.is_null() {
                // Safety: both regions are live and at least min(old, new)
                // bytes long.
                unsafe {
                    std::ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(size));
                    Self::dealloc(ptr, flags);
                }
            }
            new_ptr
        }

        unsafe fn dealloc(ptr: *mut u8, _flags: c_int) {
            // Safety: ptr carries a header written by alloc; the layout was
            // validated there.
            unsafe {
                let raw = ptr.sub(HEADER);
                let size = raw.cast::<usize>().read();
                std::alloc::dealloc(raw, Layout::from_size_align_unchecked(size + HEADER, ALIGN));
            }
        }

        unsafe fn sized_dealloc(ptr: *mut u8, _size: usize, flags: c_int) {
            // Safety: forwarded to dealloc, same contract.
            unsafe { Self::dealloc(ptr, flags) }
        }

        fn usable_size_for(size: usize, _flags: c_int) -> usize {
            size
        }

        unsafe fn allocation_size(ptr: *mut u8, _flags: c_int) -> usize {
            // Safety: ptr carries a header written by alloc.
            unsafe { ptr.sub(HEADER).cast::<usize>().read() }
        }

        unsafe fn usable_size(ptr: *mut u8) -> usize {
            // Safety: same contract as allocation_size.
            unsafe { Self::allocation_size(ptr, 0) }
        }

        fn arena_allocated(_arena: u32) -> Result<u64, ArenaError> {
            Ok(0)
        }
    }
}
