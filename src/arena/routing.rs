//! Thread-local routing state.
//!
//! Each thread carries the index of the client it is bound to, the composed
//! flag word handed to every back-end call, and the thread-cache id acquired
//! for each (thread, client) pair.  The state is a flat inline structure:
//! binding and routing never allocate, so the routing layer cannot re-enter
//! the allocator it serves.

use std::cell::RefCell;
use std::os::raw::c_int;

use super::backend::{AllocBackend, PlatformBackend};
use super::client::{ClientHandle, MAX_CLIENTS, NO_CLIENT_INDEX};
use super::error::ArenaError;
use crate::sync::atomic::{AtomicBool, Ordering};

crate::sync::static_atomic! {
    static TCACHE_ENABLED: AtomicBool = AtomicBool::new(true);
}

/// Global thread-cache override: when false, no client gets a back-end
/// thread cache regardless of its own preference.
pub(crate) fn tcache_enabled() -> bool {
    TCACHE_ENABLED.load(Ordering::Relaxed)
}

pub(crate) fn set_tcache_enabled(value: bool) {
    TCACHE_ENABLED.store(value, Ordering::Relaxed);
}

struct ThreadRouting {
    current_index: u8,
    alloc_flags: c_int,
    /// Thread-cache id per client index, biased by one because the
    /// back-end's ids start at 0; 0 = not yet acquired by this thread.
    tcaches: [u32; MAX_CLIENTS],
}

impl ThreadRouting {
    fn new() -> Self {
        Self {
            current_index: NO_CLIENT_INDEX,
            alloc_flags: PlatformBackend::default_flags(tcache_enabled()),
            tcaches: [0; MAX_CLIENTS],
        }
    }
}

impl Drop for ThreadRouting {
    fn drop(&mut self) {
        // Thread exit: hand every acquired thread cache back to the
        // back-end.  Destructors cannot propagate, so failures are logged.
        for id in self.tcaches {
            if id != 0 {
                if let Err(e) = PlatformBackend::destroy_tcache(id - 1) {
                    log::error!("leaking back-end thread cache {}: {e}", id - 1);
                }
            }
        }
    }
}

thread_local! {
    static ROUTING: RefCell<ThreadRouting> = RefCell::new(ThreadRouting::new());
}

/// Bind the calling thread to `client`.  Subsequent allocations are served
/// from the client's arena and charged to its tally.
pub(crate) fn switch_to_client(client: &ClientHandle) -> Result<(), ArenaError> {
    ROUTING.with(|routing| {
        let mut routing = routing.borrow_mut();

        if client.index == NO_CLIENT_INDEX || client.arena == 0 {
            // The handle can ask for caching off, but the global switch
            // overrides either way.
            routing.alloc_flags =
                PlatformBackend::default_flags(client.thread_cache && tcache_enabled());
            routing.current_index = NO_CLIENT_INDEX;
            return Ok(());
        }

        let tcache = if client.thread_cache && tcache_enabled() {
            let slot = &mut routing.tcaches[client.index as usize];
            if *slot == 0 {
                *slot = PlatformBackend::create_tcache()?.wrapping_add(1);
            }
            Some(*slot - 1)
        } else {
            None
        };

        routing.alloc_flags = PlatformBackend::client_flags(client.arena, tcache);
        routing.current_index = client.index;
        Ok(())
    })
}

/// Unbind the calling thread.  Allocations made afterwards go to the default
/// arena and are not tracked.
pub(crate) fn switch_from_client() {
    // Binding the sentinel handle acquires no thread cache, so it cannot
    // fail.
    let _ = switch_to_client(&ClientHandle::no_client());
}

pub(crate) fn current_index() -> u8 {
    ROUTING.with(|routing| routing.borrow().current_index)
}

/// The (client index, flag word) pair every allocation entry point reads.
pub(crate) fn current_binding() -> (u8, c_int) {
    ROUTING.with(|routing| {
        let routing = routing.borrow();
        (routing.current_index, routing.alloc_flags)
    })
}
