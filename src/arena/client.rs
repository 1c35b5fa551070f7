/// The maximum number of concurrently registered clients.
pub const MAX_CLIENTS: usize = 100;

/// Index value meaning "no client selected".
pub const NO_CLIENT_INDEX: u8 = MAX_CLIENTS as u8 + 1;

/// Default per-shard magnitude at which a shard drains into the per-client
/// aggregate (see `tally`).
pub(crate) const DEFAULT_ESTIMATE_THRESHOLD: u32 = 100 * 1024;

/// The ticket a client keeps between `register_client` and
/// `unregister_client`.
///
/// The handle names a registry slot and the native arena assigned to it; it
/// does not own the slot.  It is `Copy` so worker threads can carry their own
/// copy for `switch_to_client`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientHandle {
    pub(crate) arena: u32,
    pub(crate) index: u8,
    pub(crate) thread_cache: bool,
}

// Kept small so a handle travels in registers; the sentinel handle is the
// only one with arena 0.
const _: () = assert!(std::mem::size_of::<ClientHandle>() <= 8);

impl ClientHandle {
    pub(crate) fn new(index: u8, arena: u32, thread_cache: bool) -> Self {
        Self {
            arena,
            index,
            thread_cache,
        }
    }

    /// The sentinel handle: default arena, nothing tracked.
    pub(crate) fn no_client() -> Self {
        Self {
            arena: 0,
            index: NO_CLIENT_INDEX,
            thread_cache: true,
        }
    }

    /// The registry slot this handle names.
    #[must_use]
    pub fn index(&self) -> u8 {
        self.index
    }

    /// The native arena serving this client's allocations.
    #[must_use]
    pub fn arena(&self) -> u32 {
        self.arena
    }

    /// Whether threads bound to this client may use a back-end thread cache.
    #[must_use]
    pub fn thread_cache(&self) -> bool {
        self.thread_cache
    }
}
