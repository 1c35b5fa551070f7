use std::fmt;

/// Errors surfaced by client registration and the back-end control plane.
///
/// The allocation functions themselves never construct these: a failed
/// back-end allocation surfaces as a null pointer, as with the C library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaError {
    /// Every client slot is occupied; a client must unregister first.
    NoFreeClientSlots,
    /// The back-end rejected the request for a new arena.
    ArenaCreationFailed(i32),
    /// The back-end rejected the request for a new thread cache.
    TcacheCreationFailed(i32),
    /// The back-end rejected the release of a thread cache.
    TcacheDestructionFailed(i32),
    /// The slot addressed by a handle is not in use.
    ClientNotRegistered { index: u8 },
    /// `unregister_current_client` was called on a thread with no client
    /// bound.
    UnboundThread,
    /// A back-end statistics query failed.
    BackendStatsFailed { what: &'static str, rv: i32 },
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArenaError::NoFreeClientSlots => {
                write!(f, "no free client slots (max {})", super::client::MAX_CLIENTS)
            }
            ArenaError::ArenaCreationFailed(rv) => {
                write!(f, "back-end could not create arena: rv {rv}")
            }
            ArenaError::TcacheCreationFailed(rv) => {
                write!(f, "back-end could not create thread cache: rv {rv}")
            }
            ArenaError::TcacheDestructionFailed(rv) => {
                write!(f, "back-end could not destroy thread cache: rv {rv}")
            }
            ArenaError::ClientNotRegistered { index } => {
                write!(f, "client slot {index} is not registered")
            }
            ArenaError::UnboundThread => {
                write!(f, "current thread is not bound to a client")
            }
            ArenaError::BackendStatsFailed { what, rv } => {
                write!(f, "back-end statistics query '{what}' failed: rv {rv}")
            }
        }
    }
}

impl std::error::Error for ArenaError {}
