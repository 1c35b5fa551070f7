//! Multi-tenant memory accounting on top of a per-arena allocator.
//!
//! Each registered client (tenant) owns a jemalloc arena. Threads bind
//! themselves to a client with [`ArenaMalloc::switch_to_client`]; every
//! allocation made while bound is served from the client's arena and its
//! usable size is charged to a sharded per-client tally that can be read
//! back cheaply ([`ArenaMalloc::estimated_allocated`]) or exactly
//! ([`ArenaMalloc::precise_allocated`]).

#[cfg(not(target_pointer_width = "64"))]
compile_error!("tenalloc supports only 64-bit targets.");

pub(crate) mod sync;

pub mod counter;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod arena;

// accounting façade
pub use arena::client::{ClientHandle, MAX_CLIENTS, NO_CLIENT_INDEX};
pub use arena::facade::{ArenaMalloc, ClientGuard};

// errors
pub use arena::error::ArenaError;

// counters
pub use counter::{CounterError, NonNegativeCounter, OverflowPolicy, Raise, Saturate};
