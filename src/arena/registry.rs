//! Fixed-capacity client slot table.
//!
//! Registration and unregistration are the only operations in the crate that
//! take a lock; allocation, switching and readout never consult the table.

use super::backend::{AllocBackend, PlatformBackend};
use super::client::{ClientHandle, MAX_CLIENTS};
use super::error::ArenaError;
use super::routing;
use super::tally;
use crate::counter::{NonNegativeCounter, Saturate};
use crate::sync::{Arc, RwLock};

struct ClientSlot {
    used: bool,
    /// Retained across register/unregister cycles: the back-end cannot
    /// destroy arenas, so a slot keeps its arena forever and re-registering
    /// the slot reuses it.  Never returns to 0 once assigned.
    arena: u32,
    /// Externally owned mirror of the arena's live bytes, refreshed by
    /// `update_total_counters`.
    total: Option<Arc<NonNegativeCounter<Saturate>>>,
}

const FREE_SLOT: ClientSlot = ClientSlot {
    used: false,
    arena: 0,
    total: None,
};

struct ClientSlots {
    slots: [ClientSlot; MAX_CLIENTS],
}

crate::sync::static_rwlock! {
    static CLIENTS: RwLock<ClientSlots> = RwLock::new(ClientSlots {
        slots: [FREE_SLOT; MAX_CLIENTS],
    });
}

pub(crate) fn register_client(thread_cache: bool) -> Result<ClientHandle, ArenaError> {
    let mut table = CLIENTS
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner);

    for (index, slot) in table.slots.iter_mut().enumerate() {
        if slot.used {
            continue;
        }
        if slot.arena == 0 {
            slot.arena = PlatformBackend::create_arena()?;
        }
        slot.used = true;

        let index = index as u8;
        // Zero the slot's counters while holding the writer lock, so the new
        // client never observes its predecessor's drift.  This also builds
        // the global tally on first use, outside every allocation path.
        if PlatformBackend::CAN_TRACK {
            tally::global().client_registered(index);
        }

        log::debug!("registered client {index} on arena {}", slot.arena);
        return Ok(ClientHandle::new(
            index,
            slot.arena,
            thread_cache && routing::tcache_enabled(),
        ));
    }

    Err(ArenaError::NoFreeClientSlots)
}

pub(crate) fn unregister_client(client: ClientHandle) -> Result<(), ArenaError> {
    let mut table = CLIENTS
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner);

    let slot = table
        .slots
        .get_mut(client.index as usize)
        .ok_or(ArenaError::ClientNotRegistered {
            index: client.index,
        })?;
    if !slot.used || slot.arena != client.arena {
        return Err(ArenaError::ClientNotRegistered {
            index: client.index,
        });
    }
    slot.used = false;
    slot.total = None;

    log::debug!("unregistered client {} (arena {} retained)", client.index, slot.arena);
    Ok(())
}

/// Attach an externally owned counter mirroring the client's arena usage.
/// Dropped again when the client unregisters.
pub(crate) fn register_total_counter(
    client: &ClientHandle,
    counter: Arc<NonNegativeCounter<Saturate>>,
) -> Result<(), ArenaError> {
    let mut table = CLIENTS
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner);

    let slot = table
        .slots
        .get_mut(client.index as usize)
        .ok_or(ArenaError::ClientNotRegistered {
            index: client.index,
        })?;
    if !slot.used || slot.arena != client.arena {
        return Err(ArenaError::ClientNotRegistered {
            index: client.index,
        });
    }
    slot.total = Some(counter);
    Ok(())
}

/// Refresh every registered total counter from the back-end's per-arena
/// statistics.
pub(crate) fn update_total_counters() -> Result<(), ArenaError> {
    let table = CLIENTS
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner);

    for slot in table.slots.iter() {
        if slot.used && slot.arena != 0 {
            if let Some(total) = &slot.total {
                total.store(PlatformBackend::arena_allocated(slot.arena)?);
            }
        }
    }
    Ok(())
}

/// Unregister whichever client the calling thread is bound to.
pub(crate) fn unregister_current_client() -> Result<(), ArenaError> {
    let index = routing::current_index();
    if index as usize >= MAX_CLIENTS {
        return Err(ArenaError::UnboundThread);
    }

    let mut table = CLIENTS
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner);

    let slot = &mut table.slots[index as usize];
    if !slot.used {
        return Err(ArenaError::ClientNotRegistered { index });
    }
    slot.used = false;
    slot.total = None;

    log::debug!("unregistered current client {index}");
    Ok(())
}
