//! # End-of-Stream Callback Protocol
//!
//! One logical end-of-stream event is observed by every consumer of the
//! tagged data, on either core, yet its completion callback must run
//! exactly once. The bookkeeping:
//!
//! - [`EosRegistry`] lives on the **originating core** only and holds one
//!   entry per event: a local count, a remote count and the callback.
//! - Every copy of the tag carries an [`EosHandle`] attachment. On the
//!   originating core the handle resolves against the registry; on the
//!   peer core it is a weak reference (token + origin) and the copy is
//!   counted by that core's [`StandInTable`] instead.
//! - The last copy to drain on the peer core reports back exactly once:
//!   either a [`DeletionNotice`](crate::transit::DeletionNotice) over the
//!   link, or, when the last copy travels home instead of dying remotely,
//!   the `last_remote_copy` flag folded into the returning tag.
//!
//! The callback fires on the single transition where both counts reach
//! zero, observed on the originating core.
//!
//! ## Counter flow
//!
//! ```text
//! register            local=1 remote=0
//! copy   (origin)     local+1
//! copy   (peer)       stand-in+1
//! export (origin)     local-1 remote+1
//! export (peer)       stand-in-1, flag last_remote_copy at zero
//! import (home)       local+1, remote-1 if flagged
//! import (peer)       stand-in+1 (created on first arrival)
//! delete (origin)     local-1, finalize at 0/0
//! delete (peer)       stand-in-1, one notice at zero unless flagged
//! notice (origin)     remote-1, finalize at 0/0
//! ```

use heapless::Vec;
use serde::{Deserialize, Serialize};

use crate::context::EventContext;
use crate::transit::DeletionNotice;
use crate::{CoreId, MetaError, MAX_EOS_EVENTS};

/// Opaque, serializable reference to one registry entry.
///
/// Never dereferenced directly; always resolved through the registry of
/// the originating core, which checks the generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EosToken {
    slot: u16,
    generation: u16,
}

impl EosToken {
    #[cfg(test)]
    pub(crate) fn test_token(slot: u16, generation: u16) -> Self {
        EosToken { slot, generation }
    }
}

/// The caller-supplied completion callback.
///
/// A plain function pointer plus opaque context, invoked at most once.
#[derive(Debug, Clone, Copy)]
pub struct EosCallback {
    /// Function to invoke when the stream has fully drained
    pub run: fn(usize),
    /// Opaque value passed back to `run`
    pub context: usize,
}

/// Registry entry for one EOS event. Exists only on the originating core,
/// from registration until finalization.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EosEntry {
    /// Live copies whose handle resolves here
    pub(crate) local: u16,
    /// Live copies known to exist on the peer core
    pub(crate) remote: u16,
    pub(crate) callback: EosCallback,
}

/// Per-copy attachment item linking a tag to its EOS event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EosHandle {
    /// Registry reference, meaningful on `origin` only
    pub token: EosToken,
    /// Core the event was registered on
    pub origin: CoreId,
    /// Set on the wire handle of the copy that closed the peer core's
    /// bookkeeping by leaving; its arrival stands in for a deletion notice
    pub last_remote_copy: bool,
}

impl EosHandle {
    /// Handle for a freshly registered event.
    pub fn new(token: EosToken, origin: CoreId) -> Self {
        EosHandle {
            token,
            origin,
            last_remote_copy: false,
        }
    }
}

/// Fixed-slot table of the EOS events originated on this core.
pub struct EosRegistry {
    slots: [Option<EosEntry>; MAX_EOS_EVENTS],
    generations: [u16; MAX_EOS_EVENTS],
}

impl EosRegistry {
    pub(crate) const fn new() -> Self {
        const FREE: Option<EosEntry> = None;
        EosRegistry {
            slots: [FREE; MAX_EOS_EVENTS],
            generations: [0; MAX_EOS_EVENTS],
        }
    }

    /// Create an entry with `local = 1, remote = 0`.
    pub(crate) fn register(&mut self, callback: EosCallback) -> Result<EosToken, MetaError> {
        for (slot, entry) in self.slots.iter_mut().enumerate() {
            if entry.is_none() {
                *entry = Some(EosEntry {
                    local: 1,
                    remote: 0,
                    callback,
                });
                return Ok(EosToken {
                    slot: slot as u16,
                    generation: self.generations[slot],
                });
            }
        }
        log::warn!("EOS event table full ({} slots)", MAX_EOS_EVENTS);
        Err(MetaError::EventTableFull)
    }

    pub(crate) fn get(&self, token: EosToken) -> Option<&EosEntry> {
        let slot = token.slot as usize;
        if slot >= MAX_EOS_EVENTS || self.generations[slot] != token.generation {
            return None;
        }
        self.slots[slot].as_ref()
    }

    pub(crate) fn get_mut(&mut self, token: EosToken) -> Option<&mut EosEntry> {
        let slot = token.slot as usize;
        if slot >= MAX_EOS_EVENTS || self.generations[slot] != token.generation {
            return None;
        }
        self.slots[slot].as_mut()
    }

    /// Remove an entry, invalidating its token.
    pub(crate) fn take(&mut self, token: EosToken) -> Option<EosEntry> {
        let slot = token.slot as usize;
        if slot >= MAX_EOS_EVENTS || self.generations[slot] != token.generation {
            return None;
        }
        let entry = self.slots[slot].take();
        if entry.is_some() {
            self.generations[slot] = self.generations[slot].wrapping_add(1);
        }
        entry
    }

    /// Drop an entry without running its callback. Rollback path for a
    /// registration whose attachment could not be stored.
    pub(crate) fn discard(&mut self, token: EosToken) {
        self.take(token);
    }

    /// Number of live entries.
    pub fn live_events(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

/// Stand-in counter for one remote-origin event: the copies of it held on
/// this core.
#[derive(Debug, Clone, Copy)]
struct StandIn {
    origin: CoreId,
    token: EosToken,
    count: u16,
}

/// Per-core bookkeeping for events originated on the peer core.
pub struct StandInTable {
    entries: Vec<StandIn, MAX_EOS_EVENTS>,
}

impl StandInTable {
    pub(crate) const fn new() -> Self {
        StandInTable {
            entries: Vec::new(),
        }
    }

    fn position(&self, origin: CoreId, token: EosToken) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.origin == origin && entry.token == token)
    }

    /// Count one more local copy, creating the entry on first arrival.
    pub(crate) fn bump(&mut self, origin: CoreId, token: EosToken) -> Result<(), MetaError> {
        if let Some(pos) = self.position(origin, token) {
            self.entries[pos].count += 1;
            return Ok(());
        }
        self.entries
            .push(StandIn {
                origin,
                token,
                count: 1,
            })
            .map_err(|_| {
                log::warn!("stand-in table full ({} entries)", MAX_EOS_EVENTS);
                MetaError::EventTableFull
            })
    }

    /// Count one local copy gone. Returns `Some(true)` when that was the
    /// last one and the entry has been retired, `Some(false)` while copies
    /// remain, `None` if the event is unknown here.
    pub(crate) fn close_one(&mut self, origin: CoreId, token: EosToken) -> Option<bool> {
        let pos = self.position(origin, token)?;
        let entry = &mut self.entries[pos];
        debug_assert!(entry.count > 0);
        entry.count = entry.count.saturating_sub(1);
        if entry.count == 0 {
            self.entries.swap_remove(pos);
            Some(true)
        } else {
            Some(false)
        }
    }

    /// Number of tracked remote-origin events.
    pub fn live_events(&self) -> usize {
        self.entries.len()
    }
}

/// Run the callback and free the entry if both counts have drained.
///
/// The entry is removed before the callback runs, so a reentrant call can
/// never observe (or finalize) the event a second time.
pub(crate) fn maybe_finalize(registry: &mut EosRegistry, token: EosToken) {
    let drained = match registry.get(token) {
        Some(entry) => entry.local == 0 && entry.remote == 0,
        None => false,
    };
    if drained {
        if let Some(entry) = registry.take(token) {
            (entry.callback.run)(entry.callback.context);
        }
    }
}

/// Same-core duplication of a tag carrying `handle`.
pub(crate) fn on_copied(handle: &EosHandle, cx: &mut EventContext<'_>) {
    if handle.origin == cx.core {
        match cx.eos.get_mut(handle.token) {
            Some(entry) => entry.local += 1,
            None => {
                debug_assert!(false, "copy of a finalized EOS event");
                log::warn!("EOS copy for unknown token on {:?}", cx.core);
            }
        }
    } else if cx.standins.bump(handle.origin, handle.token).is_err() {
        log::warn!("EOS copy untracked on {:?}, stand-ins full", cx.core);
    }
}

/// Deletion of a tag carrying `handle`, on the core that owned the copy.
pub(crate) fn on_deleted(handle: &EosHandle, cx: &mut EventContext<'_>) {
    if handle.origin == cx.core {
        match cx.eos.get_mut(handle.token) {
            Some(entry) => {
                debug_assert!(entry.local > 0);
                entry.local = entry.local.saturating_sub(1);
            }
            None => {
                debug_assert!(false, "delete of a finalized EOS event");
                log::warn!("EOS delete for unknown token on {:?}", cx.core);
                return;
            }
        }
        maybe_finalize(cx.eos, handle.token);
    } else {
        match cx.standins.close_one(handle.origin, handle.token) {
            Some(true) => {
                // Last local copy. Report closure exactly once, unless a
                // prior export already folded it into a departing tag.
                if !handle.last_remote_copy {
                    let notice = DeletionNotice {
                        origin: handle.origin,
                        token: handle.token,
                    };
                    if cx.outbox.push_back(notice).is_err() {
                        debug_assert!(false, "notice outbox overflow");
                        log::error!("EOS deletion notice dropped on {:?}", cx.core);
                    }
                }
            }
            Some(false) => {}
            None => {
                debug_assert!(false, "delete without a stand-in entry");
                log::warn!("EOS delete for untracked event on {:?}", cx.core);
            }
        }
    }
}

/// The departing leg of a cross-core copy. Runs on the wire handle, after
/// the local tag has been withdrawn from its pool.
pub(crate) fn on_exported(handle: &mut EosHandle, cx: &mut EventContext<'_>) {
    if handle.origin == cx.core {
        match cx.eos.get_mut(handle.token) {
            Some(entry) => {
                debug_assert!(entry.local > 0);
                entry.local = entry.local.saturating_sub(1);
                entry.remote += 1;
            }
            None => {
                debug_assert!(false, "export of a finalized EOS event");
                log::warn!("EOS export for unknown token on {:?}", cx.core);
            }
        }
        // The counters cannot both be zero here: remote was just raised.
        handle.last_remote_copy = false;
    } else {
        match cx.standins.close_one(handle.origin, handle.token) {
            Some(reached_zero) => handle.last_remote_copy = reached_zero,
            None => {
                debug_assert!(false, "export without a stand-in entry");
                log::warn!("EOS export for untracked event on {:?}", cx.core);
                handle.last_remote_copy = false;
            }
        }
    }
}

/// The arriving leg of a cross-core copy, before the tag enters the pool.
pub(crate) fn on_imported(handle: &mut EosHandle, cx: &mut EventContext<'_>) {
    if handle.origin == cx.core {
        // Returning home: the weak reference becomes live again.
        match cx.eos.get_mut(handle.token) {
            Some(entry) => {
                entry.local += 1;
                if handle.last_remote_copy {
                    // The outstanding remote presence came home rather
                    // than being deleted away.
                    debug_assert!(entry.remote > 0);
                    entry.remote = entry.remote.saturating_sub(1);
                }
            }
            None => {
                debug_assert!(false, "return of a finalized EOS event");
                log::warn!("EOS return for unknown token on {:?}", cx.core);
            }
        }
        handle.last_remote_copy = false;
    } else if cx.standins.bump(handle.origin, handle.token).is_err() {
        log::warn!("EOS arrival untracked on {:?}, stand-ins full", cx.core);
    }
}
