//! # Per-Core Protocol Context
//!
//! [`MetaCore`] is the façade one core's processing loop drives: tag
//! creation, duplication, deletion, cross-core transfer and notice
//! handling. Each core runs a single-threaded cooperative loop, so no
//! locking is needed anywhere in here.
//!
//! Cross-core effects are produced as values rather than sent in place:
//! departing tags become [`WireTag`]s and lineage closures become
//! [`DeletionNotice`]s in the outbox. The platform glue ships both over
//! the inter-core link (separate metadata memory) or applies them by
//! direct call (shared metadata memory). The accounting is identical in
//! both configurations.

use heapless::Deque;

use crate::attachment::Attachment;
use crate::eos::{self, EosCallback, EosHandle, EosRegistry, StandInTable};
use crate::scanner;
use crate::tag::{StreamTag, TagFlags, TagId, TagPool};
use crate::transit::{DeletionNotice, WireTag};
use crate::{CoreId, MetaError, MAX_EOS_EVENTS};

/// Split borrow of one core's protocol state, handed to the scanner
/// dispatchers so they can mutate counters while the caller still holds
/// the tag pool.
pub(crate) struct EventContext<'a> {
    pub(crate) core: CoreId,
    pub(crate) eos: &'a mut EosRegistry,
    pub(crate) standins: &'a mut StandInTable,
    pub(crate) outbox: &'a mut Deque<DeletionNotice, MAX_EOS_EVENTS>,
}

/// The stream-metadata state of one core.
pub struct MetaCore {
    core: CoreId,
    tags: TagPool,
    eos: EosRegistry,
    standins: StandInTable,
    outbox: Deque<DeletionNotice, MAX_EOS_EVENTS>,
}

impl MetaCore {
    /// Fresh state for `core`.
    pub fn new(core: CoreId) -> Self {
        MetaCore {
            core,
            tags: TagPool::new(),
            eos: EosRegistry::new(),
            standins: StandInTable::new(),
            outbox: Deque::new(),
        }
    }

    /// Which core this state belongs to.
    pub fn core_id(&self) -> CoreId {
        self.core
    }

    /// The tag pool, for inspection.
    pub fn tags(&self) -> &TagPool {
        &self.tags
    }

    /// EOS events originated here that have not finalized yet.
    pub fn live_eos_events(&self) -> usize {
        self.eos.live_events()
    }

    /// Remote-origin EOS events with copies currently held here.
    pub fn live_standins(&self) -> usize {
        self.standins.live_events()
    }

    fn split(&mut self) -> (&mut TagPool, EventContext<'_>) {
        (
            &mut self.tags,
            EventContext {
                core: self.core,
                eos: &mut self.eos,
                standins: &mut self.standins,
                outbox: &mut self.outbox,
            },
        )
    }

    /// Create a tag covering `length` octets.
    pub fn new_tag(&mut self, length: u32) -> Result<TagId, MetaError> {
        self.tags.insert(StreamTag::with_length(length))
    }

    /// Store a fully built tag.
    pub fn add_tag(&mut self, tag: StreamTag) -> Result<TagId, MetaError> {
        self.tags.insert(tag)
    }

    /// Borrow a live tag.
    pub fn tag(&self, id: TagId) -> Option<&StreamTag> {
        self.tags.get(id)
    }

    pub(crate) fn tag_mut(&mut self, id: TagId) -> Option<&mut StreamTag> {
        self.tags.get_mut(id)
    }

    /// Mark `id` as an end-of-stream tag and register `run` to be invoked
    /// with `context` exactly once, after every copy of the tag, on either
    /// core, has drained.
    ///
    /// If the handle cannot be attached the registry entry is rolled back
    /// and the marker simply never fires; the stream still drains normally.
    pub fn register_eos_callback(
        &mut self,
        id: TagId,
        run: fn(usize),
        context: usize,
    ) -> Result<(), MetaError> {
        if self.tags.get(id).is_none() {
            return Err(MetaError::StaleTag);
        }
        let token = self.eos.register(EosCallback { run, context })?;
        let origin = self.core;
        let Some(tag) = self.tags.get_mut(id) else {
            self.eos.discard(token);
            return Err(MetaError::StaleTag);
        };
        tag.flags.insert(TagFlags::STREAM_END);
        if tag
            .attachments
            .add(Attachment::EosCallback(EosHandle::new(token, origin)))
            .is_err()
        {
            self.eos.discard(token);
            return Err(MetaError::AttachmentsFull);
        }
        Ok(())
    }

    /// Duplicate a tag on this core.
    pub fn copy_tag(&mut self, id: TagId) -> Result<TagId, MetaError> {
        let (tags, mut cx) = self.split();
        let Some(src) = tags.get(id) else {
            return Err(MetaError::StaleTag);
        };
        let dup = src.clone();
        let new_id = tags.insert(dup)?;
        if let Some(copy) = tags.get(new_id) {
            scanner::on_tag_copied(&copy.attachments, &mut cx);
        }
        Ok(new_id)
    }

    /// Delete a tag whose data has been fully consumed. May finalize an
    /// EOS event or enqueue a deletion notice for the peer core.
    pub fn delete_tag(&mut self, id: TagId) -> Result<(), MetaError> {
        let (tags, mut cx) = self.split();
        let tag = tags.take(id).ok_or(MetaError::StaleTag)?;
        scanner::on_tag_deleted(&tag.attachments, &mut cx);
        Ok(())
    }

    /// Withdraw a tag for transfer to the peer core. The local copy is
    /// consumed by the transfer itself, so no deletion accounting runs.
    pub fn export_tag(&mut self, id: TagId) -> Result<WireTag, MetaError> {
        let (tags, mut cx) = self.split();
        let mut tag = tags.take(id).ok_or(MetaError::StaleTag)?;
        scanner::on_tag_exported(&mut tag.attachments, &mut cx);
        Ok(WireTag {
            length: tag.length,
            flags: tag.flags,
            attachments: tag.attachments,
        })
    }

    /// Accept a tag arriving from the peer core.
    ///
    /// If the pool is full the tag is dropped before any accounting runs;
    /// the event then drains through its remaining copies.
    pub fn import_tag(&mut self, wire: WireTag) -> Result<TagId, MetaError> {
        let (tags, mut cx) = self.split();
        let tag = StreamTag {
            index: 0,
            length: wire.length,
            flags: wire.flags,
            attachments: wire.attachments,
        };
        let id = tags.insert(tag).map_err(|err| {
            log::warn!("arriving tag dropped on {:?}, pool full", cx.core);
            err
        })?;
        if let Some(tag) = tags.get_mut(id) {
            scanner::on_tag_imported(&mut tag.attachments, &mut cx);
        }
        Ok(id)
    }

    /// Apply a deletion notice from the peer core. Only meaningful on the
    /// originating core of the event the notice refers to.
    pub fn apply_retirement(&mut self, notice: DeletionNotice) {
        debug_assert_eq!(notice.origin, self.core);
        match self.eos.get_mut(notice.token) {
            Some(entry) => {
                debug_assert!(entry.remote > 0);
                entry.remote = entry.remote.saturating_sub(1);
            }
            None => {
                debug_assert!(false, "notice for a finalized EOS event");
                log::warn!("deletion notice for unknown token on {:?}", self.core);
                return;
            }
        }
        eos::maybe_finalize(&mut self.eos, notice.token);
    }

    /// Next outgoing deletion notice, in the order they were produced.
    pub fn take_notice(&mut self) -> Option<DeletionNotice> {
        self.outbox.pop_front()
    }
}
