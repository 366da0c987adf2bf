//! # Stream Tags and the Tag Pool
//!
//! A stream tag marks a region of octets flowing through a buffer chain.
//! Tags are created when data is produced, duplicated when the data fans
//! out, and deleted when the owning region has been fully consumed.
//!
//! Storage is a fixed-slot arena. Handles are slot indices paired with a
//! generation counter, so a handle held across a free/reuse cycle is
//! detected as stale instead of silently aliasing a new tag.

use serde::{Deserialize, Serialize};

use crate::attachment::AttachmentBlock;
use crate::{MetaError, MAX_LIVE_TAGS, TAG_ALLOC_HEADROOM};

/// Per-tag flag bits.
///
/// `STREAM_END` is set implicitly when an EOS callback is registered on the
/// tag. The packet bits delimit codec frames for
/// [`TagQueue::peek_frame_octets`](crate::queue::TagQueue::peek_frame_octets).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TagFlags(u16);

impl TagFlags {
    /// First tag of a logical stream
    pub const STREAM_START: TagFlags = TagFlags(1 << 0);
    /// Last tag of a logical stream
    pub const STREAM_END: TagFlags = TagFlags(1 << 1);
    /// Tag opens an encoded packet
    pub const PACKET_START: TagFlags = TagFlags(1 << 2);
    /// Tag closes an encoded packet
    pub const PACKET_END: TagFlags = TagFlags(1 << 3);

    /// No flags set.
    pub const fn empty() -> Self {
        TagFlags(0)
    }

    /// Whether every bit of `other` is set in `self`.
    pub const fn contains(self, other: TagFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`.
    pub fn insert(&mut self, other: TagFlags) {
        self.0 |= other.0;
    }
}

/// A marker carried alongside a chunk of streaming data.
#[derive(Debug, Clone, Default)]
pub struct StreamTag {
    /// Octet position within the owning queue (assigned on append)
    pub index: u32,
    /// Octets of data this tag covers
    pub length: u32,
    /// Flag bits
    pub flags: TagFlags,
    /// Keyed items attached to this tag
    pub attachments: AttachmentBlock,
}

impl StreamTag {
    /// A fresh tag covering `length` octets, with no attachments.
    pub fn with_length(length: u32) -> Self {
        StreamTag {
            length,
            ..StreamTag::default()
        }
    }

    /// Whether this tag marks the end of its stream.
    pub fn is_stream_end(&self) -> bool {
        self.flags.contains(TagFlags::STREAM_END)
    }
}

/// Generation-checked handle to a pooled tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TagId {
    slot: u16,
    generation: u16,
}

/// Fixed-slot arena for the tags live on one core.
///
/// Allocation failure is recoverable: the caller proceeds without the tag
/// (or without the copy) rather than faulting.
pub struct TagPool {
    slots: [Option<StreamTag>; MAX_LIVE_TAGS],
    generations: [u16; MAX_LIVE_TAGS],
    live: usize,
}

impl TagPool {
    /// An empty pool.
    pub const fn new() -> Self {
        const FREE: Option<StreamTag> = None;
        TagPool {
            slots: [FREE; MAX_LIVE_TAGS],
            generations: [0; MAX_LIVE_TAGS],
            live: 0,
        }
    }

    /// Number of live tags.
    pub fn live_tags(&self) -> usize {
        self.live
    }

    /// True once the pool is close enough to exhaustion that producers
    /// should throttle tag creation.
    pub fn threshold_exceeded(&self) -> bool {
        self.live > MAX_LIVE_TAGS - TAG_ALLOC_HEADROOM
    }

    /// Store a tag, returning its handle.
    pub fn insert(&mut self, tag: StreamTag) -> Result<TagId, MetaError> {
        for (slot, entry) in self.slots.iter_mut().enumerate() {
            if entry.is_none() {
                *entry = Some(tag);
                self.live += 1;
                return Ok(TagId {
                    slot: slot as u16,
                    generation: self.generations[slot],
                });
            }
        }
        log::warn!("tag pool exhausted ({} slots)", MAX_LIVE_TAGS);
        Err(MetaError::TagPoolExhausted)
    }

    /// Borrow a live tag.
    pub fn get(&self, id: TagId) -> Option<&StreamTag> {
        let slot = id.slot as usize;
        if slot >= MAX_LIVE_TAGS || self.generations[slot] != id.generation {
            return None;
        }
        self.slots[slot].as_ref()
    }

    /// Mutably borrow a live tag.
    pub fn get_mut(&mut self, id: TagId) -> Option<&mut StreamTag> {
        let slot = id.slot as usize;
        if slot >= MAX_LIVE_TAGS || self.generations[slot] != id.generation {
            return None;
        }
        self.slots[slot].as_mut()
    }

    /// Remove a tag from the pool, invalidating its handle.
    pub fn take(&mut self, id: TagId) -> Option<StreamTag> {
        let slot = id.slot as usize;
        if slot >= MAX_LIVE_TAGS || self.generations[slot] != id.generation {
            return None;
        }
        let tag = self.slots[slot].take();
        if tag.is_some() {
            self.generations[slot] = self.generations[slot].wrapping_add(1);
            self.live -= 1;
        }
        tag
    }
}

impl Default for TagPool {
    fn default() -> Self {
        Self::new()
    }
}
