//! # Tag Attachments
//!
//! Small typed items attached to a stream tag. The set of keys is closed:
//! every kind of attachment is a variant of [`Attachment`], so lifecycle
//! dispatch is resolved at compile time instead of switching over an open
//! integer key space.
//!
//! Blocks are append-only. Items are never removed individually; the whole
//! block is dropped together with its tag.

use heapless::Vec;
use serde::{Deserialize, Serialize};

use crate::eos::EosHandle;
use crate::{MetaError, MAX_TAG_ATTACHMENTS};

/// One attachment item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Attachment {
    /// End-of-stream callback handle; drives the cross-core EOS protocol
    EosCallback(EosHandle),
    /// Presentation deadline for the covered octets, in microseconds
    TimeToPlay(u32),
}

impl Attachment {
    /// The key this item is stored under.
    pub fn key(&self) -> AttachmentKey {
        match self {
            Attachment::EosCallback(_) => AttachmentKey::EosCallback,
            Attachment::TimeToPlay(_) => AttachmentKey::TimeToPlay,
        }
    }
}

/// Discriminant-only view of [`Attachment`], used for lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AttachmentKey {
    /// End-of-stream callback handle
    EosCallback,
    /// Presentation deadline
    TimeToPlay,
}

/// Append-only keyed store owned by one tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentBlock {
    items: Vec<Attachment, MAX_TAG_ATTACHMENTS>,
}

impl AttachmentBlock {
    /// An empty block.
    pub const fn new() -> Self {
        AttachmentBlock { items: Vec::new() }
    }

    /// Number of items in the block.
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Whether the block holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append one item.
    ///
    /// Failure is the recoverable out-of-memory condition: the tag simply
    /// proceeds without the attachment.
    pub fn add(&mut self, item: Attachment) -> Result<(), MetaError> {
        self.items.push(item).map_err(|_| {
            log::warn!("attachment block full ({} items)", MAX_TAG_ATTACHMENTS);
            MetaError::AttachmentsFull
        })
    }

    /// Find the first item stored under `key`.
    pub fn find(&self, key: AttachmentKey) -> Option<&Attachment> {
        self.items.iter().find(|item| item.key() == key)
    }

    /// Mutable variant of [`find`](Self::find).
    pub fn find_mut(&mut self, key: AttachmentKey) -> Option<&mut Attachment> {
        self.items.iter_mut().find(|item| item.key() == key)
    }

    /// Items in insertion order.
    pub fn iter(&self) -> core::slice::Iter<'_, Attachment> {
        self.items.iter()
    }

    /// Mutable iteration in insertion order.
    pub fn iter_mut(&mut self) -> core::slice::IterMut<'_, Attachment> {
        self.items.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eos::EosToken;
    use crate::CoreId;

    fn handle() -> EosHandle {
        EosHandle::new(EosToken::test_token(0, 0), CoreId::P0)
    }

    #[test]
    fn test_add_and_find() {
        let mut block = AttachmentBlock::new();
        block.add(Attachment::TimeToPlay(5_000)).unwrap();
        block.add(Attachment::EosCallback(handle())).unwrap();

        assert_eq!(block.item_count(), 2);
        assert!(matches!(
            block.find(AttachmentKey::TimeToPlay),
            Some(Attachment::TimeToPlay(5_000))
        ));
        assert!(block.find(AttachmentKey::EosCallback).is_some());
    }

    #[test]
    fn test_first_match_wins() {
        let mut block = AttachmentBlock::new();
        block.add(Attachment::TimeToPlay(1)).unwrap();
        block.add(Attachment::TimeToPlay(2)).unwrap();

        assert!(matches!(
            block.find(AttachmentKey::TimeToPlay),
            Some(Attachment::TimeToPlay(1))
        ));
    }

    #[test]
    fn test_full_block_is_recoverable() {
        let mut block = AttachmentBlock::new();
        for _ in 0..MAX_TAG_ATTACHMENTS {
            block.add(Attachment::TimeToPlay(0)).unwrap();
        }
        assert_eq!(
            block.add(Attachment::TimeToPlay(0)),
            Err(MetaError::AttachmentsFull)
        );
        assert_eq!(block.item_count(), MAX_TAG_ATTACHMENTS);
    }

    #[test]
    fn test_missing_key() {
        let mut block = AttachmentBlock::new();
        block.add(Attachment::TimeToPlay(9)).unwrap();
        assert!(block.find(AttachmentKey::EosCallback).is_none());
    }
}
