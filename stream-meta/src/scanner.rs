//! # Attachment Scanner
//!
//! Uniform iteration over a tag's attachment block, and the per-key
//! dispatch run on every tag lifecycle event. Copy, delete, export and
//! import paths all go through here, so they never need to know which
//! attachment keys exist; a new key only has to add its arms below.

use crate::attachment::{Attachment, AttachmentBlock};
use crate::context::EventContext;
use crate::eos;

/// Visitor verdict after each item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ScanControl {
    /// Keep visiting
    Continue,
    /// Terminate the scan early
    Stop,
}

/// Visit every item in insertion order until the visitor stops the scan.
pub fn scan<F>(block: &AttachmentBlock, mut visitor: F)
where
    F: FnMut(&Attachment) -> ScanControl,
{
    for item in block.iter() {
        if visitor(item) == ScanControl::Stop {
            break;
        }
    }
}

/// Mutable variant of [`scan`].
pub fn scan_mut<F>(block: &mut AttachmentBlock, mut visitor: F)
where
    F: FnMut(&mut Attachment) -> ScanControl,
{
    for item in block.iter_mut() {
        if visitor(item) == ScanControl::Stop {
            break;
        }
    }
}

/// Dispatch for a same-core duplication. `block` belongs to the new copy.
pub(crate) fn on_tag_copied(block: &AttachmentBlock, cx: &mut EventContext<'_>) {
    scan(block, |item| {
        match item {
            Attachment::EosCallback(handle) => eos::on_copied(handle, cx),
            Attachment::TimeToPlay(_) => {}
        }
        ScanControl::Continue
    });
}

/// Dispatch for a tag deletion. The tag is already out of its pool.
pub(crate) fn on_tag_deleted(block: &AttachmentBlock, cx: &mut EventContext<'_>) {
    scan(block, |item| {
        match item {
            Attachment::EosCallback(handle) => eos::on_deleted(handle, cx),
            Attachment::TimeToPlay(_) => {}
        }
        ScanControl::Continue
    });
}

/// Dispatch for the departing leg of a cross-core copy. `block` is the
/// wire block; handles may be rewritten before serialization.
pub(crate) fn on_tag_exported(block: &mut AttachmentBlock, cx: &mut EventContext<'_>) {
    scan_mut(block, |item| {
        match item {
            Attachment::EosCallback(handle) => eos::on_exported(handle, cx),
            Attachment::TimeToPlay(_) => {}
        }
        ScanControl::Continue
    });
}

/// Dispatch for the arriving leg of a cross-core copy.
pub(crate) fn on_tag_imported(block: &mut AttachmentBlock, cx: &mut EventContext<'_>) {
    scan_mut(block, |item| {
        match item {
            Attachment::EosCallback(handle) => eos::on_imported(handle, cx),
            Attachment::TimeToPlay(_) => {}
        }
        ScanControl::Continue
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visits_in_insertion_order() {
        let mut block = AttachmentBlock::new();
        block.add(Attachment::TimeToPlay(1)).unwrap();
        block.add(Attachment::TimeToPlay(2)).unwrap();
        block.add(Attachment::TimeToPlay(3)).unwrap();

        let mut seen = heapless::Vec::<u32, 4>::new();
        scan(&block, |item| {
            if let Attachment::TimeToPlay(value) = item {
                seen.push(*value).unwrap();
            }
            ScanControl::Continue
        });
        assert_eq!(seen.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_early_stop() {
        let mut block = AttachmentBlock::new();
        block.add(Attachment::TimeToPlay(1)).unwrap();
        block.add(Attachment::TimeToPlay(2)).unwrap();

        let mut visits = 0;
        scan(&block, |_| {
            visits += 1;
            ScanControl::Stop
        });
        assert_eq!(visits, 1);
    }

    #[test]
    fn test_scan_mut_rewrites() {
        let mut block = AttachmentBlock::new();
        block.add(Attachment::TimeToPlay(10)).unwrap();

        scan_mut(&mut block, |item| {
            if let Attachment::TimeToPlay(value) = item {
                *value += 5;
            }
            ScanControl::Continue
        });
        assert!(matches!(
            block.find(crate::attachment::AttachmentKey::TimeToPlay),
            Some(Attachment::TimeToPlay(15))
        ));
    }
}
