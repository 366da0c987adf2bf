//! # Tag Queues
//!
//! A [`TagQueue`] tracks the tags riding one circular audio buffer: write
//! and read positions in octets, and the FIFO of tags between them. The
//! queue never touches payload data; it only mirrors the octet indices of
//! the buffer it shadows.
//!
//! ```text
//! ┌───────────┬──────────────────────────┬───────────┐
//! │ consumed  │  tagged, readable data   │ writable  │
//! └───────────┴──────────────────────────┴───────────┘
//!             ▲                          ▲
//!          prev_rd                    prev_wr
//!      tag.index values fall inside the readable span
//! ```
//!
//! Appends assign each tag its octet index; removal pops every tag whose
//! index was consumed and hands them back to the caller, which transports
//! them downstream or deletes them through the protocol.

use heapless::{Deque, Vec};

use crate::context::MetaCore;
use crate::tag::{TagFlags, TagId};
use crate::{MetaError, MAX_QUEUE_TAGS};

/// Result of a [`TagQueue::remove`] call.
#[derive(Debug, Default)]
pub struct Removed {
    /// Tags whose covered octets were consumed, in stream order
    pub tags: Vec<TagId, MAX_QUEUE_TAGS>,
    /// Octets consumed before the first removed tag's index
    pub octets_before: u32,
    /// Octets consumed past the last removed tag's index
    pub octets_after: u32,
}

/// Tag bookkeeping for one circular buffer.
pub struct TagQueue {
    buffer_size: u32,
    prev_wr: u32,
    prev_rd: u32,
    tags: Deque<TagId, MAX_QUEUE_TAGS>,
}

impl TagQueue {
    /// A queue shadowing a buffer of `buffer_size` octets.
    pub fn new(buffer_size: u32) -> Self {
        debug_assert!(buffer_size > 0);
        TagQueue {
            buffer_size,
            prev_wr: 0,
            prev_rd: 0,
            tags: Deque::new(),
        }
    }

    /// Octets between read and write positions.
    pub fn available_octets(&self) -> u32 {
        if self.prev_wr >= self.prev_rd {
            self.prev_wr - self.prev_rd
        } else {
            self.prev_wr + self.buffer_size - self.prev_rd
        }
    }

    /// Octets that can still be written. One octet is reserved to keep a
    /// full buffer distinguishable from an empty one.
    pub fn available_space(&self) -> u32 {
        self.buffer_size - self.available_octets() - 1
    }

    /// Number of queued tags.
    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }

    fn distance_from(&self, from: u32, index: u32) -> u32 {
        (index + self.buffer_size - from) % self.buffer_size
    }

    /// Append tags covering a span of freshly written octets.
    ///
    /// `octets_pre` is the data written before the first tag's index,
    /// `octets_post` the data written from the last tag's index onward.
    /// An empty `tags` slice just advances the write position.
    pub fn append(
        &mut self,
        core: &mut MetaCore,
        tags: &[TagId],
        octets_pre: u32,
        octets_post: u32,
    ) -> Result<(), MetaError> {
        debug_assert!(octets_pre + octets_post <= self.buffer_size);

        if tags.is_empty() {
            self.prev_wr = (self.prev_wr + octets_pre + octets_post) % self.buffer_size;
            return Ok(());
        }

        if self.tags.len() + tags.len() > MAX_QUEUE_TAGS {
            log::warn!("tag queue full ({} slots)", MAX_QUEUE_TAGS);
            return Err(MetaError::QueueFull);
        }

        let mut index = (self.prev_wr + octets_pre) % self.buffer_size;
        for (nth, id) in tags.iter().enumerate() {
            let Some(tag) = core.tag_mut(*id) else {
                log::warn!("append skipped a stale tag");
                continue;
            };
            tag.index = index;
            let length = tag.length;
            let _ = self.tags.push_back(*id);
            if nth + 1 < tags.len() {
                index = (index + length) % self.buffer_size;
            }
        }
        self.prev_wr = (index + octets_post) % self.buffer_size;
        Ok(())
    }

    /// The tag at the head of the queue.
    pub fn peek(&self) -> Option<TagId> {
        self.tags.front().copied()
    }

    /// The head tag together with the octets still to be consumed before
    /// its index is reached.
    pub fn peek_ex(&self, core: &MetaCore) -> Option<(TagId, u32)> {
        let id = self.peek()?;
        let tag = core.tag(id)?;
        Some((id, self.distance_from(self.prev_rd, tag.index)))
    }

    /// Consume `octets` of data, popping every tag whose index falls in
    /// the consumed span. A zero-length tag sitting exactly at the new
    /// read position (a stream-end marker) is popped as well.
    pub fn remove(&mut self, core: &MetaCore, octets: u32) -> Removed {
        debug_assert!(octets <= self.buffer_size);

        let available = self.available_octets();
        if available < octets {
            // Keep going; the indices stay consistent even if the caller
            // overshot, and production recovers better than it faults.
            log::warn!("remove of {} octets with {} available", octets, available);
        }

        let rd = self.prev_rd;
        let mut removed = Removed {
            octets_before: octets,
            ..Removed::default()
        };
        let mut first = true;
        let mut last_distance = 0;

        while let Some(&id) = self.tags.front() {
            let Some(tag) = core.tag(id) else {
                log::warn!("remove dropped a stale tag");
                self.tags.pop_front();
                continue;
            };
            let distance = self.distance_from(rd, tag.index);
            if distance >= octets {
                break;
            }
            if first {
                removed.octets_before = distance;
                first = false;
            }
            last_distance = distance;
            self.tags.pop_front();
            let _ = removed.tags.push(id);
        }

        // Zero-length marker right at the consumption boundary
        if let Some(&id) = self.tags.front() {
            if let Some(tag) = core.tag(id) {
                if tag.length == 0 && self.distance_from(rd, tag.index) == octets {
                    last_distance = octets;
                    self.tags.pop_front();
                    let _ = removed.tags.push(id);
                }
            }
        }

        self.prev_rd = (rd + octets) % self.buffer_size;

        if !removed.tags.is_empty() {
            removed.octets_after = octets - last_distance;
        }
        removed
    }

    /// Length in octets of the next complete encoded packet, delimited by
    /// `PACKET_START` and `PACKET_END` flags, without removing anything.
    ///
    /// Returns `(frame_octets, octets_before_frame)`; `frame_octets` is
    /// zero when no complete packet is queued.
    pub fn peek_frame_octets(&self, core: &MetaCore) -> (u32, u32) {
        let Some((_, mut before)) = self.peek_ex(core) else {
            return (0, 0);
        };

        let mut frame = 0;
        let mut found_start = false;
        let mut found_end = false;

        for &id in self.tags.iter() {
            let Some(tag) = core.tag(id) else { continue };
            if tag.flags.contains(TagFlags::PACKET_START) {
                if !found_start {
                    found_start = true;
                } else {
                    // A new start before an end: the octets so far join
                    // the discard pile and counting restarts.
                    before += frame;
                    frame = 0;
                }
            }
            if found_start {
                frame += tag.length;
                if tag.flags.contains(TagFlags::PACKET_END) {
                    found_end = true;
                    break;
                }
            } else {
                before += tag.length;
            }
        }

        if !found_end {
            frame = 0;
        }
        (frame, before)
    }
}

/// Move `octets` worth of tags from `src` to `dst`.
///
/// Tags are transported, not duplicated, so no protocol accounting runs.
/// With no source queue an empty tag is created to keep the destination's
/// indices aligned; with no destination the removed tags are deleted
/// through the protocol.
pub fn strict_transport(
    core: &mut MetaCore,
    src: Option<&mut TagQueue>,
    dst: Option<&mut TagQueue>,
    octets: u32,
) -> Result<(), MetaError> {
    if octets == 0 {
        log::debug!("strict transport ignoring zero transfer");
        return Ok(());
    }

    let (tags, before, after) = match src {
        Some(queue) => {
            let removed = queue.remove(core, octets);
            (removed.tags, removed.octets_before, removed.octets_after)
        }
        None => {
            let mut tags = Vec::new();
            if dst.is_some() {
                // Cover the transferred span with one empty tag
                let id = core.new_tag(octets)?;
                let _ = tags.push(id);
            }
            (tags, 0, octets)
        }
    };

    match dst {
        Some(queue) => queue.append(core, &tags, before, after),
        None => {
            for id in tags {
                core.delete_tag(id)?;
            }
            Ok(())
        }
    }
}

/// Append one span of tags to several sinks at once.
///
/// The last sink receives the tags themselves; every other sink receives
/// protocol-accounted copies. A failed copy is logged and that sink simply
/// misses the tag.
pub fn append_fanout(
    core: &mut MetaCore,
    sinks: &mut [&mut TagQueue],
    tags: &[TagId],
    octets_pre: u32,
    octets_post: u32,
) -> Result<(), MetaError> {
    let Some((last, rest)) = sinks.split_last_mut() else {
        // No consumers: the tags drain straight through the protocol
        for id in tags {
            core.delete_tag(*id)?;
        }
        return Ok(());
    };

    for sink in rest.iter_mut() {
        let mut copies = Vec::<TagId, MAX_QUEUE_TAGS>::new();
        for id in tags {
            match core.copy_tag(*id) {
                Ok(copy) => {
                    let _ = copies.push(copy);
                }
                Err(err) => log::warn!("fan-out copy dropped: {:?}", err),
            }
        }
        sink.append(core, &copies, octets_pre, octets_post)?;
    }
    last.append(core, tags, octets_pre, octets_post)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CoreId;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn fixture() -> (MetaCore, TagQueue) {
        (MetaCore::new(CoreId::P0), TagQueue::new(256))
    }

    #[test]
    fn test_append_assigns_indices() {
        let (mut core, mut queue) = fixture();
        let a = core.new_tag(100).unwrap();
        let b = core.new_tag(50).unwrap();

        queue.append(&mut core, &[a, b], 0, 50).unwrap();

        assert_eq!(core.tag(a).unwrap().index, 0);
        assert_eq!(core.tag(b).unwrap().index, 100);
        assert_eq!(queue.available_octets(), 150);
        assert_eq!(queue.available_space(), 256 - 150 - 1);
    }

    #[test]
    fn test_append_wraps_indices() {
        let (mut core, mut queue) = fixture();

        // Push the write position near the end, consume the same span
        queue.append(&mut core, &[], 0, 200).unwrap();
        queue.remove(&core, 200);

        let a = core.new_tag(100).unwrap();
        queue.append(&mut core, &[a], 30, 100).unwrap();
        assert_eq!(core.tag(a).unwrap().index, (200 + 30) % 256);
        assert_eq!(queue.available_octets(), 130);
    }

    #[test]
    fn test_remove_pops_consumed_tags() {
        let (mut core, mut queue) = fixture();
        let a = core.new_tag(100).unwrap();
        let b = core.new_tag(50).unwrap();
        queue.append(&mut core, &[a, b], 0, 50).unwrap();

        let removed = queue.remove(&core, 120);
        assert_eq!(removed.tags.as_slice(), &[a, b]);
        assert_eq!(removed.octets_before, 0);
        assert_eq!(removed.octets_after, 20);
        assert_eq!(queue.tag_count(), 0);
        assert_eq!(queue.available_octets(), 30);
    }

    #[test]
    fn test_remove_leaves_unconsumed_tags() {
        let (mut core, mut queue) = fixture();
        let a = core.new_tag(100).unwrap();
        let b = core.new_tag(50).unwrap();
        queue.append(&mut core, &[a, b], 0, 50).unwrap();

        let removed = queue.remove(&core, 100);
        assert_eq!(removed.tags.as_slice(), &[a]);
        assert_eq!(removed.octets_after, 100);

        let (head, before) = queue.peek_ex(&core).unwrap();
        assert_eq!(head, b);
        assert_eq!(before, 0);
    }

    #[test]
    fn test_remove_without_tags_reports_span() {
        let (mut core, mut queue) = fixture();
        queue.append(&mut core, &[], 0, 80).unwrap();

        let removed = queue.remove(&core, 40);
        assert!(removed.tags.is_empty());
        assert_eq!(removed.octets_before, 40);
        assert_eq!(removed.octets_after, 0);
    }

    #[test]
    fn test_zero_length_marker_at_boundary() {
        let (mut core, mut queue) = fixture();
        let data = core.new_tag(100).unwrap();
        let marker = core.new_tag(0).unwrap();
        core.tag_mut(marker).unwrap().flags.insert(TagFlags::STREAM_END);
        queue.append(&mut core, &[data, marker], 0, 0).unwrap();

        // Consuming exactly the data span must also drain the marker
        let removed = queue.remove(&core, 100);
        assert_eq!(removed.tags.as_slice(), &[data, marker]);
        assert_eq!(removed.octets_after, 0);
        assert_eq!(queue.tag_count(), 0);
    }

    #[test]
    fn test_peek_frame_octets() {
        let (mut core, mut queue) = fixture();
        let lead = core.new_tag(10).unwrap();
        let start = core.new_tag(40).unwrap();
        let end = core.new_tag(60).unwrap();
        core.tag_mut(start).unwrap().flags.insert(TagFlags::PACKET_START);
        core.tag_mut(end).unwrap().flags.insert(TagFlags::PACKET_END);
        queue.append(&mut core, &[lead, start, end], 0, 60).unwrap();

        let (frame, before) = queue.peek_frame_octets(&core);
        assert_eq!(frame, 100);
        assert_eq!(before, 10);
    }

    #[test]
    fn test_peek_frame_octets_incomplete() {
        let (mut core, mut queue) = fixture();
        let start = core.new_tag(40).unwrap();
        core.tag_mut(start).unwrap().flags.insert(TagFlags::PACKET_START);
        queue.append(&mut core, &[start], 0, 40).unwrap();

        let (frame, _) = queue.peek_frame_octets(&core);
        assert_eq!(frame, 0);
    }

    #[test]
    fn test_strict_transport_moves_tags_downstream() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn on_eos(_context: usize) {
            CALLS.fetch_add(1, Ordering::Relaxed);
        }

        let mut core = MetaCore::new(CoreId::P0);
        let mut upstream = TagQueue::new(256);
        let mut downstream = TagQueue::new(256);

        let id = core.new_tag(64).unwrap();
        core.register_eos_callback(id, on_eos, 0).unwrap();
        upstream.append(&mut core, &[id], 0, 64).unwrap();

        strict_transport(&mut core, Some(&mut upstream), Some(&mut downstream), 64).unwrap();

        // Transport moves the tag; the event still has exactly one copy
        assert_eq!(downstream.tag_count(), 1);
        assert_eq!(core.live_eos_events(), 1);
        assert_eq!(CALLS.load(Ordering::Relaxed), 0);

        // Consuming at the end of the chain fires the callback
        strict_transport(&mut core, Some(&mut downstream), None, 64).unwrap();
        assert_eq!(CALLS.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_strict_transport_without_source_keeps_alignment() {
        let (mut core, mut queue) = fixture();
        strict_transport(&mut core, None, Some(&mut queue), 48).unwrap();
        assert_eq!(queue.available_octets(), 48);
        assert_eq!(queue.tag_count(), 1);
    }

    #[test]
    fn test_fanout_copies_for_every_extra_sink() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn on_eos(_context: usize) {
            CALLS.fetch_add(1, Ordering::Relaxed);
        }

        let mut core = MetaCore::new(CoreId::P0);
        let mut left = TagQueue::new(256);
        let mut right = TagQueue::new(256);

        let id = core.new_tag(32).unwrap();
        core.register_eos_callback(id, on_eos, 0).unwrap();

        append_fanout(&mut core, &mut [&mut left, &mut right], &[id], 0, 32).unwrap();
        assert_eq!(left.tag_count(), 1);
        assert_eq!(right.tag_count(), 1);

        // Both branches must drain before the callback fires
        let first = left.remove(&core, 32).tags;
        for tag in first {
            core.delete_tag(tag).unwrap();
        }
        assert_eq!(CALLS.load(Ordering::Relaxed), 0);

        let second = right.remove(&core, 32).tags;
        for tag in second {
            core.delete_tag(tag).unwrap();
        }
        assert_eq!(CALLS.load(Ordering::Relaxed), 1);
    }
}
