//! # Stream Metadata Library
//!
//! This crate provides the stream-tag metadata layer shared by both audio
//! cores of the SoC:
//!
//! - **Stream Tags**: markers carried alongside chunks of streaming data
//! - **Attachments**: typed items attached to a tag (EOS callback, timing)
//! - **EOS Protocol**: distributed reference counting that fires a
//!   registered end-of-stream callback exactly once, no matter how the tag
//!   is duplicated across buffer chains or cores
//! - **Inter-Core Link**: fire-and-forget adapter carrying deletion notices
//!   between cores when they do not share metadata memory
//!
//! ## Architecture
//!
//! ```text
//! Core P0 (origin)                          Core P1
//! ┌──────────────────────┐                  ┌──────────────────────┐
//! │ MetaCore             │                  │ MetaCore             │
//! │  TagPool             │   WireTag        │  TagPool             │
//! │  EosRegistry ────────┼──────────────────┼─► StandInTable       │
//! │  (local/remote)      │   DeletionNotice │  (per-event count)   │
//! │                  ◄───┼──────────────────┼──                    │
//! └──────────────────────┘   in-order link  └──────────────────────┘
//! ```
//!
//! ## Exactly-Once Strategy
//!
//! The callback record exists only on the core that registered it. Copies
//! on the peer core are counted by a local stand-in; the last one to drain
//! reports back exactly once, either as a deletion notice or folded into a
//! returning tag. The callback fires on the single transition where both
//! counts reach zero, observed on the originating core.

#![cfg_attr(not(feature = "std"), no_std)]

pub mod attachment;
pub mod context;
pub mod eos;
pub mod link;
pub mod queue;
pub mod scanner;
pub mod tag;
pub mod transit;

// Re-export main types for convenience
pub use attachment::{Attachment, AttachmentBlock, AttachmentKey};
pub use context::MetaCore;
pub use eos::{EosCallback, EosHandle, EosToken};
pub use link::{FrameTx, InterCoreTx, LinkError};
pub use queue::{append_fanout, strict_transport, Removed, TagQueue};
pub use scanner::{scan, scan_mut, ScanControl};
pub use tag::{StreamTag, TagFlags, TagId, TagPool};
pub use transit::{DeletionNotice, FrameCodec, LinkMessage, WireTag};

use serde::{Deserialize, Serialize};

/// Library version for inter-core compatibility checks
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Slots in the per-core tag pool
pub const MAX_LIVE_TAGS: usize = 32;

/// Free-slot headroom below which `TagPool::threshold_exceeded` reports
/// pressure, so producers can throttle before allocation starts failing
pub const TAG_ALLOC_HEADROOM: usize = 4;

/// Attachment items a single tag can carry
pub const MAX_TAG_ATTACHMENTS: usize = 4;

/// Concurrently live EOS events per core
pub const MAX_EOS_EVENTS: usize = 8;

/// Tags a single queue can hold between writer and reader
pub const MAX_QUEUE_TAGS: usize = 32;

/// Upper bound on one framed link message, including framing overhead
pub const MAX_FRAME_SIZE: usize = 128;

/// Identifies one of the two processing cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CoreId {
    /// Primary core, runs the streaming front end
    P0,
    /// Secondary core, offloaded processing stages
    P1,
}

impl CoreId {
    /// The other core.
    pub fn peer(self) -> Self {
        match self {
            CoreId::P0 => CoreId::P1,
            CoreId::P1 => CoreId::P0,
        }
    }
}

/// Errors surfaced by the metadata layer.
///
/// All of these are recoverable: a failed allocation means the tag simply
/// proceeds without the requested attachment or copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MetaError {
    /// The tag pool has no free slot
    TagPoolExhausted,
    /// The tag id does not refer to a live tag
    StaleTag,
    /// The tag's attachment block is full
    AttachmentsFull,
    /// No free slot for another EOS event on this core
    EventTableFull,
    /// The tag queue cannot hold another tag
    QueueFull,
}
