//! # Dual-Core Simulation Harness
//!
//! Joins two [`MetaCore`]s with the channel the protocol assumes: in-order,
//! lossless, fire-and-forget. Every message crosses through the real wire
//! codec, so framing and serialization are exercised together with the
//! reference counting.
//!
//! ```text
//! ┌──────────────┐   frames (Tag / Retired)   ┌──────────────┐
//! │ MetaCore P0  │ ─────────────────────────► │ MetaCore P1  │
//! │              │ ◄───────────────────────── │              │
//! └──────────────┘     VecDeque per direction └──────────────┘
//! ```
//!
//! Tests drive tag lifecycles on either side, then call [`DualChip::pump`]
//! to let the channel drain; nothing is delivered until then, which makes
//! the delivery-dependent orderings of the protocol easy to pin down.

use std::collections::VecDeque;
use std::sync::Once;

use log::warn;
use serde::Serialize;
use thiserror::Error;

use stream_meta::transit::FrameError;
use stream_meta::{
    CoreId, FrameCodec, LinkMessage, MetaCore, MetaError, TagId, MAX_FRAME_SIZE,
};

static INIT_LOGGER: Once = Once::new();

/// Initialize host logging (only once).
pub fn init_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Errors that can occur in the harness
#[derive(Error, Debug)]
pub enum SimError {
    #[error("metadata layer error: {0:?}")]
    Meta(MetaError),
    #[error("frame error: {0:?}")]
    Frame(FrameError),
}

impl From<MetaError> for SimError {
    fn from(err: MetaError) -> Self {
        SimError::Meta(err)
    }
}

impl From<FrameError> for SimError {
    fn from(err: FrameError) -> Self {
        SimError::Frame(err)
    }
}

/// Something the channel delivered during a [`DualChip::pump`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// A tag arrived and entered the receiving core's pool
    TagArrived { core: CoreId, tag: TagId },
    /// A deletion notice was applied on its originating core
    NoticeApplied { core: CoreId },
}

/// Channel statistics
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct SimStats {
    /// Tags shipped between cores
    pub tags_transferred: u64,
    /// Deletion notices shipped between cores
    pub notices_sent: u64,
    /// Frames delivered by `pump`
    pub frames_delivered: u64,
}

/// Two metadata cores and the channel between them.
pub struct DualChip {
    p0: MetaCore,
    p1: MetaCore,
    to_p0: VecDeque<Vec<u8>>,
    to_p1: VecDeque<Vec<u8>>,
    codec_p0: FrameCodec,
    codec_p1: FrameCodec,
    stats: SimStats,
}

impl DualChip {
    /// A chip with empty cores and an idle channel.
    pub fn new() -> Self {
        DualChip {
            p0: MetaCore::new(CoreId::P0),
            p1: MetaCore::new(CoreId::P1),
            to_p0: VecDeque::new(),
            to_p1: VecDeque::new(),
            codec_p0: FrameCodec::new(),
            codec_p1: FrameCodec::new(),
            stats: SimStats::default(),
        }
    }

    /// One core's metadata state.
    pub fn core(&self, core: CoreId) -> &MetaCore {
        match core {
            CoreId::P0 => &self.p0,
            CoreId::P1 => &self.p1,
        }
    }

    /// Mutable access to one core's metadata state.
    pub fn core_mut(&mut self, core: CoreId) -> &mut MetaCore {
        match core {
            CoreId::P0 => &mut self.p0,
            CoreId::P1 => &mut self.p1,
        }
    }

    /// Channel statistics so far.
    pub fn stats(&self) -> SimStats {
        self.stats
    }

    /// Statistics as a JSON report.
    pub fn report_json(&self) -> String {
        serde_json::to_string(&self.stats).unwrap_or_default()
    }

    fn encode(&mut self, from: CoreId, msg: &LinkMessage) -> Result<Vec<u8>, SimError> {
        let codec = match from {
            CoreId::P0 => &mut self.codec_p0,
            CoreId::P1 => &mut self.codec_p1,
        };
        let mut buffer = [0u8; MAX_FRAME_SIZE];
        let len = codec
            .encode(msg, &mut buffer)
            .map_err(SimError::Frame)?;
        Ok(buffer[..len].to_vec())
    }

    fn queue_to(&mut self, core: CoreId) -> &mut VecDeque<Vec<u8>> {
        match core {
            CoreId::P0 => &mut self.to_p0,
            CoreId::P1 => &mut self.to_p1,
        }
    }

    /// Ship a tag to the peer core. It stays in flight until [`pump`].
    ///
    /// [`pump`]: Self::pump
    pub fn transfer(&mut self, from: CoreId, tag: TagId) -> Result<(), SimError> {
        let wire = self.core_mut(from).export_tag(tag)?;
        let frame = self.encode(from, &LinkMessage::Tag(wire))?;
        self.queue_to(from.peer()).push_back(frame);
        self.stats.tags_transferred += 1;
        Ok(())
    }

    /// Drain outgoing notices and deliver every queued frame, in order,
    /// until the channel is quiet. Returns what was delivered.
    pub fn pump(&mut self) -> Result<Vec<Delivery>, SimError> {
        let mut deliveries = Vec::new();
        loop {
            let mut moved = false;

            // Outgoing deletion notices join the same in-order channel
            for core in [CoreId::P0, CoreId::P1] {
                while let Some(notice) = self.core_mut(core).take_notice() {
                    let frame = self.encode(core, &LinkMessage::Retired(notice))?;
                    self.queue_to(core.peer()).push_back(frame);
                    self.stats.notices_sent += 1;
                    moved = true;
                }
            }

            for core in [CoreId::P0, CoreId::P1] {
                while let Some(frame) = self.queue_to(core).pop_front() {
                    let (_, msg) = FrameCodec::parse(&frame)?;
                    self.stats.frames_delivered += 1;
                    match msg {
                        LinkMessage::Tag(wire) => match self.core_mut(core).import_tag(wire) {
                            Ok(tag) => deliveries.push(Delivery::TagArrived { core, tag }),
                            Err(err) => warn!("arriving tag dropped on {:?}: {:?}", core, err),
                        },
                        LinkMessage::Retired(notice) => {
                            self.core_mut(core).apply_retirement(notice);
                            deliveries.push(Delivery::NoticeApplied { core });
                        }
                    }
                    moved = true;
                }
            }

            if !moved {
                break;
            }
        }
        Ok(deliveries)
    }

    /// The tag delivered by the last entry of `deliveries`, if any.
    pub fn arrived_tag(deliveries: &[Delivery]) -> Option<TagId> {
        deliveries.iter().rev().find_map(|delivery| match delivery {
            Delivery::TagArrived { tag, .. } => Some(*tag),
            Delivery::NoticeApplied { .. } => None,
        })
    }
}

impl Default for DualChip {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_delivers_on_pump() {
        init_logging();
        let mut chip = DualChip::new();
        let tag = chip.core_mut(CoreId::P0).new_tag(64).unwrap();

        chip.transfer(CoreId::P0, tag).unwrap();
        assert_eq!(chip.core(CoreId::P1).tags().live_tags(), 0);

        let deliveries = chip.pump().unwrap();
        let arrived = DualChip::arrived_tag(&deliveries).unwrap();
        assert_eq!(chip.core(CoreId::P1).tag(arrived).unwrap().length, 64);
        assert_eq!(chip.stats().tags_transferred, 1);
        assert_eq!(chip.stats().frames_delivered, 1);
    }

    #[test]
    fn test_report_json_shape() {
        let chip = DualChip::new();
        let report = chip.report_json();
        assert!(report.contains("\"tags_transferred\":0"));
    }
}
