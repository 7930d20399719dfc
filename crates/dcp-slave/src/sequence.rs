//! 16-bit sequence counters.
//!
//! The master numbers control PDUs and each data channel separately. The
//! tracker remembers the last accepted number per channel and classifies
//! every new one with wrapping arithmetic, so 0 follows 0xFFFF.

use std::collections::HashMap;

/// Numbers this far ahead or more count as old.
const HALF_RANGE: u16 = 0x8000;

/// Independently numbered PDU stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// STC, CFG and INF PDUs from the master.
    Control,
    /// `DAT_input_output` of one data id.
    InputOutput(u16),
    /// `DAT_parameter` of one parameter id.
    Parameter(u16),
}

/// Classification of a received sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// First PDU seen on the channel.
    First,
    /// Exactly the next number.
    InOrder,
    /// Newer than expected; `missing` PDUs were lost.
    Gap {
        /// Number that was expected.
        expected: u16,
        /// Number of skipped PDUs.
        missing: u16,
    },
    /// Already seen or older than the last accepted number.
    Stale {
        /// Last accepted number.
        last: u16,
    },
}

impl SequenceCheck {
    /// The PDU should be processed.
    #[must_use]
    pub fn is_accepted(self) -> bool {
        !matches!(self, Self::Stale { .. })
    }
}

/// Incoming and outgoing sequence counters.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    incoming: HashMap<Channel, u16>,
    outgoing: HashMap<u16, u16>,
}

impl SequenceTracker {
    /// Create a tracker with no history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify `seq` on `channel`, remembering it if accepted.
    pub fn check(&mut self, channel: Channel, seq: u16) -> SequenceCheck {
        let Some(last) = self.incoming.get(&channel).copied() else {
            self.incoming.insert(channel, seq);
            return SequenceCheck::First;
        };

        let diff = seq.wrapping_sub(last);
        let result = match diff {
            0 => SequenceCheck::Stale { last },
            d if d >= HALF_RANGE => SequenceCheck::Stale { last },
            1 => SequenceCheck::InOrder,
            d => SequenceCheck::Gap {
                expected: last.wrapping_add(1),
                missing: d - 1,
            },
        };
        if result.is_accepted() {
            self.incoming.insert(channel, seq);
        }
        result
    }

    /// Next number for outgoing `DAT_input_output` of `data_id`.
    pub fn next_outgoing(&mut self, data_id: u16) -> u16 {
        let counter = self.outgoing.entry(data_id).or_insert(0);
        let seq = *counter;
        *counter = counter.wrapping_add(1);
        seq
    }

    /// Forget all incoming history, e.g. after deregistration.
    pub fn reset_incoming(&mut self) {
        self.incoming.clear();
    }

    /// Treat `seq` as the last accepted number on `channel`.
    pub fn seed(&mut self, channel: Channel, seq: u16) {
        self.incoming.insert(channel, seq);
    }
}
