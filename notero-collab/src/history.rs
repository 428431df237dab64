//! Per-board delta log kept by the relay.
//!
//! Every delta accepted for a board gets the next relay sequence number.
//! Late joiners and reconnecting peers catch up by asking for everything
//! after the last sequence they saw.
//!
//! The log also tracks, per origin peer and map, the highest `client_seq`
//! already sequenced. A map publishes its deltas in `client_seq` order, so a
//! delta at or below that watermark is a resend of something already in the
//! log and is dropped.

use std::collections::HashMap;

use notero_core::Delta;
use uuid::Uuid;

use crate::protocol::SequencedDelta;

#[derive(Debug, Default)]
pub struct BoardHistory {
    entries: Vec<SequencedDelta>,
    watermarks: HashMap<(Uuid, String), u64>,
}

impl BoardHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence a delta from `origin`. Returns `None` for a duplicate.
    pub fn record(&mut self, origin: Uuid, delta: Delta) -> Option<SequencedDelta> {
        let mark = self
            .watermarks
            .entry((origin, delta.map.clone()))
            .or_insert(0);
        if delta.client_seq <= *mark {
            return None;
        }
        *mark = delta.client_seq;

        let entry = SequencedDelta {
            sequence: self.head() + 1,
            origin,
            delta,
        };
        self.entries.push(entry.clone());
        Some(entry)
    }

    /// Sequence number of the newest entry, 0 when empty.
    pub fn head(&self) -> u64 {
        self.entries.last().map_or(0, |e| e.sequence)
    }

    /// Every entry sequenced after `sequence`, oldest first.
    pub fn since(&self, sequence: u64) -> Vec<SequencedDelta> {
        let start = self.entries.partition_point(|e| e.sequence <= sequence);
        self.entries[start..].to_vec()
    }

    /// Highest `client_seq` sequenced for `origin` on `map`.
    pub fn watermark(&self, origin: Uuid, map: &str) -> u64 {
        self.watermarks
            .get(&(origin, map.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
