//! The reassembly buffer.
//!
//! Holds DATA that arrived ahead of the contiguous prefix and hands back
//! in-order runs as gaps fill. `expected_seq` is simultaneously the
//! cumulative-ACK value: the sequence number of the next byte the receiver
//! is waiting for.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::seq;

/// Classification of one inbound DATA segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataOutcome {
    /// The segment filled the next gap; `delivered` is the contiguous run
    /// now ready for the output file, in order.
    InOrder { delivered: Vec<Bytes> },
    /// Ahead of the contiguous prefix; held for later.
    Buffered,
    /// Already delivered, or already buffered.
    Duplicate,
}

#[derive(Debug)]
pub struct Assembler {
    expected_seq: u16,
    out_of_order: BTreeMap<u16, Bytes>,
}

impl Assembler {
    pub fn new(expected_seq: u16) -> Self {
        Assembler {
            expected_seq,
            out_of_order: BTreeMap::new(),
        }
    }

    /// The cumulative-ACK value.
    pub fn expected_seq(&self) -> u16 {
        self.expected_seq
    }

    pub fn buffered(&self) -> usize {
        self.out_of_order.len()
    }

    pub fn on_data(&mut self, s: u16, payload: Bytes) -> DataOutcome {
        if s == self.expected_seq {
            self.expected_seq = s.wrapping_add(payload.len() as u16);
            let mut delivered = vec![payload];

            // Drain the run of buffered successors that is now contiguous.
            while let Some(next) = self.out_of_order.remove(&self.expected_seq) {
                self.expected_seq = self.expected_seq.wrapping_add(next.len() as u16);
                delivered.push(next);
            }

            DataOutcome::InOrder { delivered }
        } else if seq::is_ahead(self.expected_seq, s) {
            if self.out_of_order.contains_key(&s) {
                DataOutcome::Duplicate
            } else {
                self.out_of_order.insert(s, payload);
                DataOutcome::Buffered
            }
        } else {
            // Behind the prefix: those bytes are already on disk.
            DataOutcome::Duplicate
        }
    }

    /// Account for the FIN consuming one sequence unit after the data.
    pub fn consume_fin(&mut self) {
        self.expected_seq = self.expected_seq.wrapping_add(1);
    }
}
