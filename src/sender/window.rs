//! Sliding-window state for the transmit engine.
//!
//! Pure bookkeeping, no I/O: the endpoint decides when to put segments on
//! the wire, this module decides what they contain and how acknowledgments
//! move the window. Sequence numbers count bytes modulo 2^16; SYN and FIN
//! each consume one sequence unit on either side of the data range.

use std::cmp;
use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;

use crate::{seq, MSS};

/// One in-flight DATA segment, held from first transmission until the
/// cumulative ACK passes its last byte.
#[derive(Debug, Clone)]
pub struct SendSlot {
    pub seq_start: u16,
    pub payload: Bytes,
    pub sent_at: Instant,
    pub transmissions: u32,
    acked: bool,
}

impl SendSlot {
    /// Sequence number one past this segment's last byte.
    fn seq_end(&self) -> u16 {
        self.seq_start.wrapping_add(self.payload.len() as u16)
    }
}

/// What one inbound ACK did to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The cumulative ACK advanced past `send_base`.
    Advanced { all_acked: bool },
    /// A duplicate of the current `send_base`; the exact third duplicate
    /// requests a fast retransmit of the oldest unacked segment.
    Duplicate { fast_retransmit: bool },
    /// Stale, or acknowledging bytes never sent.
    Ignored,
}

#[derive(Debug)]
pub struct SendWindow {
    isn: u16,
    max_win: usize,
    file: Bytes,
    /// Bytes handed to the wire at least once.
    sent_off: usize,
    send_base: u16,
    next_seq: u16,
    last_ack_seq: u16,
    dup_ack_count: u32,
    slots: VecDeque<SendSlot>,
}

impl SendWindow {
    pub fn new(isn: u16, max_win: usize, file: Bytes) -> Self {
        let first = isn.wrapping_add(1);

        SendWindow {
            isn,
            max_win,
            file,
            sent_off: 0,
            send_base: first,
            next_seq: first,
            last_ack_seq: first,
            dup_ack_count: 0,
            slots: VecDeque::new(),
        }
    }

    pub fn isn(&self) -> u16 {
        self.isn
    }

    pub fn send_base(&self) -> u16 {
        self.send_base
    }

    pub fn next_seq(&self) -> u16 {
        self.next_seq
    }

    pub fn file_len(&self) -> usize {
        self.file.len()
    }

    /// Sequence number of the FIN, one past the last data byte.
    pub fn fin_seq(&self) -> u16 {
        self.isn.wrapping_add(1).wrapping_add(self.file.len() as u16)
    }

    /// Bytes currently on the wire and unacknowledged.
    pub fn in_flight(&self) -> usize {
        seq::dist(self.send_base, self.next_seq) as usize
    }

    pub fn has_unacked(&self) -> bool {
        !self.slots.is_empty()
    }

    pub fn all_data_acked(&self) -> bool {
        self.sent_off == self.file.len() && self.slots.is_empty()
    }

    pub fn dup_ack_count(&self) -> u32 {
        self.dup_ack_count
    }

    /// Bytes the peer has cumulatively acknowledged.
    pub fn acked_bytes(&self) -> usize {
        let unacked: usize = self.slots.iter().map(|slot| slot.payload.len()).sum();
        self.sent_off - unacked
    }

    /// The sending rule: a new segment may leave only while a full MSS still
    /// fits inside the window.
    fn can_send(&self) -> bool {
        self.sent_off < self.file.len() && self.in_flight() + MSS <= self.max_win
    }

    /// Compose the next DATA segment, record its send-buffer slot, and
    /// advance `next_seq`. Returns `None` once the window is full or the
    /// file is exhausted.
    pub fn next_segment(&mut self, now: Instant) -> Option<(u16, Bytes)> {
        if !self.can_send() {
            return None;
        }

        let len = cmp::min(MSS, self.file.len() - self.sent_off);
        let payload = self.file.slice(self.sent_off..self.sent_off + len);
        let seq_start = self.next_seq;

        self.slots.push_back(SendSlot {
            seq_start,
            payload: payload.clone(),
            sent_at: now,
            transmissions: 1,
            acked: false,
        });

        self.sent_off += len;
        self.next_seq = self.next_seq.wrapping_add(len as u16);

        Some((seq_start, payload))
    }

    /// The oldest unacknowledged segment, re-stamped for another trip on the
    /// wire. Used by both timeout and fast retransmission.
    pub fn retransmit_oldest(&mut self, now: Instant) -> Option<(u16, Bytes)> {
        let slot = self.slots.front_mut()?;
        slot.sent_at = now;
        slot.transmissions += 1;

        Some((slot.seq_start, slot.payload.clone()))
    }

    /// Apply one cumulative ACK carrying sequence number `a`.
    pub fn on_ack(&mut self, a: u16) -> AckOutcome {
        let advance = seq::dist(self.send_base, a) as usize;

        if advance > 0 && advance <= self.in_flight() {
            // Everything whose last byte lies below `a` is now delivered.
            for slot in self.slots.iter_mut() {
                if seq::dist(self.send_base, slot.seq_end()) as usize <= advance {
                    slot.acked = true;
                }
            }
            while self.slots.front().map_or(false, |slot| slot.acked) {
                self.slots.pop_front();
            }

            self.send_base = a;
            self.last_ack_seq = a;
            self.dup_ack_count = 0;

            AckOutcome::Advanced {
                all_acked: self.slots.is_empty(),
            }
        } else if a == self.last_ack_seq && !self.slots.is_empty() {
            // Only the exact third duplicate fires a fast retransmit; later
            // duplicates keep counting without re-triggering until a new ACK
            // resets the counter.
            self.dup_ack_count += 1;

            AckOutcome::Duplicate {
                fast_retransmit: self.dup_ack_count == 3,
            }
        } else {
            AckOutcome::Ignored
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(isn: u16, max_win: usize, len: usize) -> SendWindow {
        let file: Vec<u8> = (0..len).map(|i| i as u8).collect();
        SendWindow::new(isn, max_win, Bytes::from(file))
    }

    fn drain(win: &mut SendWindow) -> Vec<(u16, usize)> {
        let mut sent = Vec::new();
        while let Some((seq, payload)) = win.next_segment(Instant::now()) {
            sent.push((seq, payload.len()));
        }
        sent
    }

    #[test]
    fn stop_and_wait_admits_one_segment() {
        let mut win = window(100, 1000, 3500);

        assert_eq!(drain(&mut win), vec![(101, 1000)]);
        assert_eq!(win.in_flight(), 1000);

        assert_eq!(
            win.on_ack(1101),
            AckOutcome::Advanced { all_acked: true }
        );
        assert_eq!(drain(&mut win), vec![(1101, 1000)]);
    }

    #[test]
    fn sliding_window_fills_to_capacity() {
        let mut win = window(0, 5000, 50_000);

        let sent = drain(&mut win);
        assert_eq!(sent.len(), 5);
        assert_eq!(win.in_flight(), 5000);

        // Invariant: occupancy never exceeds the window.
        assert!(win.in_flight() <= 5000);

        // One ACK frees exactly one MSS of space.
        assert_eq!(
            win.on_ack(1001),
            AckOutcome::Advanced { all_acked: false }
        );
        assert_eq!(drain(&mut win).len(), 1);
    }

    #[test]
    fn final_segment_may_be_short() {
        let mut win = window(0, 5000, 2500);
        assert_eq!(drain(&mut win), vec![(1, 1000), (1001, 1000), (2001, 500)]);
        assert_eq!(win.fin_seq(), 2501);
    }

    #[test]
    fn empty_file_has_nothing_to_send() {
        let mut win = window(42, 1000, 0);
        assert_eq!(win.next_segment(Instant::now()), None);
        assert!(win.all_data_acked());
        assert_eq!(win.fin_seq(), 43);
    }

    #[test]
    fn cumulative_ack_drops_covered_slots() {
        let mut win = window(0, 5000, 5000);
        drain(&mut win);

        assert_eq!(
            win.on_ack(3001),
            AckOutcome::Advanced { all_acked: false }
        );
        assert_eq!(win.send_base(), 3001);
        assert_eq!(win.in_flight(), 2000);

        assert_eq!(win.on_ack(5001), AckOutcome::Advanced { all_acked: true });
        assert!(win.all_data_acked());
    }

    #[test]
    fn third_duplicate_triggers_exactly_one_fast_retransmit() {
        let mut win = window(0, 5000, 5000);
        drain(&mut win);

        assert_eq!(
            win.on_ack(1),
            AckOutcome::Duplicate {
                fast_retransmit: false
            }
        );
        assert_eq!(
            win.on_ack(1),
            AckOutcome::Duplicate {
                fast_retransmit: false
            }
        );
        assert_eq!(
            win.on_ack(1),
            AckOutcome::Duplicate {
                fast_retransmit: true
            }
        );

        // A fourth and fifth duplicate alone do not re-trigger.
        assert_eq!(
            win.on_ack(1),
            AckOutcome::Duplicate {
                fast_retransmit: false
            }
        );
        assert_eq!(
            win.on_ack(1),
            AckOutcome::Duplicate {
                fast_retransmit: false
            }
        );

        // An advancing ACK resets the counter for a fresh round.
        assert_eq!(
            win.on_ack(1001),
            AckOutcome::Advanced { all_acked: false }
        );
        assert_eq!(win.dup_ack_count(), 0);
        win.on_ack(1001);
        win.on_ack(1001);
        assert_eq!(
            win.on_ack(1001),
            AckOutcome::Duplicate {
                fast_retransmit: true
            }
        );
    }

    #[test]
    fn retransmission_restamps_the_oldest_slot() {
        let mut win = window(0, 2000, 2000);
        drain(&mut win);

        let (seq, payload) = win.retransmit_oldest(Instant::now()).unwrap();
        assert_eq!(seq, 1);
        assert_eq!(payload.len(), 1000);
        assert_eq!(win.slots.front().unwrap().transmissions, 2);

        // Retransmission does not move the window edges.
        assert_eq!(win.send_base(), 1);
        assert_eq!(win.in_flight(), 2000);
    }

    #[test]
    fn stale_and_unsent_acks_are_ignored() {
        let mut win = window(1000, 3000, 3000);
        drain(&mut win);

        win.on_ack(2001);
        assert_eq!(win.send_base(), 2001);

        // Behind the window.
        assert_eq!(win.on_ack(1001), AckOutcome::Ignored);
        // Beyond anything transmitted.
        assert_eq!(win.on_ack(4101), AckOutcome::Ignored);
        // The window is untouched either way.
        assert_eq!(win.send_base(), 2001);
        assert_eq!(win.in_flight(), 2000);
    }

    #[test]
    fn window_slides_across_sequence_wrap() {
        let mut win = window(65000, 2000, 2000);

        let sent = drain(&mut win);
        assert_eq!(sent, vec![(65001, 1000), (465, 1000)]);

        assert_eq!(
            win.on_ack(465),
            AckOutcome::Advanced { all_acked: false }
        );
        assert_eq!(win.send_base(), 465);
        assert_eq!(win.on_ack(1465), AckOutcome::Advanced { all_acked: true });
        assert_eq!(win.fin_seq(), 1465);
    }

    #[test]
    fn occupancy_invariant_holds_under_incremental_acks() {
        let mut win = window(0, 4000, 20_000);

        let mut acked = 1u16;
        loop {
            while win.next_segment(Instant::now()).is_some() {}
            assert!(win.in_flight() <= 4000);

            if win.all_data_acked() {
                break;
            }

            acked = acked.wrapping_add(1000);
            win.on_ack(acked);
        }
    }
}
