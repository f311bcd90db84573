//! Reliable-control queue: independent retry/timeout per queued control
//! message, with a rolling 16-slot history of assigned sequence numbers
//! used to match incoming acks back to the message that earned them.

use crate::seq::seq_gt;
use crate::types::PacketType;

const SEQ_HISTORY_LEN: usize = 16;

pub struct QueuedReliable {
    pub pkt_type: PacketType,
    pub payload: Vec<u8>,
    pub retry_interval: f64,
    pub timeout: f64,
    pub first_sent_time: f64,
    pub last_sent_time: f64,
    /// Sequence numbers assigned on each (re)transmission, most recent
    /// first; the oldest falls off once the history is full.
    pub seqs: [Option<u32>; SEQ_HISTORY_LEN],
}

impl QueuedReliable {
    pub fn new(pkt_type: PacketType, payload: Vec<u8>, retry_interval: f64, timeout: f64) -> Self {
        Self {
            pkt_type,
            payload,
            retry_interval,
            timeout,
            first_sent_time: 0.0,
            last_sent_time: 0.0,
            seqs: [None; SEQ_HISTORY_LEN],
        }
    }

    fn push_seq(&mut self, seq: u32) {
        for i in (1..SEQ_HISTORY_LEN).rev() {
            self.seqs[i] = self.seqs[i - 1];
        }
        self.seqs[0] = Some(seq);
    }
}

#[derive(Default)]
pub struct ReliableQueue {
    entries: Vec<QueuedReliable>,
}

impl ReliableQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, entry: QueuedReliable) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs every 100ms of tick. For each queued entry, drops it on
    /// timeout; otherwise, if its retry interval has elapsed, assigns it
    /// `next_seq()` (which also hands back the ack fields to frame it
    /// with, since allocating a seq and snapshotting the receive window
    /// happen atomically) and returns what's needed to send it.
    /// `next_seq` is called at most once per entry per tick.
    pub fn tick<F: FnMut() -> (u32, u32, u32)>(&mut self, now: f64, mut next_seq: F) -> Vec<(PacketType, Vec<u8>, u32, u32, u32)> {
        let mut to_send = Vec::new();
        self.entries.retain_mut(|entry| {
            if entry.first_sent_time > 0.0 && now - entry.first_sent_time >= entry.timeout {
                return false;
            }
            if now - entry.last_sent_time >= entry.retry_interval {
                let (seq, ack_id, ack_mask) = next_seq();
                entry.push_seq(seq);
                entry.last_sent_time = now;
                if entry.first_sent_time == 0.0 {
                    entry.first_sent_time = now;
                }
                to_send.push((entry.pkt_type, entry.payload.clone(), seq, ack_id, ack_mask));
            }
            true
        });
        to_send
    }

    /// Removes every entry for which any tracked seq falls within the
    /// 32-slot ack window behind `last_remote_ack_seq` and is present in
    /// `acked_seqs`.
    pub fn apply_ack(&mut self, last_remote_ack_seq: u32, acked_seqs: &[u32]) {
        self.entries.retain(|entry| {
            for maybe_seq in entry.seqs.iter().flatten() {
                let in_window = !seq_gt(*maybe_seq, last_remote_ack_seq) && last_remote_ack_seq.wrapping_sub(*maybe_seq) < 32;
                if in_window && acked_seqs.contains(maybe_seq) {
                    return false;
                }
            }
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn entry_retransmits_until_acked() {
        let mut q = ReliableQueue::new();
        q.enqueue(QueuedReliable::new(PacketType::Ping, vec![1, 2, 3], 0.5, 10.0));
        let mut seq = 0u32;
        let sent_at_t0 = q.tick(0.0, || {
            seq += 1;
            (seq, 0, 0)
        });
        assert_eq!(sent_at_t0.len(), 1);
        let sent_at_t0_2 = q.tick(0.2, || {
            seq += 1;
            (seq, 0, 0)
        });
        assert!(sent_at_t0_2.is_empty(), "retry interval not yet elapsed");
        q.apply_ack(1, &[1]);
        assert!(q.is_empty());
    }

    #[test]
    fn entry_drops_after_timeout() {
        let mut q = ReliableQueue::new();
        q.enqueue(QueuedReliable::new(PacketType::StreamState, vec![], 0.1, 1.0));
        let mut seq = 0u32;
        q.tick(0.0, || {
            seq += 1;
            (seq, 0, 0)
        });
        q.tick(2.0, || {
            seq += 1;
            (seq, 0, 0)
        });
        assert!(q.is_empty());
    }
}
