//! Congestion controller: byte-counting AIMD over the inflight window.
//! Implements the contract from the component design rather than a
//! literal port — any model satisfying (i) inflight == sent-minus-acked
//! in the window, (ii) DECREASE once smoothed loss rises materially
//! above threshold, (iii) INCREASE once inflight stays small relative to
//! the window for a full RTT, is conforming.

use std::collections::VecDeque;

use crate::seq::seq_gt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandwidthAction {
    Decrease,
    Hold,
    Increase,
}

struct InflightSample {
    seq: u32,
    len: u32,
    sent_at: f64,
    acked: bool,
}

pub struct CongestionController {
    inflight: VecDeque<InflightSample>,
    pub send_loss_count: u64,
    sent_count: u64,
    rtt_min: f64,
    rtt_avg: f64,
    window_bytes: u64,
    low_inflight_since: Option<f64>,
}

const INITIAL_WINDOW_BYTES: u64 = 32 * 1024;
const MIN_WINDOW_BYTES: u64 = 4 * 1024;
const MAX_WINDOW_BYTES: u64 = 512 * 1024;
const LOSS_DECREASE_THRESHOLD: f64 = 0.02;
const MAX_TRACKED_SAMPLES: usize = 256;
/// Width of the peer's ack-mask window (§4.3): once the peer's highest
/// acked seq has advanced this far past a still-unacked sample, that
/// sample's slot has aged out of the mask and it will never be acked —
/// the gap itself is the loss signal.
const ACK_WINDOW: u32 = 32;

impl Default for CongestionController {
    fn default() -> Self {
        Self {
            inflight: VecDeque::new(),
            send_loss_count: 0,
            sent_count: 0,
            rtt_min: f64::MAX,
            rtt_avg: 0.0,
            window_bytes: INITIAL_WINDOW_BYTES,
            low_inflight_since: None,
        }
    }
}

impl CongestionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packet_sent(&mut self, seq: u32, len: u32, now: f64) {
        self.sent_count += 1;
        self.inflight.push_back(InflightSample { seq, len, sent_at: now, acked: false });
        while self.inflight.len() > MAX_TRACKED_SAMPLES {
            let dropped = self.inflight.pop_front().unwrap();
            if !dropped.acked {
                self.send_loss_count += 1;
            }
        }
    }

    pub fn packet_acknowledged(&mut self, seq: u32, now: f64) {
        if let Some(sample) = self.inflight.iter_mut().find(|s| s.seq == seq) {
            if !sample.acked {
                sample.acked = true;
                let rtt = now - sample.sent_at;
                if rtt > 0.0 {
                    self.rtt_min = self.rtt_min.min(rtt);
                    self.rtt_avg = if self.rtt_avg == 0.0 { rtt } else { self.rtt_avg * 0.9 + rtt * 0.1 };
                }
            }
        }
    }

    /// Called once per received ack update with the peer's new
    /// `last_remote_ack_seq`. Any still-unacked sample more than
    /// `ACK_WINDOW` behind it is inferred lost — its slot has aged out
    /// of the peer's ack mask and no future ack can cover it.
    pub fn on_ack_horizon_advanced(&mut self, ack_id: u32) {
        while let Some(front) = self.inflight.front() {
            if seq_gt(ack_id, front.seq) && ack_id.wrapping_sub(front.seq) > ACK_WINDOW {
                let sample = self.inflight.pop_front().unwrap();
                if !sample.acked {
                    self.send_loss_count += 1;
                }
            } else {
                break;
            }
        }
    }

    /// Bytes sent but not yet acknowledged within the tracked window.
    pub fn inflight_data_size(&self) -> u64 {
        self.inflight.iter().filter(|s| !s.acked).map(|s| s.len as u64).sum()
    }

    pub fn average_rtt(&self) -> f64 {
        self.rtt_avg
    }

    pub fn min_rtt(&self) -> f64 {
        if self.rtt_min == f64::MAX {
            0.0
        } else {
            self.rtt_min
        }
    }

    fn smoothed_loss_rate(&self) -> f64 {
        if self.sent_count == 0 {
            0.0
        } else {
            self.send_loss_count as f64 / self.sent_count as f64
        }
    }

    pub fn tick(&mut self, now: f64) {
        let loss = self.smoothed_loss_rate();
        let inflight = self.inflight_data_size();

        if loss > LOSS_DECREASE_THRESHOLD {
            self.window_bytes = (self.window_bytes * 7 / 10).max(MIN_WINDOW_BYTES);
            self.low_inflight_since = None;
            return;
        }

        if inflight < self.window_bytes / 2 {
            let since = *self.low_inflight_since.get_or_insert(now);
            let rtt = if self.rtt_avg > 0.0 { self.rtt_avg } else { 0.1 };
            if now - since >= rtt {
                self.window_bytes = (self.window_bytes + self.window_bytes / 8).min(MAX_WINDOW_BYTES);
                self.low_inflight_since = Some(now);
            }
        } else {
            self.low_inflight_since = None;
        }
    }

    pub fn get_bandwidth_control_action(&self) -> BandwidthAction {
        let loss = self.smoothed_loss_rate();
        if loss > LOSS_DECREASE_THRESHOLD {
            return BandwidthAction::Decrease;
        }
        let inflight = self.inflight_data_size();
        if inflight < self.window_bytes / 2 {
            BandwidthAction::Increase
        } else {
            BandwidthAction::Hold
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn loss_triggers_decrease() {
        let mut c = CongestionController::new();
        for seq in 0..100u32 {
            c.packet_sent(seq, 200, seq as f64 * 0.02);
        }
        // Only the first half ever gets acked; the peer's ack horizon
        // keeps advancing (carried by later data/ping traffic) well past
        // the other half, aging their slots out of the 32-wide ack mask.
        for seq in 0..50u32 {
            c.packet_acknowledged(seq, seq as f64 * 0.02 + 0.05);
        }
        c.on_ack_horizon_advanced(99);
        assert!(c.send_loss_count > 0, "unacked samples aged past the ack window must count as loss");
        assert_eq!(c.get_bandwidth_control_action(), BandwidthAction::Decrease);
    }

    #[test]
    fn full_ack_coverage_allows_increase() {
        let mut c = CongestionController::new();
        for seq in 0..10u32 {
            c.packet_sent(seq, 200, seq as f64 * 0.02);
            c.packet_acknowledged(seq, seq as f64 * 0.02 + 0.02);
        }
        assert_eq!(c.get_bandwidth_control_action(), BandwidthAction::Increase);
    }
}
