//! Public counters (`voip_stats_t` equivalent) and the JSON debug-log
//! snapshot, capped at a bounded ring so a long-running call doesn't
//! grow its log unboundedly (the original never bounds `debugLogs`; see
//! DESIGN.md for why this crate does).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::types::NetworkType;

#[derive(Default)]
pub struct ControllerStats {
    pub bytes_sent_wifi: AtomicU64,
    pub bytes_recvd_wifi: AtomicU64,
    pub bytes_sent_mobile: AtomicU64,
    pub bytes_recvd_mobile: AtomicU64,
    pub packets_sent: AtomicU64,
    pub packets_recvd: AtomicU64,
}

impl ControllerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, network: NetworkType, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        if network.is_mobile() {
            self.bytes_sent_mobile.fetch_add(bytes as u64, Ordering::Relaxed);
        } else {
            self.bytes_sent_wifi.fetch_add(bytes as u64, Ordering::Relaxed);
        }
    }

    pub fn record_received(&self, network: NetworkType, bytes: usize) {
        self.packets_recvd.fetch_add(1, Ordering::Relaxed);
        if network.is_mobile() {
            self.bytes_recvd_mobile.fetch_add(bytes as u64, Ordering::Relaxed);
        } else {
            self.bytes_recvd_wifi.fetch_add(bytes as u64, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent_wifi: self.bytes_sent_wifi.load(Ordering::Relaxed),
            bytes_recvd_wifi: self.bytes_recvd_wifi.load(Ordering::Relaxed),
            bytes_sent_mobile: self.bytes_sent_mobile.load(Ordering::Relaxed),
            bytes_recvd_mobile: self.bytes_recvd_mobile.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_recvd: self.packets_recvd.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatsSnapshot {
    pub bytes_sent_wifi: u64,
    pub bytes_recvd_wifi: u64,
    pub bytes_sent_mobile: u64,
    pub bytes_recvd_mobile: u64,
    pub packets_sent: u64,
    pub packets_recvd: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DebugInfo {
    pub timestamp: f64,
    pub state: String,
    pub current_endpoint: Option<String>,
    pub average_rtt: f64,
    pub bitrate: u32,
    pub send_loss_percent: f64,
}

const DEBUG_LOG_CAPACITY: usize = 50;

#[derive(Default)]
pub struct DebugLog {
    entries: VecDeque<String>,
}

impl DebugLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, info: &DebugInfo) {
        let json = serde_json::to_string(info).unwrap_or_else(|_| "{}".to_owned());
        if self.entries.len() == DEBUG_LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(json);
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn debug_log_is_bounded() {
        let mut log = DebugLog::new();
        for i in 0..100 {
            log.push(&DebugInfo {
                timestamp: i as f64,
                state: "Established".into(),
                current_endpoint: None,
                average_rtt: 0.05,
                bitrate: 20000,
                send_loss_percent: 0.0,
            });
        }
        assert_eq!(log.len(), DEBUG_LOG_CAPACITY);
    }

    #[test]
    fn stats_split_by_network_class() {
        let stats = ControllerStats::new();
        stats.record_sent(NetworkType::Wifi, 100);
        stats.record_sent(NetworkType::Gprs, 50);
        let snap = stats.snapshot();
        assert_eq!(snap.bytes_sent_wifi, 100);
        assert_eq!(snap.bytes_sent_mobile, 50);
    }
}
