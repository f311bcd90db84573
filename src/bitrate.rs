//! Adaptive audio bitrate and loss-hint policy: bitrate ceilings chosen
//! by classified network type and data-saving mode, a tick-driven
//! bandwidth-action response, and a piecewise loss-rate to FEC-hint
//! mapping sampled once a second.

use std::collections::VecDeque;

use crate::congestion::BandwidthAction;
use crate::types::{DataSavingMode, NetworkType};

/// Constructor defaults, carried over from the original implementation's
/// bitrate constants.
#[derive(Debug, Clone, Copy)]
pub struct BitrateConfig {
    pub init_bitrate: u32,
    pub min_bitrate: u32,
    pub max_bitrate: u32,
    pub max_bitrate_edge: u32,
    pub max_bitrate_gprs: u32,
    pub max_bitrate_saving: u32,
    pub step_incr: u32,
    pub step_decr: u32,
}

impl Default for BitrateConfig {
    fn default() -> Self {
        Self {
            init_bitrate: 20_000,
            min_bitrate: 8_000,
            max_bitrate: 32_000,
            max_bitrate_edge: 8_000,
            max_bitrate_gprs: 6_000,
            max_bitrate_saving: 8_000,
            step_incr: 1_000,
            step_decr: 2_000,
        }
    }
}

pub struct BitratePolicy {
    config: BitrateConfig,
    current_bitrate: u32,
    loss_samples: VecDeque<f64>,
}

const LOSS_WINDOW: usize = 10;

impl BitratePolicy {
    pub fn new(config: BitrateConfig) -> Self {
        let current_bitrate = config.init_bitrate;
        Self { config, current_bitrate, loss_samples: VecDeque::with_capacity(LOSS_WINDOW) }
    }

    pub fn current_bitrate(&self) -> u32 {
        self.current_bitrate
    }

    /// The bitrate ceiling for the current network classification and
    /// data-saving policy (locally enabled, requested by peer, or forced
    /// by config on mobile).
    pub fn ceiling(&self, network: NetworkType, data_saving: DataSavingMode, peer_requested_saving: bool) -> u32 {
        let saving_active = data_saving == DataSavingMode::Always || (data_saving == DataSavingMode::Mobile && network.is_mobile()) || peer_requested_saving;
        if saving_active {
            return self.config.max_bitrate_saving;
        }
        if network.is_low_speed() {
            return if network == NetworkType::Gprs { self.config.max_bitrate_gprs } else { self.config.max_bitrate_edge };
        }
        self.config.max_bitrate
    }

    /// Evaluated every tick while `Established`. Applies the congestion
    /// controller's action, clamped to `[min_bitrate, ceiling]`.
    pub fn apply_bandwidth_action(&mut self, action: BandwidthAction, ceiling: u32) -> u32 {
        match action {
            BandwidthAction::Decrease => {
                self.current_bitrate = self.current_bitrate.saturating_sub(self.config.step_decr).max(self.config.min_bitrate);
            }
            BandwidthAction::Increase => {
                self.current_bitrate = (self.current_bitrate + self.config.step_incr).min(ceiling);
            }
            BandwidthAction::Hold => {}
        }
        self.current_bitrate = self.current_bitrate.min(ceiling).max(self.config.min_bitrate);
        self.current_bitrate
    }

    /// Records one second's worth of per-frame loss and returns the
    /// `packet_loss` hint for the encoder if a full window is available.
    pub fn sample_loss(&mut self, loss_fraction: f64) -> Option<u32> {
        if self.loss_samples.len() == LOSS_WINDOW {
            self.loss_samples.pop_front();
        }
        self.loss_samples.push_back(loss_fraction);
        if self.loss_samples.len() < LOSS_WINDOW {
            return None;
        }
        let avg = self.loss_samples.iter().sum::<f64>() / LOSS_WINDOW as f64;
        Some(loss_to_packet_loss_hint(avg))
    }
}

fn loss_to_packet_loss_hint(avg_loss: f64) -> u32 {
    if avg_loss > 0.10 {
        40
    } else if avg_loss > 0.075 {
        35
    } else if avg_loss > 0.0625 {
        30
    } else if avg_loss > 0.05 {
        25
    } else if avg_loss > 0.025 {
        20
    } else if avg_loss > 0.01 {
        17
    } else {
        15
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn loss_adaptive_hint_matches_schedule() {
        let mut policy = BitratePolicy::new(BitrateConfig::default());
        let mut hint = None;
        for _ in 0..10 {
            hint = policy.sample_loss(0.08);
        }
        assert_eq!(hint, Some(35));
    }

    #[test]
    fn data_saving_forces_lowest_ceiling() {
        let policy = BitratePolicy::new(BitrateConfig::default());
        let ceiling = policy.ceiling(NetworkType::Wifi, DataSavingMode::Always, false);
        assert_eq!(ceiling, policy.config.max_bitrate_saving);
    }
}
