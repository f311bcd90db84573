use once_cell::sync::Lazy;
use std::time::Instant;

static START: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic seconds since process start. Never wall time — every timeout
/// and RTT measurement in this crate is computed from differences of this
/// value, so only its monotonicity matters, not its absolute epoch.
pub fn now() -> f64 {
    START.elapsed().as_secs_f64()
}
