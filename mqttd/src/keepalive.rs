use std::time::Duration;

use tokio::time::Instant;

/// Deadline bookkeeping of one connection.
///
/// Any inbound packet pushes the deadline to `now + keep_alive * backoff`, a keep alive
/// of zero never expires.
#[derive(Debug, Clone, Copy)]
pub struct KeepAlive {
    keep_alive: u16,
    interval: Duration,
}

impl KeepAlive {
    #[inline]
    pub fn new(keep_alive: u16, backoff: f32) -> Self {
        let interval = if keep_alive == 0 {
            Duration::from_secs(u32::MAX as u64)
        } else {
            Duration::from_secs_f64(keep_alive as f64 * backoff.max(1.0) as f64)
        };
        Self { keep_alive, interval }
    }

    #[inline]
    pub fn is_disabled(&self) -> bool {
        self.keep_alive == 0
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Next expiry, counted from now.
    #[inline]
    pub fn deadline(&self) -> Instant {
        Instant::now() + self.interval
    }

    /// A sleep that fires at the first deadline, reset it with [`KeepAlive::deadline`].
    #[inline]
    pub fn sleep(&self) -> tokio::time::Sleep {
        tokio::time::sleep_until(self.deadline())
    }
}
