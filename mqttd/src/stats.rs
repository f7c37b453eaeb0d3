//! Broker statistics
//!
//! Counters are owned by the [`Broker`](crate::broker::Broker) and published under
//! `$SYS/{id}/` when `mqtt.stats` is enabled.

use serde::Serialize;
use serde_json::json;
use tokio::time::Instant;

use mqttd_utils::Counter;

#[derive(Serialize, Debug)]
pub struct Stats {
    /// Clients with an active connection
    pub connections: Counter,
    /// Accepted publishes, `$SYS` traffic excluded
    pub publishes: Counter,
    #[serde(skip)]
    started_at: Instant,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    #[inline]
    pub fn new() -> Self {
        Self {
            connections: Counter::new(),
            publishes: Counter::new(),
            started_at: Instant::now(),
        }
    }

    /// Whole seconds since the broker was built.
    #[inline]
    pub fn uptime(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "connections": self.connections.to_json(),
            "publishes": self.publishes.to_json(),
            "uptime": self.uptime(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn uptime_and_json() {
        let stats = Stats::new();
        stats.connections.inc();
        stats.publishes.incs(3);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(stats.uptime(), 5);

        let v = stats.to_json();
        assert_eq!(v["connections"]["count"], 1);
        assert_eq!(v["publishes"]["max"], 3);
        assert_eq!(v["uptime"], 5);
    }
}
