use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

use super::protocol::Outbound;

/// Application-level keepalive. The actor drives the timer; this only builds
/// the frames and remembers when the last one went out.
#[derive(Debug)]
pub struct Heartbeat {
    interval: Duration,
    last_sent: Option<Instant>,
    sent: u64,
}

impl Heartbeat {
    /// A zero interval disables the heartbeat.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
            sent: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    pub fn create_beat(&mut self) -> Outbound {
        self.last_sent = Some(Instant::now());
        self.sent = self.sent.saturating_add(1);
        Outbound::Heartbeat {
            timestamp: now_epoch_ms(),
        }
    }

    pub fn since_last(&self) -> Option<Duration> {
        self.last_sent.map(|sent| sent.elapsed())
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Forget the current connection's beat; the counter is lifetime-wide.
    pub fn reset(&mut self) {
        self.last_sent = None;
    }
}

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
