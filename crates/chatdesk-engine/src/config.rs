use chatdesk_core::classify::default_standby_window;
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);
pub const DEFAULT_NOTICE_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub session_id: String,
    pub client_id: String,
    pub poll_interval: Duration,
    pub standby_window: chrono::Duration,
    pub heartbeat_timeout: Duration,
    pub connect_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub notice_capacity: usize,
    /// Fetch one full snapshot each time push becomes active. Push only
    /// carries events raised after the handshake.
    pub bootstrap_snapshot: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session_id: "default".to_string(),
            client_id: format!("chatdesk-{}", std::process::id()),
            poll_interval: DEFAULT_POLL_INTERVAL,
            standby_window: default_standby_window(),
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            backoff_initial: DEFAULT_BACKOFF_INITIAL,
            backoff_max: DEFAULT_BACKOFF_MAX,
            notice_capacity: DEFAULT_NOTICE_CAPACITY,
            bootstrap_snapshot: true,
        }
    }
}

impl EngineConfig {
    /// Poll interval clamped so a zero value cannot spin.
    pub fn effective_poll_interval(&self) -> Duration {
        self.poll_interval.max(MIN_POLL_INTERVAL)
    }

    pub fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let config = EngineConfig::default();
        let mut backoff = config.backoff_initial;
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(backoff.as_secs());
            backoff = config.next_backoff(backoff);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn zero_poll_interval_is_clamped() {
        let config = EngineConfig {
            poll_interval: Duration::ZERO,
            ..EngineConfig::default()
        };
        assert_eq!(config.effective_poll_interval(), MIN_POLL_INTERVAL);
    }
}
