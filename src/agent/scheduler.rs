use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

/// Command polling cadence with jitter so devices don't poll in lockstep
#[derive(Debug, Clone, Copy)]
pub struct PollingScheduler {
    base_interval: Duration,
    jitter_range: Duration,
}

impl PollingScheduler {
    /// * `interval_secs` - Base polling interval in seconds
    /// * `jitter_secs` - Maximum jitter added on top, in seconds
    pub fn new(interval_secs: u64, jitter_secs: u64) -> Self {
        Self {
            base_interval: Duration::from_secs(interval_secs),
            jitter_range: Duration::from_secs(jitter_secs),
        }
    }

    /// Delay until the next poll
    pub fn next_interval(&self) -> Duration {
        let interval = self.base_interval + self.random_jitter();
        tracing::debug!("Next command poll in {} seconds", interval.as_secs());
        interval
    }

    /// Approximate wall-clock time of the next poll after `from`
    pub fn next_poll_time(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        let interval = chrono::Duration::from_std(self.base_interval + self.random_jitter())
            .unwrap_or_else(|_| chrono::Duration::seconds(0));
        from + interval
    }

    /// Random jitter in [0, jitter_range]
    fn random_jitter(&self) -> Duration {
        let jitter_secs = rand::thread_rng().gen_range(0..=self.jitter_range.as_secs());
        Duration::from_secs(jitter_secs)
    }
}
