use std::time::Duration;

use tokio::time::Instant;

use crate::config::EngineOptions;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollingMode {
    Fast,
    Slow,
    Idle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollingRates {
    pub fast: Duration,
    pub slow: Duration,
    pub fast_window: Duration,
    pub idle_after: Option<Duration>,
    /// `None` suspends polling while idle.
    pub idle: Option<Duration>,
}

impl PollingRates {
    pub fn from_options(options: &EngineOptions) -> Self {
        Self {
            fast: options.fast_polling_rate,
            slow: options.slow_polling_rate,
            fast_window: options.fast_polling_duration,
            idle_after: options.idle_polling_after,
            idle: options.idle_polling_rate,
        }
    }

    /// Longest gap a quiet engine with these rates leaves between polls.
    pub fn longest_gap(&self, heartbeat: Duration) -> Duration {
        let quiet = match self.idle_after {
            Some(_) => self.idle.map_or(heartbeat, |idle| idle.max(self.slow)),
            None => self.slow,
        };
        quiet.max(self.fast).min(heartbeat)
    }
}

/// Adaptive poll cadence. Activity snaps the scheduler back to `Fast`; once
/// the fast window passes quietly it relaxes to `Slow`, and to `Idle` when
/// idling is configured.
#[derive(Debug)]
pub struct PollingScheduler {
    rates: PollingRates,
    last_activity: Instant,
    stopped: bool,
}

impl PollingScheduler {
    pub fn new(rates: PollingRates, now: Instant) -> Self {
        Self {
            rates,
            last_activity: now,
            stopped: false,
        }
    }

    pub fn record_activity(&mut self, now: Instant) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    pub fn mode(&self, now: Instant) -> PollingMode {
        let quiet = now.saturating_duration_since(self.last_activity);
        if quiet < self.rates.fast_window {
            return PollingMode::Fast;
        }
        match self.rates.idle_after {
            Some(idle_after) if quiet >= idle_after => PollingMode::Idle,
            _ => PollingMode::Slow,
        }
    }

    /// Gap to the next poll in the current mode. `None` while stopped or
    /// suspended in `Idle` without a rate.
    pub fn interval(&self, now: Instant) -> Option<Duration> {
        if self.stopped {
            return None;
        }
        match self.mode(now) {
            PollingMode::Fast => Some(self.rates.fast),
            PollingMode::Slow => Some(self.rates.slow),
            PollingMode::Idle => self.rates.idle,
        }
    }

    /// When the next poll is due given when the previous one started. The
    /// heartbeat bound applies in every mode, idle included.
    pub fn next_poll_at(&self, last_poll: Option<Instant>, heartbeat: Duration, now: Instant) -> Option<Instant> {
        if self.stopped {
            return None;
        }
        let Some(last_poll) = last_poll else {
            return Some(now);
        };
        let gap = match self.interval(now) {
            Some(interval) => interval.min(heartbeat),
            None => heartbeat,
        };
        Some(last_poll + gap)
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }
}
