//! Keepalive pings and dead-socket detection.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Configuration for keepalive behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Seconds between pings. Zero disables keepalive.
    pub interval_secs: u64,
    /// Pings that may go a full interval unanswered before the socket is
    /// considered dead. The first tick after open always pings, so expiry
    /// comes `max_missed_pongs + 1` intervals into total silence.
    pub max_missed_pongs: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            max_missed_pongs: 2,
        }
    }
}

impl KeepaliveConfig {
    /// Keepalive turned off.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            interval_secs: 0,
            max_missed_pongs: 0,
        }
    }

    /// Whether pings are sent at all.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.interval_secs > 0
    }

    /// Ping interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// What to do when the keepalive timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveAction {
    /// Send another ping.
    Ping,
    /// Too many silent intervals; treat the socket as dead.
    Expired,
}

/// Tracks silence on one socket.
#[derive(Debug)]
pub struct Keepalive {
    config: KeepaliveConfig,
    missed: u32,
}

impl Keepalive {
    /// Tracker for a freshly opened socket.
    #[must_use]
    pub const fn new(config: KeepaliveConfig) -> Self {
        Self { config, missed: 0 }
    }

    /// Timer driving this tracker, or `None` when disabled.
    ///
    /// The first tick fires one full interval after the socket opens.
    #[must_use]
    pub fn ticker(&self) -> Option<Interval> {
        if !self.config.is_enabled() {
            return None;
        }
        let period = self.config.interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(ticker)
    }

    /// Pings sent since the last inbound traffic.
    #[must_use]
    pub const fn missed(&self) -> u32 {
        self.missed
    }

    /// Any inbound traffic proves the socket is alive.
    pub fn activity(&mut self) {
        self.missed = 0;
    }

    /// Called on each timer tick.
    ///
    /// Pings until `max_missed_pongs` pings are outstanding, then expires
    /// on the following tick.
    pub fn tick(&mut self) -> KeepaliveAction {
        if self.missed >= self.config.max_missed_pongs {
            return KeepaliveAction::Expired;
        }
        self.missed += 1;
        KeepaliveAction::Ping
    }
}

/// Wait for the next keepalive tick; never resolves when keepalive is off.
pub async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_config_default() {
        let config = KeepaliveConfig::default();
        assert_eq!(config.interval(), Duration::from_secs(30));
        assert_eq!(config.max_missed_pongs, 2);
        assert!(config.is_enabled());
    }

    #[test]
    fn test_disabled_has_no_ticker() {
        let keepalive = Keepalive::new(KeepaliveConfig::disabled());
        assert!(keepalive.ticker().is_none());
    }

    #[test]
    fn test_expires_after_max_missed() {
        let mut keepalive = Keepalive::new(KeepaliveConfig {
            interval_secs: 1,
            max_missed_pongs: 2,
        });

        // Two pings go out and each gets a full interval to be answered.
        assert_eq!(keepalive.tick(), KeepaliveAction::Ping);
        assert_eq!(keepalive.tick(), KeepaliveAction::Ping);
        assert_eq!(keepalive.missed(), 2);
        assert_eq!(keepalive.tick(), KeepaliveAction::Expired);
    }

    #[test]
    fn test_ticks_until_expiry_match_missed_pongs() {
        for max_missed_pongs in 1..=5 {
            let mut keepalive = Keepalive::new(KeepaliveConfig {
                interval_secs: 1,
                max_missed_pongs,
            });
            let pings = std::iter::from_fn(|| match keepalive.tick() {
                KeepaliveAction::Ping => Some(()),
                KeepaliveAction::Expired => None,
            })
            .count();
            assert_eq!(pings, max_missed_pongs as usize);
        }
    }

    #[test]
    fn test_activity_resets_missed() {
        let mut keepalive = Keepalive::new(KeepaliveConfig {
            interval_secs: 1,
            max_missed_pongs: 1,
        });

        assert_eq!(keepalive.tick(), KeepaliveAction::Ping);
        keepalive.activity();
        assert_eq!(keepalive.missed(), 0);
        assert_eq!(keepalive.tick(), KeepaliveAction::Ping);
        assert_eq!(keepalive.tick(), KeepaliveAction::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_first_tick_after_one_interval() {
        let keepalive = Keepalive::new(KeepaliveConfig {
            interval_secs: 5,
            max_missed_pongs: 1,
        });
        let mut ticker = keepalive.ticker();
        let start = Instant::now();

        next_tick(&mut ticker).await;
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_ticker_never_fires() {
        let mut ticker: Option<Interval> = None;
        let fired = tokio::time::timeout(Duration::from_secs(3600), next_tick(&mut ticker)).await;
        assert!(fired.is_err());
    }
}
