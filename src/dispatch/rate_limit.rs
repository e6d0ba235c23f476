//! Per-connection admission control.
//!
//! A token bucket (`governor`) decides whether a request runs now. Requests
//! are also counted per window; a connection that keeps hammering past the
//! disconnect threshold is closed.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::time::Instant;

use crate::config::RateLimitPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Over the bucket; reply with an error and keep the connection.
    Limited,
    /// Over the hard threshold; close the connection.
    Disconnect,
}

pub struct AdmissionControl {
    limiter: Option<DefaultDirectRateLimiter>,
    window: Duration,
    window_start: Instant,
    seen: u32,
    disconnect_after: u32,
}

impl AdmissionControl {
    pub fn new(policy: &RateLimitPolicy) -> Self {
        let points = NonZeroU32::new(policy.points).unwrap_or(NonZeroU32::MIN);
        let window = Duration::from_secs(policy.duration_secs.max(1));
        let limiter = policy
            .enabled
            .then(|| Quota::with_period(window / points.get()))
            .flatten()
            .map(|quota| RateLimiter::direct(quota.allow_burst(points)));
        Self {
            limiter,
            window,
            window_start: Instant::now(),
            seen: 0,
            disconnect_after: policy.disconnect_points.max(policy.points),
        }
    }

    /// Admission without any limits.
    pub fn unlimited() -> Self {
        Self::new(&RateLimitPolicy {
            enabled: false,
            ..Default::default()
        })
    }

    pub fn admit(&mut self) -> Admission {
        let Some(limiter) = &self.limiter else {
            return Admission::Allowed;
        };

        let now = Instant::now();
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.seen = 0;
        }
        self.seen = self.seen.saturating_add(1);
        if self.seen > self.disconnect_after {
            return Admission::Disconnect;
        }

        match limiter.check() {
            Ok(()) => Admission::Allowed,
            Err(_) => Admission::Limited,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(points: u32, disconnect_points: u32) -> RateLimitPolicy {
        RateLimitPolicy {
            enabled: true,
            points,
            duration_secs: 60,
            disconnect_points,
        }
    }

    #[test]
    fn burst_then_limited() {
        let mut control = AdmissionControl::new(&policy(3, 100));
        assert_eq!(control.admit(), Admission::Allowed);
        assert_eq!(control.admit(), Admission::Allowed);
        assert_eq!(control.admit(), Admission::Allowed);
        assert_eq!(control.admit(), Admission::Limited);
    }

    #[test]
    fn hammering_disconnects() {
        let mut control = AdmissionControl::new(&policy(2, 5));
        let outcomes: Vec<Admission> = (0..6).map(|_| control.admit()).collect();
        assert_eq!(outcomes[5], Admission::Disconnect);
        assert!(outcomes[..5].iter().all(|a| *a != Admission::Disconnect));
    }

    #[test]
    fn disabled_admits_everything() {
        let mut control = AdmissionControl::unlimited();
        assert!((0..1000).all(|_| control.admit() == Admission::Allowed));
    }
}
