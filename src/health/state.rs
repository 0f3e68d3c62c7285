//! Backend health state machine.
//!
//! # States
//! - Unknown: registered, never probed; not selectable
//! - Healthy: receives traffic
//! - Degraded: still selectable, only when no Healthy backend exists
//! - Unhealthy: excluded from load balancing
//!
//! # State Transitions
//! ```text
//! Unknown   → Healthy:   successful probe
//! Healthy   → Degraded:  consecutive failures >= soft threshold
//! *         → Unhealthy: consecutive failures >= hard threshold
//! Degraded  → Healthy:   any success
//! Unhealthy → Healthy:   successful probe (never traffic alone)
//! ```

use crate::config::HealthCheckConfig;
use crate::load_balancer::HealthState;

/// Who observed an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportSource {
    /// The active health prober.
    Probe,
    /// Live traffic through the connection pool.
    Traffic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Failure counts that drive degradation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    pub soft: u32,
    pub hard: u32,
}

impl HealthThresholds {
    pub fn new(soft: u32, hard: u32) -> Self {
        let hard = hard.max(1);
        Self {
            soft: soft.clamp(1, hard),
            hard,
        }
    }
}

impl From<&HealthCheckConfig> for HealthThresholds {
    fn from(config: &HealthCheckConfig) -> Self {
        Self::new(config.soft_failure_threshold, config.hard_failure_threshold)
    }
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self::new(1, 3)
    }
}

/// Apply one outcome to `(state, consecutive_failures)`.
pub fn transition(
    state: HealthState,
    failures: u32,
    outcome: Outcome,
    source: ReportSource,
    thresholds: HealthThresholds,
) -> (HealthState, u32) {
    match outcome {
        Outcome::Success => {
            let next = match (state, source) {
                (HealthState::Unknown | HealthState::Unhealthy, ReportSource::Traffic) => state,
                _ => HealthState::Healthy,
            };
            (next, 0)
        }
        Outcome::Failure => {
            let failures = failures.saturating_add(1);
            let next = if failures >= thresholds.hard {
                HealthState::Unhealthy
            } else if failures >= thresholds.soft && state == HealthState::Healthy {
                HealthState::Degraded
            } else {
                state
            };
            (next, failures)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: HealthThresholds = HealthThresholds { soft: 2, hard: 3 };

    fn fail(state: HealthState, n: u32) -> (HealthState, u32) {
        transition(state, n, Outcome::Failure, ReportSource::Probe, T)
    }

    #[test]
    fn degrades_then_fails() {
        let (s, n) = fail(HealthState::Healthy, 0);
        assert_eq!((s, n), (HealthState::Healthy, 1));
        let (s, n) = fail(s, n);
        assert_eq!((s, n), (HealthState::Degraded, 2));
        let (s, n) = fail(s, n);
        assert_eq!((s, n), (HealthState::Unhealthy, 3));
    }

    #[test]
    fn unknown_needs_probe() {
        let traffic = transition(HealthState::Unknown, 0, Outcome::Success, ReportSource::Traffic, T);
        assert_eq!(traffic.0, HealthState::Unknown);
        let probe = transition(HealthState::Unknown, 0, Outcome::Success, ReportSource::Probe, T);
        assert_eq!(probe.0, HealthState::Healthy);
    }

    #[test]
    fn unhealthy_ignores_traffic_success() {
        let (s, n) = transition(HealthState::Unhealthy, 5, Outcome::Success, ReportSource::Traffic, T);
        assert_eq!(s, HealthState::Unhealthy);
        assert_eq!(n, 0);
        let (s, _) = transition(s, n, Outcome::Success, ReportSource::Probe, T);
        assert_eq!(s, HealthState::Healthy);
    }

    #[test]
    fn degraded_recovers_on_traffic() {
        let (s, n) = transition(HealthState::Degraded, 2, Outcome::Success, ReportSource::Traffic, T);
        assert_eq!((s, n), (HealthState::Healthy, 0));
    }

    #[test]
    fn unknown_goes_straight_to_unhealthy() {
        let (s, n) = fail(HealthState::Unknown, 2);
        assert_eq!((s, n), (HealthState::Unhealthy, 3));
    }

    #[test]
    fn thresholds_are_ordered() {
        let t = HealthThresholds::new(5, 3);
        assert_eq!((t.soft, t.hard), (3, 3));
    }
}
