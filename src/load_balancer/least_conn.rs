//! Weighted least connections with rotating tie-break.
//!
//! Score is `active_connections / weight`; scores are compared by
//! cross-multiplication so no floating point is involved. When several
//! backends share the minimum score, a caller-supplied rotation value picks
//! among them, which degenerates to round robin when all weights and
//! counts are equal.

use std::cmp::Ordering;

use crate::load_balancer::backend::{BackendSnapshot, HealthState};

/// Compare `a.active / a.weight` with `b.active / b.weight`.
fn compare_score(a: &BackendSnapshot, b: &BackendSnapshot) -> Ordering {
    let lhs = a.active_connections as u128 * b.weight.max(1) as u128;
    let rhs = b.active_connections as u128 * a.weight.max(1) as u128;
    lhs.cmp(&rhs)
}

/// Backends the balancer may consider: HEALTHY ones, or DEGRADED ones when
/// nothing is healthy.
pub fn eligible(backends: &[BackendSnapshot]) -> Vec<&BackendSnapshot> {
    let healthy: Vec<_> = backends
        .iter()
        .filter(|b| b.state == HealthState::Healthy && !b.draining)
        .collect();
    if !healthy.is_empty() {
        return healthy;
    }
    backends
        .iter()
        .filter(|b| b.state == HealthState::Degraded && !b.draining)
        .collect()
}

/// Pick the minimum-score candidate, rotating among ties.
pub fn pick<'a>(candidates: &[&'a BackendSnapshot], rotation: usize) -> Option<&'a BackendSnapshot> {
    let best = candidates.iter().copied().min_by(|a, b| compare_score(a, b))?;
    let ties: Vec<&BackendSnapshot> = candidates
        .iter()
        .copied()
        .filter(|c| compare_score(c, best) == Ordering::Equal)
        .collect();
    Some(ties[rotation % ties.len()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::backend::{BackendId, BackendTarget};

    fn snap(id: &str, weight: u32, active: usize, state: HealthState) -> BackendSnapshot {
        BackendSnapshot {
            id: BackendId::from(id),
            pool: "api".into(),
            target: BackendTarget::parse("127.0.0.1:1").unwrap(),
            weight,
            state,
            consecutive_failures: 0,
            active_connections: active,
            draining: false,
        }
    }

    #[test]
    fn test_least_conn() {
        let backends = vec![
            snap("a", 1, 1, HealthState::Healthy),
            snap("b", 1, 0, HealthState::Healthy),
        ];
        let candidates = eligible(&backends);
        assert_eq!(pick(&candidates, 0).unwrap().id.as_str(), "b");
        assert_eq!(pick(&candidates, 1).unwrap().id.as_str(), "b");
    }

    #[test]
    fn weight_scales_score() {
        // a: 3/3 = 1, b: 2/1 = 2
        let backends = vec![
            snap("a", 3, 3, HealthState::Healthy),
            snap("b", 1, 2, HealthState::Healthy),
        ];
        assert_eq!(pick(&eligible(&backends), 0).unwrap().id.as_str(), "a");
    }

    #[test]
    fn ties_rotate() {
        let backends = vec![
            snap("a", 1, 0, HealthState::Healthy),
            snap("b", 1, 0, HealthState::Healthy),
            snap("c", 1, 4, HealthState::Healthy),
        ];
        let candidates = eligible(&backends);
        let picks: Vec<_> = (0..4).map(|r| pick(&candidates, r).unwrap().id.as_str().to_string()).collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn degraded_only_without_healthy() {
        let backends = vec![
            snap("a", 1, 9, HealthState::Healthy),
            snap("b", 1, 0, HealthState::Degraded),
        ];
        assert_eq!(pick(&eligible(&backends), 0).unwrap().id.as_str(), "a");

        let backends = vec![
            snap("a", 1, 0, HealthState::Unhealthy),
            snap("b", 1, 0, HealthState::Degraded),
            snap("c", 1, 0, HealthState::Unknown),
        ];
        let candidates = eligible(&backends);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id.as_str(), "b");
    }

    #[test]
    fn nothing_eligible() {
        let backends = vec![snap("a", 1, 0, HealthState::Unhealthy)];
        assert!(pick(&eligible(&backends), 0).is_none());
    }
}
