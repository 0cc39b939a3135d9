use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng as _;

use crate::command::ServiceInstance;

/// Picks one instance from the routed candidate set. Returns `None` only when
/// the set is empty.
pub trait LoadBalancer: Send + Sync + 'static {
    fn select(&self, candidates: &[ServiceInstance]) -> Option<ServiceInstance>;
}

#[derive(Default)]
pub struct RandomBalancer;

impl LoadBalancer for RandomBalancer {
    fn select(&self, candidates: &[ServiceInstance]) -> Option<ServiceInstance> {
        if candidates.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..candidates.len());
        Some(candidates[index].clone())
    }
}

/// Cycles through candidates with a shared counter. The counter is global to
/// the balancer, not per service, which is close enough to fair when one
/// balancer serves one client.
#[derive(Default)]
pub struct RoundRobinBalancer {
    next: AtomicUsize,
}

impl LoadBalancer for RoundRobinBalancer {
    fn select(&self, candidates: &[ServiceInstance]) -> Option<ServiceInstance> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[index].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{now_ms, ServiceStatus};

    fn instance(id: &str) -> ServiceInstance {
        ServiceInstance {
            service_id: id.to_string(),
            service_name: "orders".to_string(),
            host: "127.0.0.1".to_string(),
            port: 9000,
            status: ServiceStatus::Up,
            metadata: Default::default(),
            last_heartbeat_ms: now_ms(),
        }
    }

    #[test]
    fn empty_candidate_set_selects_nothing() {
        assert!(RandomBalancer.select(&[]).is_none());
        assert!(RoundRobinBalancer::default().select(&[]).is_none());
    }

    #[test]
    fn random_selection_stays_within_candidates() {
        let candidates = vec![instance("a"), instance("b")];
        let balancer = RandomBalancer;
        for _ in 0..20 {
            let picked = balancer.select(&candidates).unwrap();
            assert!(candidates.contains(&picked));
        }
    }

    #[test]
    fn round_robin_cycles_through_candidates() {
        let candidates = vec![instance("a"), instance("b"), instance("c")];
        let balancer = RoundRobinBalancer::default();

        let picks: Vec<String> = (0..6)
            .map(|_| balancer.select(&candidates).unwrap().service_id)
            .collect();
        assert_eq!(picks, ["a", "b", "c", "a", "b", "c"]);
    }
}
