// Pluggable topic balancing strategies

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tracing::{debug, info};

use toporoute_common::{DEFAULT_REPLICAS, ServiceDescriptor};

use crate::ring::HashRing;

/// Assignment strategy mapping a topic onto an ordered candidate list
pub trait ServiceBalancer: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Reconcile internal state to exactly this service set
    fn init(&self, services: &[ServiceDescriptor]);

    /// Ordered candidates for a topic, index 0 is the primary
    fn balance(&self, topic: &str, services: &[ServiceDescriptor]) -> Vec<ServiceDescriptor>;
}

struct RingState {
    ring: HashRing,
    services: HashMap<String, ServiceDescriptor>,
}

/// Consistent hashing over service ids, weight = virtual replica count
pub struct ConsistentHashBalancer {
    state: RwLock<RingState>,
    candidates: usize,
}

impl ConsistentHashBalancer {
    pub const NAME: &'static str = "consistent_hash";

    pub fn new() -> Self {
        Self::with_candidates(1)
    }

    /// Return up to `candidates` distinct services per topic
    pub fn with_candidates(candidates: usize) -> Self {
        Self {
            state: RwLock::new(RingState {
                ring: HashRing::new(),
                services: HashMap::new(),
            }),
            candidates: candidates.max(1),
        }
    }

    /// Service ids currently on the ring
    pub fn nodes(&self) -> Vec<String> {
        self.state.read().ring.nodes()
    }

    fn replicas(service: &ServiceDescriptor) -> usize {
        if service.weight > 0 {
            service.weight as usize
        } else {
            DEFAULT_REPLICAS
        }
    }
}

impl Default for ConsistentHashBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceBalancer for ConsistentHashBalancer {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "consistent hash balance alg"
    }

    fn init(&self, services: &[ServiceDescriptor]) {
        let mut state = self.state.write();
        let before = state.ring.nodes();

        let mut stale: HashSet<String> = before.iter().cloned().collect();
        for service in services {
            state.ring.add(&service.id, Self::replicas(service));
            state.services.insert(service.id.clone(), service.clone());
            stale.remove(&service.id);
        }
        for id in &stale {
            state.ring.remove(id);
            state.services.remove(id);
        }

        info!(
            before = ?before,
            removed = ?stale,
            after = ?state.ring.nodes(),
            "Consistent hash ring reconciled"
        );
    }

    fn balance(&self, topic: &str, services: &[ServiceDescriptor]) -> Vec<ServiceDescriptor> {
        let state = self.state.read();
        let ids = state.ring.get_n(topic, self.candidates);

        let result: Vec<ServiceDescriptor> = ids
            .iter()
            .filter_map(|id| {
                services
                    .iter()
                    .find(|s| &s.id == id)
                    .or_else(|| state.services.get(id))
                    .cloned()
            })
            .collect();
        debug!(topic, services = ?ids, "Balanced topic");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn services(ids: &[&str]) -> Vec<ServiceDescriptor> {
        ids.iter()
            .map(|id| ServiceDescriptor::new("topic_service", *id).with_weight(10))
            .collect()
    }

    #[test]
    fn test_empty_balancer_returns_nothing() {
        let balancer = ConsistentHashBalancer::new();
        assert!(balancer.balance("topic", &[]).is_empty());
    }

    #[test]
    fn test_init_reconciles_node_set() {
        let balancer = ConsistentHashBalancer::new();
        balancer.init(&services(&["1", "2", "3"]));
        assert_eq!(balancer.nodes(), vec!["1", "2", "3"]);

        balancer.init(&services(&["2", "3", "4"]));
        assert_eq!(balancer.nodes(), vec!["2", "3", "4"]);
    }

    #[test]
    fn test_init_is_stable_for_unchanged_nodes() {
        let list = services(&["1", "2", "3"]);
        let topics: Vec<String> = (0..50).map(|i| format!("topic-{}", i)).collect();

        let balancer = ConsistentHashBalancer::new();
        balancer.init(&list);
        let before: Vec<String> = topics
            .iter()
            .map(|t| balancer.balance(t, &list)[0].id.clone())
            .collect();

        let grown = services(&["1", "2", "3", "4"]);
        balancer.init(&grown);
        for (topic, owner) in topics.iter().zip(&before) {
            let now = &balancer.balance(topic, &grown)[0].id;
            assert!(now == owner || now == "4");
        }
    }

    #[test]
    fn test_zero_weight_uses_default_replicas() {
        let balancer = ConsistentHashBalancer::new();
        balancer.init(&[ServiceDescriptor::new("svc", "1")]);
        assert_eq!(
            balancer.state.read().ring.replicas("1"),
            Some(DEFAULT_REPLICAS)
        );
    }

    #[test]
    fn test_multiple_candidates() {
        let list = services(&["1", "2", "3"]);
        let balancer = ConsistentHashBalancer::with_candidates(2);
        balancer.init(&list);

        let picked = balancer.balance("orders", &list);
        assert_eq!(picked.len(), 2);
        assert_ne!(picked[0].id, picked[1].id);
    }

    #[test]
    fn test_balance_prefers_caller_descriptor() {
        let balancer = ConsistentHashBalancer::new();
        balancer.init(&services(&["1"]));

        let updated = vec![
            ServiceDescriptor::new("topic_service", "1")
                .with_weight(10)
                .with_metadata("zone", "b"),
        ];
        let picked = balancer.balance("t", &updated);
        assert_eq!(picked[0].metadata.get("zone").map(String::as_str), Some("b"));
    }
}
