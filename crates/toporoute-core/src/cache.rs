// Per-topic balance result cache
// One mutex guards the service list, the default balancer and every cached result

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, info};

use toporoute_common::{ServiceDescriptor, canonical_services};

use crate::balancer::ServiceBalancer;

/// Cached balance of one topic
#[derive(Clone)]
pub struct BalanceResult {
    pub topic: String,
    pub balancer: Arc<dyn ServiceBalancer>,
    pub service_list: Vec<ServiceDescriptor>,
}

impl std::fmt::Debug for BalanceResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BalanceResult")
            .field("topic", &self.topic)
            .field("balancer", &self.balancer.name())
            .field("service_list", &self.service_list)
            .finish()
    }
}

fn same_balancer(a: &Arc<dyn ServiceBalancer>, b: &Arc<dyn ServiceBalancer>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

struct CacheState {
    default_balancer: Arc<dyn ServiceBalancer>,
    services: Vec<ServiceDescriptor>,
    topics: HashMap<String, BalanceResult>,
}

impl CacheState {
    /// Initialize every distinct balancer in use with the current services
    fn init_balancers(&self) {
        let mut seen: Vec<Arc<dyn ServiceBalancer>> = vec![self.default_balancer.clone()];
        self.default_balancer.init(&self.services);

        for result in self.topics.values() {
            if !seen.iter().any(|b| same_balancer(b, &result.balancer)) {
                result.balancer.init(&self.services);
                seen.push(result.balancer.clone());
            }
        }
    }
}

/// Read-through cache of topic assignments
pub struct BalanceCache {
    state: Mutex<CacheState>,
}

impl BalanceCache {
    pub fn new(default_balancer: Arc<dyn ServiceBalancer>) -> Self {
        Self {
            state: Mutex::new(CacheState {
                default_balancer,
                services: Vec::new(),
                topics: HashMap::new(),
            }),
        }
    }

    /// Replace the service list and recompute every cached topic.
    ///
    /// Returns false without touching anything when the list is unchanged
    /// regardless of order.
    pub fn update_services(&self, services: &[ServiceDescriptor]) -> bool {
        let services = canonical_services(services);
        let mut state = self.state.lock();
        if state.services == services {
            debug!("Service list unchanged, keeping balance results");
            return false;
        }

        info!(
            services = ?services.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            "Balance services changed"
        );
        state.services = services;
        state.init_balancers();

        let CacheState {
            services, topics, ..
        } = &mut *state;
        for (topic, result) in topics.iter_mut() {
            result.service_list = result.balancer.balance(topic, services);
        }
        true
    }

    /// Swap the default balancer, recomputing topics that used the previous default
    pub fn update_default_balancer(&self, balancer: Arc<dyn ServiceBalancer>) {
        let mut state = self.state.lock();
        let old = std::mem::replace(&mut state.default_balancer, balancer.clone());
        balancer.init(&state.services);

        let CacheState {
            services, topics, ..
        } = &mut *state;
        let mut migrated = 0;
        for (topic, result) in topics.iter_mut() {
            if same_balancer(&result.balancer, &old) {
                result.balancer = balancer.clone();
                result.service_list = balancer.balance(topic, services);
                migrated += 1;
            }
        }
        info!(
            from = old.name(),
            to = balancer.name(),
            migrated,
            "Default balancer updated"
        );
    }

    /// Pin a topic to its own balancer; default balancer changes leave it untouched
    pub fn set_topic_balancer(
        &self,
        topic: &str,
        balancer: Arc<dyn ServiceBalancer>,
    ) -> Vec<ServiceDescriptor> {
        let mut state = self.state.lock();
        balancer.init(&state.services);
        let service_list = balancer.balance(topic, &state.services);
        info!(topic, balancer = balancer.name(), "Topic balancer set");

        state.topics.insert(
            topic.to_string(),
            BalanceResult {
                topic: topic.to_string(),
                balancer,
                service_list: service_list.clone(),
            },
        );
        service_list
    }

    /// Cached or freshly computed result for a topic
    pub fn balance_result(&self, topic: &str) -> BalanceResult {
        let mut state = self.state.lock();
        if let Some(result) = state.topics.get(topic) {
            return result.clone();
        }

        let balancer = state.default_balancer.clone();
        let result = BalanceResult {
            topic: topic.to_string(),
            service_list: balancer.balance(topic, &state.services),
            balancer,
        };
        state.topics.insert(topic.to_string(), result.clone());
        result
    }

    pub fn get_service_by_topic(&self, topic: &str) -> Vec<ServiceDescriptor> {
        self.balance_result(topic).service_list
    }

    pub fn services(&self) -> Vec<ServiceDescriptor> {
        self.state.lock().services.clone()
    }

    pub fn default_balancer(&self) -> Arc<dyn ServiceBalancer> {
        self.state.lock().default_balancer.clone()
    }

    pub fn cached_topics(&self) -> usize {
        self.state.lock().topics.len()
    }
}
