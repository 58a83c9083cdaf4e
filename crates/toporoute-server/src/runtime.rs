//! Runs one or more coordinators against a shared in-process store and
//! gossip network

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tracing::{error, info};

use toporoute_core::{CoordinatorConfig, TopicCoordinator};
use toporoute_gossip::MemoryGossipNetwork;
use toporoute_store::MemoryStore;

const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Derive `count` node configs from one base config.
///
/// A single node keeps the base unchanged. Otherwise node `i` gets id
/// `{id}-{i}`, gossip port `port + i`, and only node 0 keeps a leader claim.
pub fn node_configs(base: &CoordinatorConfig, count: usize) -> Vec<CoordinatorConfig> {
    if count <= 1 {
        return vec![base.clone()];
    }
    (0..count)
        .map(|i| {
            let mut config = base.clone();
            config.service.id = format!("{}-{}", base.service.id, i);
            config.service.is_leader = base.service.is_leader && i == 0;
            if config.service.gossip.enabled {
                config.service.gossip.port = base.service.gossip.port.saturating_add(i as u16);
            }
            config
        })
        .collect()
}

pub struct NodeRuntime {
    store: Arc<MemoryStore>,
    network: MemoryGossipNetwork,
    rounds: JoinHandle<()>,
    nodes: Vec<Arc<TopicCoordinator>>,
}

impl NodeRuntime {
    pub async fn start(base: CoordinatorConfig, count: usize) -> anyhow::Result<Self> {
        let store = Arc::new(MemoryStore::new().with_expiry_sweeper(EXPIRY_SWEEP_INTERVAL));
        let network = MemoryGossipNetwork::new(base.gossip.clone());
        let rounds = network.spawn_rounds();

        let mut runtime = Self {
            store,
            network,
            rounds,
            nodes: Vec::new(),
        };
        for config in node_configs(&base, count) {
            let node = TopicCoordinator::on_memory_network(
                config,
                runtime.store.clone(),
                &runtime.network,
            )?;
            if let Err(e) = node.start().await {
                runtime.shutdown().await;
                return Err(e.into());
            }
            info!(service = %node.service(), "Coordinator started");
            runtime.nodes.push(node);
        }
        Ok(runtime)
    }

    pub fn nodes(&self) -> &[Arc<TopicCoordinator>] {
        &self.nodes
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Stop every coordinator, then the gossip rounds
    pub async fn shutdown(self) {
        for node in &self.nodes {
            if let Err(e) = node.stop().await {
                error!(service = %node.service(), error = %e, "Coordinator stop failed");
            }
        }
        self.rounds.abort();
        info!(nodes = self.nodes.len(), "All coordinators stopped");
    }
}

#[cfg(test)]
mod tests {
    use toporoute_common::{GossipConf, ServiceDescriptor};

    use super::*;

    fn base() -> CoordinatorConfig {
        let service = ServiceDescriptor::new("topic_service", "n")
            .with_leader(true)
            .with_gossip(GossipConf::new("127.0.0.1", 7300));
        CoordinatorConfig::new(service, "services")
            .with_topics(vec!["orders".to_string(), "users".to_string()])
            .with_state_dump_interval(None)
    }

    #[test]
    fn test_single_node_keeps_base_config() {
        let configs = node_configs(&base(), 1);
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].service.id, "n");
        assert!(configs[0].service.is_leader);
    }

    #[test]
    fn test_multiple_nodes_get_distinct_identity() {
        let configs = node_configs(&base(), 3);
        let ids: Vec<&str> = configs.iter().map(|c| c.service.id.as_str()).collect();
        assert_eq!(ids, vec!["n-0", "n-1", "n-2"]);
        let ports: Vec<u16> = configs.iter().map(|c| c.service.gossip.port).collect();
        assert_eq!(ports, vec![7300, 7301, 7302]);
        let leaders = configs.iter().filter(|c| c.service.is_leader).count();
        assert_eq!(leaders, 1);
    }

    #[tokio::test]
    async fn test_runtime_elects_and_publishes() {
        let runtime = NodeRuntime::start(base(), 2).await.unwrap();
        assert_eq!(runtime.nodes().len(), 2);

        let mut published = false;
        for _ in 0..200 {
            if runtime.nodes().iter().all(|n| n.assignments().len() == 2) {
                published = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(published);
        assert!(runtime.nodes()[0].is_leader());

        let store = runtime.store().clone();
        runtime.shutdown().await;
        assert!(store.keys().is_empty());
    }
}
