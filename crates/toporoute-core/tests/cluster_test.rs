//! Multi-node tests: several coordinators sharing one store and one gossip network

use std::{sync::Arc, time::Duration};

use toporoute_common::{GossipConf, ServiceDescriptor};
use toporoute_core::{CoordinatorConfig, TopicCoordinator};
use toporoute_gossip::{GossipSettings, MemoryGossipNetwork};
use toporoute_store::{CoordinationStore, MemoryStore};

const TOPICS: [&str; 4] = ["orders", "users", "payments", "audit"];

struct Cluster {
    store: Arc<MemoryStore>,
    network: MemoryGossipNetwork,
    nodes: Vec<Arc<TopicCoordinator>>,
}

fn service(id: &str, port: u16) -> ServiceDescriptor {
    ServiceDescriptor::new("topic_service", id)
        .with_weight(10)
        .with_gossip(GossipConf::new("127.0.0.1", port))
}

fn node_config(service: ServiceDescriptor) -> CoordinatorConfig {
    CoordinatorConfig::new(service, "services")
        .with_topics(TOPICS.iter().map(|t| t.to_string()).collect())
        .with_state_dump_interval(None)
}

async fn start_cluster(services: Vec<ServiceDescriptor>) -> Cluster {
    let store = Arc::new(MemoryStore::new());
    let network = MemoryGossipNetwork::new(GossipSettings::default());
    let mut nodes = Vec::new();
    for service in services {
        let node =
            TopicCoordinator::on_memory_network(node_config(service), store.clone(), &network)
                .unwrap();
        node.start().await.unwrap();
        nodes.push(node);
    }
    Cluster {
        store,
        network,
        nodes,
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn three_nodes() -> Vec<ServiceDescriptor> {
    vec![service("1", 7201), service("2", 7202), service("3", 7203)]
}

#[tokio::test]
async fn test_every_node_agrees_on_leader_and_assignment() {
    let cluster = start_cluster(three_nodes()).await;

    assert!(
        wait_for(|| cluster
            .nodes
            .iter()
            .all(|n| n.leader_id().as_deref() == Some("1")))
        .await
    );
    assert!(
        wait_for(|| cluster
            .nodes
            .iter()
            .all(|n| n.balance_cache().services().len() == 3))
        .await
    );

    let leaders: Vec<bool> = cluster.nodes.iter().map(|n| n.is_leader()).collect();
    assert_eq!(leaders, vec![true, false, false]);

    let mut expected = toporoute_core::Assignment::new();
    for topic in TOPICS {
        let owner = cluster.nodes[0].services_for_topic(topic)[0].id.clone();
        expected.insert(topic.to_string(), vec![owner]);
    }
    assert!(
        wait_for(|| cluster
            .nodes
            .iter()
            .all(|n| n.assignments() == expected))
        .await
    );
    // Followers compute the same recommendation
    for topic in TOPICS {
        assert_eq!(
            cluster.nodes[2].services_for_topic(topic),
            cluster.nodes[0].services_for_topic(topic)
        );
    }
}

#[tokio::test]
async fn test_explicit_leader_claim_wins() {
    let services = vec![
        service("1", 7211),
        service("2", 7212),
        service("3", 7213).with_leader(true),
    ];
    let cluster = start_cluster(services).await;

    assert!(
        wait_for(|| cluster
            .nodes
            .iter()
            .all(|n| n.leader_id().as_deref() == Some("3")))
        .await
    );
    assert!(cluster.nodes[2].is_leader());
}

#[tokio::test]
async fn test_leader_builds_gossip_overlay() {
    let cluster = start_cluster(three_nodes()).await;

    assert!(wait_for(|| cluster.nodes.iter().all(|n| n.members().len() == 3)).await);
    // Configured topics are seeded on every node and merged on join
    let owners = cluster.nodes[0].live_owners("orders");
    assert_eq!(owners.len(), 3);
}

#[tokio::test]
async fn test_gossip_add_and_del_reach_peers() {
    let cluster = start_cluster(three_nodes()).await;
    assert!(wait_for(|| cluster.nodes.iter().all(|n| n.members().len() == 3)).await);

    cluster.nodes[1]
        .claim_topics(&["topicX".to_string()])
        .unwrap();
    cluster.network.gossip_round();
    assert!(cluster.nodes[0].live_owners("topicX").contains("2"));
    assert!(cluster.nodes[2].live_owners("topicX").contains("2"));

    cluster.nodes[1]
        .release_topics(&["topicX".to_string()])
        .unwrap();
    cluster.network.gossip_round();
    assert!(!cluster.nodes[0].global_topics().contains_key("topicX"));
    assert!(!cluster.nodes[2].global_topics().contains_key("topicX"));
}

#[tokio::test]
async fn test_leader_shutdown_hands_over() {
    let cluster = start_cluster(three_nodes()).await;
    assert!(wait_for(|| cluster.nodes.iter().all(|n| n.assignments().len() == TOPICS.len())).await);
    assert!(wait_for(|| cluster.nodes.iter().all(|n| n.members().len() == 3)).await);

    cluster.nodes[0].stop().await.unwrap();

    let survivors = &cluster.nodes[1..];
    assert!(
        wait_for(|| survivors
            .iter()
            .all(|n| n.leader_id().as_deref() == Some("2")))
        .await
    );
    assert!(
        wait_for(|| survivors.iter().all(|n| {
            let assignment = n.assignments();
            assignment.len() == TOPICS.len()
                && assignment.values().flatten().all(|id| id != "1")
        }))
        .await
    );
    assert!(cluster.nodes[1].is_leader());

    // Only the new lease backs assignment keys
    let kvs = cluster.store.get_prefix("/ns/as/topics/").await.unwrap();
    assert_eq!(kvs.len(), 1);
    let lease = kvs[0].lease.unwrap();
    assert_eq!(cluster.store.lease_keys(lease), vec!["/ns/as/topics/all"]);
    // Two registrations plus one assignment lease
    assert_eq!(cluster.store.lease_count(), 3);

    // The departed node's gossip claims are purged
    assert!(!cluster.nodes[1].live_owners("orders").contains("1"));
    assert_eq!(cluster.nodes[1].members().len(), 2);
}

#[tokio::test]
async fn test_stop_cleans_registration() {
    let cluster = start_cluster(vec![service("1", 7221)]).await;
    assert!(wait_for(|| cluster.nodes[0].is_leader()).await);

    cluster.nodes[0].stop().await.unwrap();
    assert!(!cluster.nodes[0].is_running());
    assert!(cluster.store.keys().is_empty());
    assert_eq!(cluster.store.lease_count(), 0);
}

#[tokio::test]
async fn test_follower_registration_returns_after_lease_loss() {
    let store = Arc::new(MemoryStore::new());
    let network = MemoryGossipNetwork::new(GossipSettings::default());
    let mut nodes = Vec::new();
    for service in [service("1", 7231), service("2", 7232)] {
        let config = node_config(service).with_lease_ttl(Duration::from_millis(300));
        let node = TopicCoordinator::on_memory_network(config, store.clone(), &network).unwrap();
        node.start().await.unwrap();
        nodes.push(node);
    }
    assert!(wait_for(|| nodes.iter().all(|n| n.balance_cache().services().len() == 2)).await);

    let lost = store.get("/ns/as/services/2").await.unwrap().unwrap().lease.unwrap();
    store.revoke(lost).await.unwrap();

    let key = "/ns/as/services/2".to_string();
    assert!(wait_for(|| store.keys().contains(&key)).await);
    assert!(wait_for(|| nodes.iter().all(|n| n.balance_cache().services().len() == 2)).await);
    let renewed = store.get(&key).await.unwrap().unwrap();
    assert_ne!(renewed.lease, Some(lost));

    for node in nodes.iter().rev() {
        node.stop().await.unwrap();
    }
    assert_eq!(store.lease_count(), 0);
}
