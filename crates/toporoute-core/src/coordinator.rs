//! Topic coordinator
//!
//! Wires the registry watch, leader election, balance cache, assignment
//! publisher/watcher and gossip ownership state of one node. Membership changes
//! flow through a single async path, so at most one publish is in flight.

use std::{
    collections::BTreeSet,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use metrics::counter;
use parking_lot::{Mutex, RwLock};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use toporoute_common::{
    Result, ServiceDescriptor, ToporouteError, canonical_services, metrics::LEADER_CHANGES,
};
use toporoute_gossip::{
    GossipTransport, Member, MemoryGossipNetwork, TopicOp, TopicSnapshot, TopicState,
};
use toporoute_store::CoordinationStore;

use crate::{
    assignment::{Assignment, AssignmentPublisher, AssignmentView, spawn_assignment_watch},
    balancer::{ConsistentHashBalancer, ServiceBalancer},
    cache::BalanceCache,
    election::elect_leader,
    model::CoordinatorConfig,
    registry::ServiceRegistry,
};

/// Upper bound for store cleanup during shutdown or demotion
const RELEASE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct TopicCoordinator {
    config: CoordinatorConfig,
    registry: ServiceRegistry,
    publisher: AssignmentPublisher,
    cache: BalanceCache,
    view: Arc<AssignmentView>,
    store: Arc<dyn CoordinationStore>,
    topic_state: Arc<TopicState>,
    gossip: Arc<dyn GossipTransport>,
    topics: RwLock<Vec<String>>,
    /// Last peer list seen, canonical form
    peers: tokio::sync::Mutex<Option<Vec<ServiceDescriptor>>>,
    leader: RwLock<Option<String>>,
    is_leader: AtomicBool,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TopicCoordinator {
    /// Build a coordinator around an existing gossip node bound to `topic_state`
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn CoordinationStore>,
        topic_state: Arc<TopicState>,
        gossip: Arc<dyn GossipTransport>,
        balancer: Arc<dyn ServiceBalancer>,
    ) -> Result<Arc<Self>> {
        let config = config.validate()?;
        if topic_state.local_id() != config.service.id {
            return Err(ToporouteError::Config(format!(
                "gossip state belongs to {}, not {}",
                topic_state.local_id(),
                config.service.id
            )));
        }

        let registry = ServiceRegistry::new(
            store.clone(),
            config.registry_prefix(),
            config.lease_ttl,
        );
        let publisher = AssignmentPublisher::new(
            store.clone(),
            config.assignment_paths(),
            config.lease_ttl,
            config.topic_per_key,
        );
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            topics: RwLock::new(config.topics.clone()),
            registry,
            publisher,
            cache: BalanceCache::new(balancer),
            view: Arc::new(AssignmentView::new()),
            store,
            topic_state,
            gossip,
            peers: tokio::sync::Mutex::new(None),
            leader: RwLock::new(None),
            is_leader: AtomicBool::new(false),
            running: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            config,
        }))
    }

    /// Build a coordinator with its own gossip node on an in-process network
    /// and a consistent hash default balancer
    pub fn on_memory_network(
        config: CoordinatorConfig,
        store: Arc<dyn CoordinationStore>,
        network: &MemoryGossipNetwork,
    ) -> Result<Arc<Self>> {
        let config = config.validate()?;
        let topic_state = Arc::new(TopicState::new(config.service.id.clone(), &config.gossip));
        let node = network.create_node(
            config.service.id.clone(),
            config.gossip_address(),
            topic_state.clone(),
            topic_state.clone(),
        )?;
        Self::new(
            config,
            store,
            topic_state,
            Arc::new(node),
            Arc::new(ConsistentHashBalancer::new()),
        )
    }

    /// Register, start watching the registry and the assignment path
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let service = &self.config.service;
        info!(service = %service, registry = %self.registry.prefix(), "Starting topic coordinator");

        // Configured topics are served by every node; seed them without broadcasting
        let topics = self.topics();
        if !topics.is_empty() {
            self.topic_state
                .update_topics(TopicOp::Add, &topics, false)?;
        }

        let assignment_task = spawn_assignment_watch(
            self.store.clone(),
            self.config.assignment_paths(),
            self.view.clone(),
            self.shutdown_tx.subscribe(),
        )
        .await?;
        self.tasks.lock().push(assignment_task);

        let mut peers = self.registry.watch().await?;
        self.registry.register(service).await?;

        let this = Arc::downgrade(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let registry_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    update = peers.next() => {
                        let Some(services) = update else {
                            warn!("Registry watch closed");
                            break;
                        };
                        let Some(coordinator) = this.upgrade() else { break };
                        match coordinator.on_services_changed(services).await {
                            Ok(_) => {}
                            Err(ToporouteError::Shutdown(_)) => break,
                            Err(e) if e.is_leadership_ambiguity() => {
                                warn!(
                                    error = %e,
                                    "Leader election undecided, keeping previous state"
                                );
                            }
                            Err(e) => error!(error = %e, "Failed to apply membership change"),
                        }
                    }
                }
            }
            debug!("Registry watch task stopped");
        });
        self.tasks.lock().push(registry_task);

        if let Some(interval) = self.config.state_dump_interval {
            let task = self.spawn_state_dump(interval);
            self.tasks.lock().push(task);
        }
        Ok(())
    }

    /// React to a new peer list.
    ///
    /// Returns false when the list is unchanged. Election ambiguity leaves
    /// leadership and published state as they were.
    pub async fn on_services_changed(&self, services: Vec<ServiceDescriptor>) -> Result<bool> {
        let canonical = canonical_services(&services);
        let mut last = self.peers.lock().await;
        if last.as_ref() == Some(&canonical) {
            debug!(peers = canonical.len(), "Peer list unchanged");
            return Ok(false);
        }
        *last = Some(canonical.clone());

        info!(
            peers = ?canonical.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            "Peer list changed"
        );
        let leader_id = elect_leader(&canonical)?.id.clone();

        self.cache.update_services(&canonical);

        let previous = self.leader.write().replace(leader_id.clone());
        if previous.as_deref() != Some(leader_id.as_str()) {
            counter!(LEADER_CHANGES).increment(1);
            info!(leader = %leader_id, previous = ?previous, "Leader elected");
        }

        let now_leader = leader_id == self.config.service.id;
        let was_leader = self.is_leader.swap(now_leader, Ordering::SeqCst);

        if now_leader {
            let published = self.publish_assignment().await;
            if let Err(e) = self.join_gossip_peers(&canonical).await {
                warn!(error = %e, "Gossip join failed, continuing without overlay");
            }
            if let Err(e) = published {
                // Forget the list so a redelivery retries the publish
                *last = None;
                return Err(e);
            }
        } else if was_leader {
            info!(leader = %leader_id, "Demoted, releasing assignment lease");
            self.release_assignment().await;
        }
        Ok(true)
    }

    /// Balance every configured topic and publish the result
    pub async fn publish_assignment(&self) -> Result<Assignment> {
        let mut assignment = Assignment::new();
        for topic in self.topics() {
            let services: Vec<String> = self
                .cache
                .get_service_by_topic(&topic)
                .into_iter()
                .map(|s| s.id)
                .collect();
            if services.is_empty() {
                debug!(topic = %topic, "No service for topic");
                continue;
            }
            assignment.insert(topic, services);
        }

        self.publisher.publish(&assignment).await?;
        Ok(assignment)
    }

    /// Join every peer advertising a gossip address, excluding self
    pub async fn join_gossip_peers(&self, services: &[ServiceDescriptor]) -> Result<usize> {
        let peers: Vec<String> = services
            .iter()
            .filter(|s| s.id != self.config.service.id)
            .filter_map(ServiceDescriptor::gossip_address)
            .collect();
        if peers.is_empty() {
            return Ok(0);
        }

        let joined = self.gossip.join(&peers).await?;
        info!(joined, members = self.gossip.num_members(), "Joined gossip peers");
        Ok(joined)
    }

    async fn release_assignment(&self) {
        match tokio::time::timeout(RELEASE_TIMEOUT, self.publisher.release()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to release assignment lease"),
            Err(_) => warn!("Timed out releasing assignment lease"),
        }
    }

    /// Replace the configured topics and republish when leading.
    ///
    /// Runs under the membership lock so a concurrent demotion cannot slip
    /// between the leadership check and the publish.
    pub async fn update_topics(&self, topics: Vec<String>) -> Result<()> {
        let _membership = self.peers.lock().await;
        *self.topics.write() = topics;
        if self.is_leader() {
            self.publish_assignment().await?;
        }
        Ok(())
    }

    /// Claim topics served by this node and gossip the claim
    pub fn claim_topics(&self, topics: &[String]) -> Result<()> {
        self.topic_state.add_topics(topics)
    }

    /// Release topics served by this node and gossip the release
    pub fn release_topics(&self, topics: &[String]) -> Result<()> {
        self.topic_state.del_topics(topics)
    }

    /// Stop watches, revoke the assignment lease, deregister and leave the overlay
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!(service = %self.config.service, "Stopping topic coordinator");
        let _ = self.shutdown_tx.send(true);

        match tokio::time::timeout(RELEASE_TIMEOUT, self.publisher.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to release assignment lease"),
            Err(_) => warn!("Timed out releasing assignment lease"),
        }
        self.is_leader.store(false, Ordering::SeqCst);

        match tokio::time::timeout(RELEASE_TIMEOUT, self.registry.deregister()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to deregister service"),
            Err(_) => warn!("Timed out deregistering service"),
        }
        if let Err(e) = self.gossip.leave().await {
            warn!(error = %e, "Failed to leave gossip overlay");
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        Ok(())
    }

    fn spawn_state_dump(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let this = Arc::downgrade(self);
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let Some(coordinator) = this.upgrade() else { break };
                        coordinator.log_state();
                    }
                }
            }
        })
    }

    /// Log members, local topics and global topics
    pub fn log_state(&self) {
        let members: Vec<String> = self.members().iter().map(Member::to_string).collect();
        info!(
            service = %self.config.service,
            leader = ?self.leader_id(),
            members = ?members,
            local_topics = ?self.topic_state.local_topics(),
            global_topics = ?self.topic_state.global_topics(),
            "Topic coordinator state"
        );
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn service(&self) -> &ServiceDescriptor {
        &self.config.service
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn topics(&self) -> Vec<String> {
        self.topics.read().clone()
    }

    /// Leader-side balance recommendation for a topic
    pub fn services_for_topic(&self, topic: &str) -> Vec<ServiceDescriptor> {
        self.cache.get_service_by_topic(topic)
    }

    pub fn balance_cache(&self) -> &BalanceCache {
        &self.cache
    }

    /// Service ids of a topic in the published assignment
    pub fn assigned_services(&self, topic: &str) -> Vec<String> {
        self.view.services(topic)
    }

    pub fn assignments(&self) -> Assignment {
        self.view.snapshot()
    }

    /// Service ids currently claiming a topic through gossip
    pub fn live_owners(&self, topic: &str) -> BTreeSet<String> {
        self.topic_state.owners(topic)
    }

    pub fn global_topics(&self) -> TopicSnapshot {
        self.topic_state.global_topics()
    }

    pub fn topic_state(&self) -> &Arc<TopicState> {
        &self.topic_state
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn leader_id(&self) -> Option<String> {
        self.leader.read().clone()
    }

    pub fn members(&self) -> Vec<Member> {
        self.gossip.members()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toporoute_common::GossipConf;
    use toporoute_gossip::GossipSettings;
    use toporoute_store::MemoryStore;

    fn config(id: &str, port: u16) -> CoordinatorConfig {
        let service = ServiceDescriptor::new("topic_service", id)
            .with_weight(10)
            .with_gossip(GossipConf::new("127.0.0.1", port));
        CoordinatorConfig::new(service, "services")
            .with_topics(vec!["orders".to_string(), "users".to_string()])
            .with_state_dump_interval(None)
    }

    fn peers(ids: &[&str]) -> Vec<ServiceDescriptor> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| {
                ServiceDescriptor::new("topic_service", *id)
                    .with_weight(10)
                    .with_gossip(GossipConf::new("127.0.0.1", 7100 + i as u16))
            })
            .collect()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let store = Arc::new(MemoryStore::new());
        let network = MemoryGossipNetwork::new(GossipSettings::default());
        let bad = CoordinatorConfig::new(ServiceDescriptor::new("svc", ""), "services");
        assert!(matches!(
            TopicCoordinator::on_memory_network(bad, store, &network),
            Err(ToporouteError::Config(_))
        ));
    }

    #[test]
    fn test_new_rejects_foreign_gossip_state() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let network = MemoryGossipNetwork::new(GossipSettings::default());
        let state = Arc::new(TopicState::new("other", &GossipSettings::default()));
        let node = network
            .create_node("other", "127.0.0.1:7999", state.clone(), state.clone())
            .unwrap();

        let result = TopicCoordinator::new(
            config("1", 7001),
            store,
            state,
            Arc::new(node),
            Arc::new(ConsistentHashBalancer::new()),
        );
        assert!(matches!(result, Err(ToporouteError::Config(_))));
    }

    #[tokio::test]
    async fn test_leader_publishes_assignment() {
        let store = Arc::new(MemoryStore::new());
        let network = MemoryGossipNetwork::new(GossipSettings::default());
        let coordinator =
            TopicCoordinator::on_memory_network(config("a", 7100), store.clone(), &network)
                .unwrap();

        assert!(coordinator.on_services_changed(peers(&["a", "b"])).await.unwrap());
        assert!(coordinator.is_leader());
        assert_eq!(coordinator.leader_id().as_deref(), Some("a"));

        let published = store.get("/ns/as/topics/all").await.unwrap().unwrap();
        assert!(published.value.contains("orders:"));
        assert!(published.value.contains("users:"));
        assert_eq!(coordinator.services_for_topic("orders").len(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_peer_list_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let network = MemoryGossipNetwork::new(GossipSettings::default());
        let coordinator =
            TopicCoordinator::on_memory_network(config("a", 7100), store.clone(), &network)
                .unwrap();

        assert!(coordinator.on_services_changed(peers(&["a", "b"])).await.unwrap());
        let mut reordered = peers(&["a", "b"]);
        reordered.reverse();
        assert!(!coordinator.on_services_changed(reordered).await.unwrap());
    }

    #[tokio::test]
    async fn test_follower_does_not_publish() {
        let store = Arc::new(MemoryStore::new());
        let network = MemoryGossipNetwork::new(GossipSettings::default());
        let coordinator =
            TopicCoordinator::on_memory_network(config("b", 7101), store.clone(), &network)
                .unwrap();

        coordinator.on_services_changed(peers(&["a", "b"])).await.unwrap();
        assert!(!coordinator.is_leader());
        assert_eq!(coordinator.leader_id().as_deref(), Some("a"));
        assert!(store.get("/ns/as/topics/all").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conflicting_claims_keep_previous_state() {
        let store = Arc::new(MemoryStore::new());
        let network = MemoryGossipNetwork::new(GossipSettings::default());
        let coordinator =
            TopicCoordinator::on_memory_network(config("a", 7100), store.clone(), &network)
                .unwrap();
        coordinator.on_services_changed(peers(&["a", "b"])).await.unwrap();

        let mut conflicting = peers(&["a", "b", "c"]);
        conflicting[1].is_leader = true;
        conflicting[2].is_leader = true;
        let err = coordinator.on_services_changed(conflicting).await.unwrap_err();
        assert!(matches!(err, ToporouteError::ConflictingLeaders(_)));

        assert!(coordinator.is_leader());
        assert_eq!(coordinator.balance_cache().services().len(), 2);
        assert!(store.get("/ns/as/topics/all").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_empty_peer_list_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        let network = MemoryGossipNetwork::new(GossipSettings::default());
        let coordinator =
            TopicCoordinator::on_memory_network(config("a", 7100), store.clone(), &network)
                .unwrap();

        let err = coordinator.on_services_changed(Vec::new()).await.unwrap_err();
        assert_eq!(err, ToporouteError::NoPeers);
        assert!(coordinator.leader_id().is_none());
    }

    #[tokio::test]
    async fn test_demotion_releases_lease() {
        let store = Arc::new(MemoryStore::new());
        let network = MemoryGossipNetwork::new(GossipSettings::default());
        let coordinator =
            TopicCoordinator::on_memory_network(config("b", 7101), store.clone(), &network)
                .unwrap();

        coordinator.on_services_changed(peers(&["b", "c"])).await.unwrap();
        assert!(coordinator.is_leader());
        assert!(store.get("/ns/as/topics/all").await.unwrap().is_some());

        coordinator.on_services_changed(peers(&["a", "b", "c"])).await.unwrap();
        assert!(!coordinator.is_leader());
        assert!(store.get("/ns/as/topics/all").await.unwrap().is_none());
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_is_retried_on_redelivery() {
        let store = Arc::new(MemoryStore::new());
        let network = MemoryGossipNetwork::new(GossipSettings::default());
        let coordinator =
            TopicCoordinator::on_memory_network(config("a", 7100), store.clone(), &network)
                .unwrap();

        store.set_unavailable(true);
        let err = coordinator.on_services_changed(peers(&["a"])).await.unwrap_err();
        assert!(err.is_transient());

        store.set_unavailable(false);
        assert!(coordinator.on_services_changed(peers(&["a"])).await.unwrap());
        assert!(store.get("/ns/as/topics/all").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_update_topics_republishes() {
        let store = Arc::new(MemoryStore::new());
        let network = MemoryGossipNetwork::new(GossipSettings::default());
        let coordinator =
            TopicCoordinator::on_memory_network(config("a", 7100), store.clone(), &network)
                .unwrap();
        coordinator.on_services_changed(peers(&["a"])).await.unwrap();

        coordinator
            .update_topics(vec!["payments".to_string()])
            .await
            .unwrap();
        let published = store.get("/ns/as/topics/all").await.unwrap().unwrap();
        assert_eq!(published.value, "payments:a");
    }

    #[tokio::test]
    async fn test_update_topics_waits_for_membership_change() {
        let store = Arc::new(MemoryStore::new());
        let network = MemoryGossipNetwork::new(GossipSettings::default());
        let coordinator =
            TopicCoordinator::on_memory_network(config("a", 7100), store.clone(), &network)
                .unwrap();
        coordinator.on_services_changed(peers(&["a"])).await.unwrap();

        // A membership change is in flight and about to demote this node
        let membership = coordinator.peers.lock().await;
        let task = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.update_topics(vec!["payments".to_string()]).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        coordinator.is_leader.store(false, Ordering::SeqCst);
        coordinator.release_assignment().await;
        drop(membership);

        task.await.unwrap().unwrap();
        assert_eq!(coordinator.topics(), vec!["payments".to_string()]);
        assert!(store.get("/ns/as/topics/all").await.unwrap().is_none());
        assert_eq!(store.lease_count(), 0);
    }
}
