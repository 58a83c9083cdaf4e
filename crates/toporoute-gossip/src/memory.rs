// In-process gossip overlay
// Nodes live in one shared table keyed by address.
// Rounds are driven explicitly or by a spawned ticker

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use toporoute_common::{Result, ToporouteError};

use crate::{
    state::GossipSettings,
    traits::{EventDelegate, GossipDelegate, GossipTransport, Member},
};

const META_MAX_SIZE: usize = 512;

struct NodeHandle {
    member: Member,
    delegate: Arc<dyn GossipDelegate>,
    events: Arc<dyn EventDelegate>,
    /// Known peers by name, excluding the node itself
    peers: RwLock<BTreeMap<String, Member>>,
    alive: AtomicBool,
}

impl NodeHandle {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn learn(&self, member: &Member) {
        if member.name == self.member.name {
            return;
        }
        let inserted = self
            .peers
            .write()
            .insert(member.name.clone(), member.clone())
            .is_none();
        if inserted {
            self.events.notify_join(member);
        }
    }

    fn forget(&self, member: &Member) {
        if self.peers.write().remove(&member.name).is_some() {
            self.events.notify_leave(member);
        }
    }

    fn peer_members(&self) -> Vec<Member> {
        self.peers.read().values().cloned().collect()
    }
}

struct NetworkInner {
    nodes: DashMap<String, Arc<NodeHandle>>,
    settings: GossipSettings,
}

impl NetworkInner {
    fn node(&self, addr: &str) -> Option<Arc<NodeHandle>> {
        self.nodes
            .get(addr)
            .map(|entry| entry.value().clone())
            .filter(|node| node.is_alive())
    }

    fn alive_nodes(&self) -> Vec<Arc<NodeHandle>> {
        self.nodes
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|node| node.is_alive())
            .collect()
    }

    fn gossip_round(&self) -> usize {
        let mut delivered = 0;
        for node in self.alive_nodes() {
            let msgs = node
                .delegate
                .get_broadcasts(self.settings.message_overhead, self.settings.packet_limit);
            if msgs.is_empty() {
                continue;
            }
            for peer in node.peer_members() {
                let Some(target) = self.node(&peer.addr) else {
                    continue;
                };
                for msg in &msgs {
                    target.delegate.notify_msg(msg);
                    delivered += 1;
                }
            }
        }
        delivered
    }

    fn push_pull_round(&self) {
        for node in self.alive_nodes() {
            for peer in node.peer_members() {
                if let Some(target) = self.node(&peer.addr) {
                    target
                        .delegate
                        .merge_remote_state(&node.delegate.local_state(false), false);
                    node.delegate
                        .merge_remote_state(&target.delegate.local_state(false), false);
                }
            }
        }
    }

    fn remove_node(&self, addr: &str) -> Option<Arc<NodeHandle>> {
        let (_, node) = self.nodes.remove(addr)?;
        node.alive.store(false, Ordering::SeqCst);
        for peer in node.peer_members() {
            if let Some(target) = self.node(&peer.addr) {
                target.forget(&node.member);
            }
        }
        Some(node)
    }
}

/// Shared in-process overlay
#[derive(Clone)]
pub struct MemoryGossipNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryGossipNetwork {
    pub fn new(settings: GossipSettings) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                nodes: DashMap::new(),
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &GossipSettings {
        &self.inner.settings
    }

    /// Bind a node to `addr`
    pub fn create_node(
        &self,
        name: impl Into<String>,
        addr: impl Into<String>,
        delegate: Arc<dyn GossipDelegate>,
        events: Arc<dyn EventDelegate>,
    ) -> Result<MemoryGossipNode> {
        let addr = addr.into();
        if self.inner.node(&addr).is_some() {
            return Err(ToporouteError::GossipJoin(format!(
                "address {} already bound",
                addr
            )));
        }

        let mut member = Member::new(name, addr.clone());
        member.meta = delegate.node_meta(META_MAX_SIZE);
        member.meta.truncate(META_MAX_SIZE);

        let handle = Arc::new(NodeHandle {
            member: member.clone(),
            delegate,
            events,
            peers: RwLock::new(BTreeMap::new()),
            alive: AtomicBool::new(true),
        });
        self.inner.nodes.insert(addr, handle.clone());
        info!(member = %member, "Gossip node created");

        Ok(MemoryGossipNode {
            network: Arc::downgrade(&self.inner),
            handle,
        })
    }

    /// Deliver pending broadcasts of every node to its peers, returning delivered message count
    pub fn gossip_round(&self) -> usize {
        self.inner.gossip_round()
    }

    /// Exchange full state between every pair of connected nodes
    pub fn push_pull_round(&self) {
        self.inner.push_pull_round();
    }

    /// Remove a node without a graceful leave, as failure detection would
    pub fn fail_node(&self, addr: &str) -> bool {
        match self.inner.remove_node(addr) {
            Some(node) => {
                warn!(member = %node.member, "Gossip node marked dead");
                true
            }
            None => false,
        }
    }

    pub fn node_count(&self) -> usize {
        self.inner.alive_nodes().len()
    }

    /// Drive gossip and push/pull rounds on the configured intervals
    pub fn spawn_rounds(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let gossip_interval = self.inner.settings.gossip_interval;
        let push_pull_interval = self.inner.settings.push_pull_interval;

        tokio::spawn(async move {
            let mut gossip_ticker = tokio::time::interval(gossip_interval);
            let mut push_pull_ticker = tokio::time::interval(push_pull_interval);
            loop {
                tokio::select! {
                    _ = gossip_ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.gossip_round();
                    }
                    _ = push_pull_ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.push_pull_round();
                    }
                }
            }
            debug!("Gossip round task stopped");
        })
    }
}

/// A local node bound to a `MemoryGossipNetwork`
pub struct MemoryGossipNode {
    network: Weak<NetworkInner>,
    handle: Arc<NodeHandle>,
}

impl MemoryGossipNode {
    fn network(&self) -> Result<Arc<NetworkInner>> {
        self.network
            .upgrade()
            .ok_or_else(|| ToporouteError::Shutdown("gossip network".to_string()))
    }
}

#[async_trait]
impl GossipTransport for MemoryGossipNode {
    async fn join(&self, peers: &[String]) -> Result<usize> {
        let network = self.network()?;
        if !self.handle.is_alive() {
            return Err(ToporouteError::Shutdown(format!(
                "gossip node {}",
                self.handle.member
            )));
        }

        let mut contacted = 0;
        let mut failures = Vec::new();
        for addr in peers {
            if *addr == self.handle.member.addr {
                continue;
            }
            let Some(peer) = network.node(addr) else {
                failures.push(addr.clone());
                continue;
            };

            // Push/pull with join semantics
            peer.delegate
                .merge_remote_state(&self.handle.delegate.local_state(true), true);
            self.handle
                .delegate
                .merge_remote_state(&peer.delegate.local_state(true), true);

            let mut cluster = peer.peer_members();
            cluster.extend(self.handle.peer_members());
            cluster.push(peer.member.clone());
            cluster.push(self.handle.member.clone());

            for member in &cluster {
                let Some(node) = network.node(&member.addr) else {
                    continue;
                };
                for other in &cluster {
                    node.learn(other);
                }
            }
            contacted += 1;
        }

        if contacted == 0 && !failures.is_empty() {
            return Err(ToporouteError::GossipJoin(format!(
                "no reachable peers among {}",
                failures.join(", ")
            )));
        }
        if !failures.is_empty() {
            warn!(unreachable = ?failures, "Some gossip peers were unreachable");
        }
        debug!(member = %self.handle.member, contacted, "Joined gossip peers");
        Ok(contacted)
    }

    async fn leave(&self) -> Result<()> {
        let network = self.network()?;
        if network.remove_node(&self.handle.member.addr).is_some() {
            info!(member = %self.handle.member, "Gossip node left");
        }
        Ok(())
    }

    fn members(&self) -> Vec<Member> {
        let mut members = vec![self.handle.member.clone()];
        members.extend(self.handle.peer_members());
        members
    }

    fn num_members(&self) -> usize {
        1 + self.handle.peers.read().len()
    }

    fn local_member(&self) -> Member {
        self.handle.member.clone()
    }
}
