// Topic ownership state shared through gossip
// LocalTopics holds this node's own claims, GlobalTopics the union of everything observed

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use toporoute_common::{
    Result, ToporouteError,
    metrics::{GLOBAL_TOPICS, GOSSIP_MESSAGES},
};

use crate::{
    message::{
        TopicInfo, TopicOp, TopicSnapshot, decode_batch, decode_snapshot, encode_batch,
        encode_snapshot,
    },
    queue::BroadcastQueue,
    traits::{EventDelegate, GossipDelegate, Member},
};

/// Gossip tuning shared by the topic state and the transport
#[derive(Clone, Debug)]
pub struct GossipSettings {
    /// Multiplier for the number of retransmissions of each broadcast
    pub retransmit_mult: usize,
    /// Purge a departed member's ownership claims from GlobalTopics
    pub purge_on_leave: bool,
    /// Interval between broadcast rounds
    pub gossip_interval: Duration,
    /// Interval between full-state exchanges
    pub push_pull_interval: Duration,
    /// Maximum payload bytes per gossip round
    pub packet_limit: usize,
    /// Per-message framing overhead counted against the packet limit
    pub message_overhead: usize,
}

impl Default for GossipSettings {
    fn default() -> Self {
        Self {
            retransmit_mult: 3,
            purge_on_leave: true,
            gossip_interval: Duration::from_millis(200),
            push_pull_interval: Duration::from_secs(30),
            packet_limit: 1400,
            message_overhead: 2,
        }
    }
}

/// One topic served by the local node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalTopic {
    pub topic: String,
    pub since: DateTime<Utc>,
}

/// Ownership state of one node, driven by the gossip transport
pub struct TopicState {
    local_id: String,
    local: Mutex<BTreeMap<String, LocalTopic>>,
    global: Mutex<TopicSnapshot>,
    broadcasts: BroadcastQueue,
    num_members: AtomicUsize,
    broadcast_count: AtomicU64,
    purge_on_leave: bool,
}

impl TopicState {
    pub fn new(local_id: impl Into<String>, settings: &GossipSettings) -> Self {
        Self {
            local_id: local_id.into(),
            local: Mutex::new(BTreeMap::new()),
            global: Mutex::new(TopicSnapshot::new()),
            broadcasts: BroadcastQueue::new(settings.retransmit_mult),
            num_members: AtomicUsize::new(1),
            broadcast_count: AtomicU64::new(0),
            purge_on_leave: settings.purge_on_leave,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Claim topics and broadcast the claim
    pub fn add_topics(&self, topics: &[String]) -> Result<()> {
        self.update_topics(TopicOp::Add, topics, true)
    }

    /// Release topics and broadcast the release
    pub fn del_topics(&self, topics: &[String]) -> Result<()> {
        self.update_topics(TopicOp::Del, topics, true)
    }

    /// Apply a local ownership change, optionally queueing it for broadcast
    pub fn update_topics(&self, op: TopicOp, topics: &[String], broadcast: bool) -> Result<()> {
        if topics.is_empty() {
            return Err(ToporouteError::Config("topic list is empty".to_string()));
        }

        let batch: Vec<TopicInfo> = topics
            .iter()
            .map(|topic| TopicInfo::new(op, topic.as_str(), self.local_id.as_str()))
            .collect();

        {
            let now = Utc::now();
            let mut local = self.local.lock();
            for info in &batch {
                match op {
                    TopicOp::Add => {
                        local.entry(info.topic.clone()).or_insert_with(|| LocalTopic {
                            topic: info.topic.clone(),
                            since: now,
                        });
                    }
                    TopicOp::Del => {
                        local.remove(&info.topic);
                    }
                }
            }
        }
        for info in &batch {
            self.apply(info);
        }

        if !broadcast {
            return Ok(());
        }

        let msg = encode_batch(&batch)?;
        let seq = self.broadcast_count.fetch_add(1, Ordering::Relaxed) + 1;
        let broadcast_id = self.broadcasts.queue_broadcast(msg);
        counter!(GOSSIP_MESSAGES, "direction" => "out").increment(1);
        info!(
            seq,
            broadcast_id,
            %op,
            topics = ?topics,
            members = self.member_count(),
            "Queued topic ownership broadcast"
        );
        Ok(())
    }

    /// Apply one delta to GlobalTopics
    pub fn apply(&self, info: &TopicInfo) {
        let mut global = self.global.lock();
        match info.op {
            TopicOp::Add => {
                global
                    .entry(info.topic.clone())
                    .or_default()
                    .insert(info.service.clone());
            }
            TopicOp::Del => {
                if let Some(owners) = global.get_mut(&info.topic) {
                    owners.remove(&info.service);
                    if owners.is_empty() {
                        global.remove(&info.topic);
                    }
                }
            }
        }
        gauge!(GLOBAL_TOPICS).set(global.len() as f64);
    }

    /// Topics claimed by the local node
    pub fn local_topics(&self) -> Vec<String> {
        self.local.lock().keys().cloned().collect()
    }

    pub fn local_records(&self) -> Vec<LocalTopic> {
        self.local.lock().values().cloned().collect()
    }

    /// Copy of GlobalTopics
    pub fn global_topics(&self) -> TopicSnapshot {
        self.global.lock().clone()
    }

    /// Service ids observed owning a topic
    pub fn owners(&self, topic: &str) -> BTreeSet<String> {
        self.global.lock().get(topic).cloned().unwrap_or_default()
    }

    pub fn member_count(&self) -> usize {
        self.num_members.load(Ordering::SeqCst)
    }

    pub fn pending_broadcasts(&self) -> usize {
        self.broadcasts.len()
    }

    /// Remove every claim held by `service`, returning the number of removed pairs
    pub fn purge_owner(&self, service: &str) -> usize {
        let mut global = self.global.lock();
        let mut removed = 0;
        global.retain(|_, owners| {
            if owners.remove(service) {
                removed += 1;
            }
            !owners.is_empty()
        });
        gauge!(GLOBAL_TOPICS).set(global.len() as f64);
        removed
    }
}

impl GossipDelegate for TopicState {
    fn node_meta(&self, _limit: usize) -> Vec<u8> {
        Vec::new()
    }

    fn notify_msg(&self, msg: &[u8]) {
        let batch = match decode_batch(msg) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(len = msg.len(), error = %e, "Failed to decode gossip message");
                return;
            }
        };

        counter!(GOSSIP_MESSAGES, "direction" => "in").increment(1);
        debug!(updates = batch.len(), "Received topic deltas");
        for info in &batch {
            self.apply(info);
        }
    }

    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        self.broadcasts
            .get_broadcasts(overhead, limit, self.member_count())
    }

    fn local_state(&self, join: bool) -> Vec<u8> {
        let snapshot = self.global_topics();
        match encode_snapshot(&snapshot) {
            Ok(buf) => {
                debug!(join, topics = snapshot.len(), "Offering local topic state");
                buf
            }
            Err(e) => {
                warn!(error = %e, "Failed to encode local topic state");
                Vec::new()
            }
        }
    }

    fn merge_remote_state(&self, buf: &[u8], join: bool) {
        let remote = match decode_snapshot(buf) {
            Ok(remote) => remote,
            Err(e) => {
                warn!(error = %e, "Failed to decode remote topic state");
                return;
            }
        };

        debug!(join, topics = remote.len(), "Merging remote topic state");
        // Union only, entries missing remotely stay
        for (topic, owners) in remote {
            for service in owners {
                self.apply(&TopicInfo::new(TopicOp::Add, topic.as_str(), service));
            }
        }
    }
}

impl EventDelegate for TopicState {
    fn notify_join(&self, member: &Member) {
        let members = self.num_members.fetch_add(1, Ordering::SeqCst) + 1;
        info!(member = %member, members, "A gossip node has joined");
    }

    fn notify_leave(&self, member: &Member) {
        let members = self
            .num_members
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1).max(1)))
            .map(|prev| prev.saturating_sub(1).max(1))
            .unwrap_or(1);
        info!(member = %member, members, "A gossip node has left");

        if self.purge_on_leave && member.name != self.local_id {
            let removed = self.purge_owner(&member.name);
            if removed > 0 {
                info!(member = %member, removed, "Purged ownership claims of departed node");
            }
        }
    }

    fn notify_update(&self, member: &Member) {
        info!(member = %member, "A gossip node was updated");
    }
}
