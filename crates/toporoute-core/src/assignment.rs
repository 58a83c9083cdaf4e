//! Assignment publication and watch
//!
//! The leader writes the topic to service-id map under a lease that is revoked
//! and re-granted on every publish, so keys of an older layout never survive.
//! Every node watches the assignment path and fully replaces its local view.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use metrics::counter;
use parking_lot::RwLock;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use toporoute_common::{
    ALL_TOPICS_KEY, Result, TOPIC_DATA_SEP, TOPIC_SERVICE_SEP, TOPICS_SEP, ToporouteError,
    metrics::{ASSIGNMENT_PUBLISH, ASSIGNMENT_PUBLISH_ERRORS},
};
use toporoute_store::{CoordinationStore, KeyValue, LeaseId, PutOp};

use crate::lease::{HeldLease, keep_lease_alive};

/// Topic to ordered service ids
pub type Assignment = BTreeMap<String, Vec<String>>;

/// Encode as `topic:svc1|svc2;topic2:svc3`
pub fn encode_assignment(assignment: &Assignment) -> String {
    assignment
        .iter()
        .map(|(topic, services)| {
            format!(
                "{}{}{}",
                topic,
                TOPIC_DATA_SEP,
                services.join(TOPIC_SERVICE_SEP)
            )
        })
        .collect::<Vec<_>>()
        .join(TOPICS_SEP)
}

fn parse_owners(value: &str) -> Vec<String> {
    value
        .split(TOPIC_SERVICE_SEP)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse one `topic:svc1|svc2` entry, splitting on the first separator
pub fn parse_topic_entry(entry: &str) -> Option<(String, Vec<String>)> {
    let (topic, owners) = entry.split_once(TOPIC_DATA_SEP)?;
    let topic = topic.trim();
    let owners = parse_owners(owners);
    if topic.is_empty() || owners.is_empty() {
        return None;
    }
    Some((topic.to_string(), owners))
}

/// Parse an aggregated value, skipping malformed entries
pub fn parse_assignment(value: &str) -> Assignment {
    let mut assignment = Assignment::new();
    for entry in value.split(TOPICS_SEP).filter(|e| !e.trim().is_empty()) {
        match parse_topic_entry(entry) {
            Some((topic, owners)) => {
                assignment.insert(topic, owners);
            }
            None => warn!(entry, "Skipping malformed assignment entry"),
        }
    }
    assignment
}

/// Path segment holding one key per topic
const TOPIC_KEY_SEGMENT: &str = "t";

/// Key layout under `/{ns}/{as}/topics`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssignmentPaths {
    root: String,
}

impl AssignmentPaths {
    pub fn new(namespace: &str, application: &str) -> Self {
        Self {
            root: format!("/{}/{}/topics", namespace, application),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Prefix covering every assignment key
    pub fn prefix(&self) -> String {
        format!("{}/", self.root)
    }

    pub fn all_key(&self) -> String {
        format!("{}/{}", self.root, ALL_TOPICS_KEY)
    }

    /// Prefix of the per-topic keys, disjoint from the aggregated key
    pub fn topic_prefix(&self) -> String {
        format!("{}/{}/", self.root, TOPIC_KEY_SEGMENT)
    }

    pub fn topic_key(&self, topic: &str) -> String {
        format!("{}{}", self.topic_prefix(), topic)
    }

    /// Build an assignment from every key under the prefix
    pub fn decode(&self, kvs: &[KeyValue]) -> Assignment {
        let all_key = self.all_key();
        let topic_prefix = self.topic_prefix();
        let mut assignment = Assignment::new();

        for kv in kvs {
            if kv.key == all_key {
                assignment.extend(parse_assignment(&kv.value));
            } else if let Some(topic) = kv.key.strip_prefix(&topic_prefix) {
                let owners = parse_owners(&kv.value);
                if topic.is_empty() || owners.is_empty() {
                    warn!(key = %kv.key, "Skipping malformed assignment key");
                    continue;
                }
                assignment.insert(topic.to_string(), owners);
            } else {
                debug!(key = %kv.key, "Ignoring unknown assignment key");
            }
        }
        assignment
    }
}

/// Leader-side writer of the assignment
pub struct AssignmentPublisher {
    store: Arc<dyn CoordinationStore>,
    paths: AssignmentPaths,
    ttl: Duration,
    topic_per_key: bool,
    /// Held across the whole publish so only one is in flight
    active: tokio::sync::Mutex<Option<HeldLease>>,
    /// Set under `active`; a closed publisher refuses to publish
    closed: AtomicBool,
}

impl AssignmentPublisher {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        paths: AssignmentPaths,
        ttl: Duration,
        topic_per_key: bool,
    ) -> Self {
        Self {
            store,
            paths,
            ttl,
            topic_per_key,
            active: tokio::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Replace the published assignment, returning the new lease
    pub async fn publish(&self, assignment: &Assignment) -> Result<LeaseId> {
        let mut active = self.active.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(ToporouteError::Shutdown("assignment publisher".to_string()));
        }

        if let Some(previous) = active.take() {
            let id = previous.stop();
            match self.store.revoke(id).await {
                Ok(()) => debug!(lease_id = id, "Revoked previous assignment lease"),
                Err(ToporouteError::LeaseNotFound(_)) => {
                    debug!(lease_id = id, "Previous assignment lease already expired")
                }
                Err(e) => {
                    warn!(lease_id = id, error = %e, "Failed to revoke previous assignment lease")
                }
            }
        }

        let result = self.write(assignment).await;
        match result {
            Ok(held) => {
                let id = held.id;
                *active = Some(held);
                counter!(ASSIGNMENT_PUBLISH).increment(1);
                info!(
                    lease_id = id,
                    topics = assignment.len(),
                    per_key = self.topic_per_key,
                    "Published topic assignment"
                );
                Ok(id)
            }
            Err(e) => {
                counter!(ASSIGNMENT_PUBLISH_ERRORS).increment(1);
                Err(e)
            }
        }
    }

    async fn write(&self, assignment: &Assignment) -> Result<HeldLease> {
        let removed = self.store.delete_prefix(&self.paths.prefix()).await?;
        if removed > 0 {
            debug!(removed, "Deleted residual assignment keys");
        }

        let lease = self.store.grant(self.ttl).await?;
        let written = if self.topic_per_key {
            let ops = assignment
                .iter()
                .map(|(topic, services)| {
                    PutOp::new(
                        self.paths.topic_key(topic),
                        services.join(TOPIC_SERVICE_SEP),
                        Some(lease.id),
                    )
                })
                .collect();
            self.store.txn_put(ops).await
        } else {
            self.store
                .put(
                    &self.paths.all_key(),
                    &encode_assignment(assignment),
                    Some(lease.id),
                )
                .await
        };

        if let Err(e) = written {
            let _ = self.store.revoke(lease.id).await;
            return Err(e);
        }
        keep_lease_alive(self.store.clone(), lease.id, "assignment").await
    }

    /// Stop renewing and revoke the current lease, deleting the published keys
    pub async fn release(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        self.release_locked(&mut active).await
    }

    /// Release and refuse every later publish
    pub async fn close(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        self.release_locked(&mut active).await
    }

    async fn release_locked(&self, active: &mut Option<HeldLease>) -> Result<()> {
        let Some(held) = active.take() else {
            return Ok(());
        };
        let id = held.stop();
        match self.store.revoke(id).await {
            Ok(()) | Err(ToporouteError::LeaseNotFound(_)) => {
                info!(lease_id = id, "Released assignment lease");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn current_lease(&self) -> Option<LeaseId> {
        self.active.lock().await.as_ref().map(|held| held.id)
    }
}

/// Local copy of the published assignment
#[derive(Default)]
pub struct AssignmentView {
    inner: RwLock<Assignment>,
}

impl AssignmentView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole view
    pub fn replace(&self, assignment: Assignment) {
        *self.inner.write() = assignment;
    }

    pub fn services(&self, topic: &str) -> Vec<String> {
        self.inner.read().get(topic).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> Assignment {
        self.inner.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// Watch the assignment path and keep `view` current until shutdown
pub async fn spawn_assignment_watch(
    store: Arc<dyn CoordinationStore>,
    paths: AssignmentPaths,
    view: Arc<AssignmentView>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    let mut updates = store.watch_prefix(&paths.prefix()).await?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                update = updates.recv() => {
                    let Some(kvs) = update else {
                        warn!("Assignment watch closed");
                        break;
                    };
                    let assignment = paths.decode(&kvs);
                    debug!(topics = assignment.len(), "Assignment view updated");
                    view.replace(assignment);
                }
            }
        }
    }))
}
