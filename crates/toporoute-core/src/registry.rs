// Service registry on the coordination store
// Each node keeps its descriptor at `{prefix}/{id}` under its own lease,
// re-registering under a new lease when the old one is lost

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use toporoute_common::{Result, ServiceDescriptor, ToporouteError};
use toporoute_store::{CoordinationStore, KeyValue, LeaseId, WatchStream};

use crate::lease::{HeldLease, keep_lease_alive};

/// Parse registry values, skipping entries that are not valid descriptors
pub fn parse_services(kvs: &[KeyValue]) -> Vec<ServiceDescriptor> {
    kvs.iter()
        .filter_map(|kv| match serde_json::from_str::<ServiceDescriptor>(&kv.value) {
            Ok(desc) if !desc.id.is_empty() => Some(desc),
            Ok(_) => {
                warn!(key = %kv.key, "Skipping service descriptor without id");
                None
            }
            Err(e) => {
                warn!(key = %kv.key, error = %e, "Skipping malformed service descriptor");
                None
            }
        })
        .collect()
}

/// Stream of peer lists, one per registry change
pub struct ServiceWatch {
    rx: WatchStream,
}

impl ServiceWatch {
    pub async fn next(&mut self) -> Option<Vec<ServiceDescriptor>> {
        self.rx.recv().await.map(|kvs| parse_services(&kvs))
    }
}

/// First retry delay after the registration lease is lost
const REREGISTER_BACKOFF_MIN: Duration = Duration::from_millis(100);
/// Upper bound of the re-registration backoff
const REREGISTER_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Grant a lease, write the descriptor under it, and start renewing it
async fn publish_descriptor(
    store: &Arc<dyn CoordinationStore>,
    key: &str,
    value: &str,
    ttl: Duration,
) -> Result<HeldLease> {
    let lease = store.grant(ttl).await?;
    let written = match store.put(key, value, Some(lease.id)).await {
        Ok(()) => keep_lease_alive(store.clone(), lease.id, "registry").await,
        Err(e) => Err(e),
    };
    if written.is_err() {
        let _ = store.revoke(lease.id).await;
    }
    written
}

/// Keep the descriptor registered until stopped, re-registering whenever the lease is lost
async fn supervise_registration(
    store: Arc<dyn CoordinationStore>,
    key: String,
    value: String,
    ttl: Duration,
    mut held: HeldLease,
    mut stop_rx: watch::Receiver<bool>,
    lease_tx: watch::Sender<Option<LeaseId>>,
) {
    loop {
        let stopped = tokio::select! {
            _ = stop_rx.changed() => true,
            _ = held.lost() => false,
        };
        let lost = held.stop();
        if stopped {
            return;
        }

        warn!(key = %key, lease_id = lost, "Registration lease lost, re-registering");
        lease_tx.send_replace(None);
        if let Err(e) = store.revoke(lost).await {
            debug!(lease_id = lost, error = %e, "Lost registration lease already gone");
        }

        let mut backoff = REREGISTER_BACKOFF_MIN;
        held = loop {
            match publish_descriptor(&store, &key, &value, ttl).await {
                Ok(next) => break next,
                Err(e) => warn!(
                    key = %key,
                    error = %e,
                    retry_ms = backoff.as_millis() as u64,
                    "Re-registration failed"
                ),
            }
            tokio::select! {
                _ = stop_rx.changed() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(REREGISTER_BACKOFF_MAX);
        };

        lease_tx.send_replace(Some(held.id));
        info!(key = %key, lease_id = held.id, "Service re-registered");
    }
}

/// Handle on the task that owns the registration lease
struct Registration {
    stop_tx: watch::Sender<bool>,
    lease_rx: watch::Receiver<Option<LeaseId>>,
    task: JoinHandle<()>,
}

impl Registration {
    /// Stop the supervising task and return the lease it held, if any
    async fn stop(self) -> Option<LeaseId> {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Registration task ended abnormally");
        }
        *self.lease_rx.borrow()
    }
}

pub struct ServiceRegistry {
    store: Arc<dyn CoordinationStore>,
    prefix: String,
    ttl: Duration,
    registration: Mutex<Option<Registration>>,
}

impl ServiceRegistry {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        prefix: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            ttl,
            registration: Mutex::new(None),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn service_key(&self, id: &str) -> String {
        format!("{}/{}", self.prefix, id)
    }

    /// Publish the descriptor under a fresh lease kept alive until deregistration.
    ///
    /// If the lease is lost afterwards (expired, revoked, or the keepalive
    /// stream broke), the descriptor is written again under a new lease with
    /// exponential backoff.
    pub async fn register(&self, service: &ServiceDescriptor) -> Result<LeaseId> {
        let previous = self.registration.lock().take();
        if let Some(previous) = previous
            && let Some(id) = previous.stop().await
            && let Err(e) = self.store.revoke(id).await
        {
            debug!(lease_id = id, error = %e, "Previous registration lease already gone");
        }

        let value = serde_json::to_string(service)?;
        let key = self.service_key(&service.id);
        let held = publish_descriptor(&self.store, &key, &value, self.ttl).await?;
        let lease = held.id;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (lease_tx, lease_rx) = watch::channel(Some(lease));
        let task = tokio::spawn(supervise_registration(
            self.store.clone(),
            key.clone(),
            value,
            self.ttl,
            held,
            stop_rx,
            lease_tx,
        ));
        *self.registration.lock() = Some(Registration {
            stop_tx,
            lease_rx,
            task,
        });

        info!(service = %service, key = %key, lease_id = lease, "Service registered");
        Ok(lease)
    }

    /// Stop re-registering and revoke the current lease, removing the descriptor
    pub async fn deregister(&self) -> Result<()> {
        let registration = self.registration.lock().take();
        let Some(registration) = registration else {
            return Ok(());
        };
        let Some(id) = registration.stop().await else {
            info!(prefix = %self.prefix, "Service deregistered while re-registering");
            return Ok(());
        };
        match self.store.revoke(id).await {
            Ok(()) | Err(ToporouteError::LeaseNotFound(_)) => {
                info!(prefix = %self.prefix, lease_id = id, "Service deregistered");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Lease currently backing the registration; `None` while re-registering
    pub fn registration_lease(&self) -> Option<LeaseId> {
        self.registration
            .lock()
            .as_ref()
            .and_then(|registration| *registration.lease_rx.borrow())
    }

    pub async fn list(&self) -> Result<Vec<ServiceDescriptor>> {
        let kvs = self.store.get_prefix(&format!("{}/", self.prefix)).await?;
        Ok(parse_services(&kvs))
    }

    pub async fn watch(&self) -> Result<ServiceWatch> {
        let rx = self.store.watch_prefix(&format!("{}/", self.prefix)).await?;
        Ok(ServiceWatch { rx })
    }
}
