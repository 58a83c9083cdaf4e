// Lease keepalive consumption

use std::sync::Arc;

use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, trace, warn};

use toporoute_common::Result;
use toporoute_store::{CoordinationStore, LeaseId};

/// A lease kept alive by a background task
pub struct HeldLease {
    pub id: LeaseId,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HeldLease {
    /// Stop renewing; the lease itself is left to the caller
    pub fn stop(self) -> LeaseId {
        let _ = self.stop_tx.send(true);
        self.task.abort();
        self.id
    }

    pub fn is_renewing(&self) -> bool {
        !self.task.is_finished()
    }

    /// Resolves when renewal ends on its own because the keepalive stream closed
    pub async fn lost(&mut self) {
        let _ = (&mut self.task).await;
    }
}

/// Open a keepalive stream for `lease` and consume it until stopped or closed
pub async fn keep_lease_alive(
    store: Arc<dyn CoordinationStore>,
    lease: LeaseId,
    label: &'static str,
) -> Result<HeldLease> {
    let mut acks = store.keep_alive(lease).await?;
    let (stop_tx, mut stop_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    debug!(lease_id = lease, label, "Keepalive loop stopped");
                    break;
                }
                ack = acks.recv() => match ack {
                    Some(resp) => {
                        let ttl_ms = resp.ttl.as_millis() as u64;
                        trace!(lease_id = resp.id, ttl_ms, label, "Keep-alive OK");
                    }
                    None => {
                        warn!(lease_id = lease, label, "Keep-alive stream closed");
                        break;
                    }
                },
            }
        }
    });

    Ok(HeldLease {
        id: lease,
        stop_tx,
        task,
    })
}
