// Transmit-limited broadcast queue
// Each queued message is piggybacked on gossip rounds until it has been sent
// retransmit_mult * ceil(log10(n + 1)) times

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

struct QueuedBroadcast {
    id: u64,
    msg: Vec<u8>,
    transmits: usize,
}

/// Number of times a broadcast is sent in a cluster of `num_nodes` members
pub fn retransmit_limit(retransmit_mult: usize, num_nodes: usize) -> usize {
    let node_scale = ((num_nodes.max(1) as f64) + 1.0).log10().ceil() as usize;
    retransmit_mult * node_scale
}

/// Queue of outgoing gossip messages
pub struct BroadcastQueue {
    retransmit_mult: usize,
    queue: Mutex<Vec<QueuedBroadcast>>,
    next_id: AtomicU64,
}

impl BroadcastQueue {
    pub fn new(retransmit_mult: usize) -> Self {
        Self {
            retransmit_mult: retransmit_mult.max(1),
            queue: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Queue a message, returning its broadcast id
    pub fn queue_broadcast(&self, msg: Vec<u8>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.queue.lock().push(QueuedBroadcast {
            id,
            msg,
            transmits: 0,
        });
        id
    }

    /// Take the broadcasts to send in one round.
    ///
    /// Least transmitted messages are picked first while they fit into `limit`;
    /// the returned batch keeps queue order so a later delta never overtakes an earlier one.
    pub fn get_broadcasts(&self, overhead: usize, limit: usize, num_nodes: usize) -> Vec<Vec<u8>> {
        let transmit_limit = retransmit_limit(self.retransmit_mult, num_nodes);
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            return Vec::new();
        }

        let mut order: Vec<usize> = (0..queue.len()).collect();
        order.sort_by_key(|&i| (queue[i].transmits, queue[i].id));

        let mut used = 0;
        let mut picked = Vec::new();
        for i in order {
            let cost = overhead + queue[i].msg.len();
            if used + cost > limit {
                continue;
            }
            used += cost;
            picked.push(i);
        }
        picked.sort_unstable();

        let mut out = Vec::with_capacity(picked.len());
        for i in picked {
            queue[i].transmits += 1;
            out.push(queue[i].msg.clone());
        }

        queue.retain(|b| {
            if b.transmits >= transmit_limit {
                debug!(broadcast_id = b.id, transmits = b.transmits, "Broadcast finished");
                false
            } else {
                true
            }
        });
        out
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Drop every pending broadcast
    pub fn reset(&self) {
        self.queue.lock().clear();
    }
}
