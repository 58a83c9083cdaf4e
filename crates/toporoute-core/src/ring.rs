// Weighted consistent hash ring
// Virtual positions depend only on (node, replica index), so any insertion
// order of the same weighted node set yields the same layout

use std::collections::{BTreeMap, BTreeSet};

use md5::{Digest, Md5};

/// Ring position of a string: first 8 bytes of its MD5 digest, big-endian
pub fn hash_key(key: &str) -> u64 {
    let digest = Md5::digest(key.as_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(buf)
}

fn replica_key(node: &str, index: usize) -> String {
    format!("{}#{}", node, index)
}

#[derive(Clone, Debug, Default)]
pub struct HashRing {
    /// Position to the nodes hashed there; collisions resolve to the smallest name
    positions: BTreeMap<u64, BTreeSet<String>>,
    replicas: BTreeMap<String, usize>,
}

impl HashRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `replicas` virtual positions for `node`, replacing any previous placement
    pub fn add(&mut self, node: &str, replicas: usize) {
        if self.replicas.get(node) == Some(&replicas) {
            return;
        }
        self.remove(node);

        for index in 0..replicas {
            self.positions
                .entry(hash_key(&replica_key(node, index)))
                .or_default()
                .insert(node.to_string());
        }
        self.replicas.insert(node.to_string(), replicas);
    }

    pub fn remove(&mut self, node: &str) -> bool {
        let Some(replicas) = self.replicas.remove(node) else {
            return false;
        };
        for index in 0..replicas {
            let position = hash_key(&replica_key(node, index));
            if let Some(nodes) = self.positions.get_mut(&position) {
                nodes.remove(node);
                if nodes.is_empty() {
                    self.positions.remove(&position);
                }
            }
        }
        true
    }

    /// Node owning the first position at or after the key's hash, wrapping around
    pub fn get(&self, key: &str) -> Option<&str> {
        let hash = hash_key(key);
        self.positions
            .range(hash..)
            .next()
            .or_else(|| self.positions.iter().next())
            .and_then(|(_, nodes)| nodes.iter().next())
            .map(String::as_str)
    }

    /// Up to `n` distinct nodes walking clockwise from the key's hash
    pub fn get_n(&self, key: &str, n: usize) -> Vec<String> {
        let limit = n.min(self.replicas.len());
        let mut found: Vec<String> = Vec::with_capacity(limit);
        if limit == 0 {
            return found;
        }

        let hash = hash_key(key);
        let clockwise = self
            .positions
            .range(hash..)
            .chain(self.positions.range(..hash));
        for (_, nodes) in clockwise {
            for node in nodes {
                if !found.contains(node) {
                    found.push(node.clone());
                    if found.len() == limit {
                        return found;
                    }
                }
            }
        }
        found
    }

    /// Distinct physical nodes, ordered
    pub fn nodes(&self) -> Vec<String> {
        self.replicas.keys().cloned().collect()
    }

    pub fn replicas(&self, node: &str) -> Option<usize> {
        self.replicas.get(node).copied()
    }

    pub fn contains(&self, node: &str) -> bool {
        self.replicas.contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }
}
