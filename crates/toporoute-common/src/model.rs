// Service descriptor model
// Every running instance advertises one descriptor through the registry

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Gossip endpoint advertised by a service
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GossipConf {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub port: u16,
}

impl GossipConf {
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self {
            enabled: true,
            addr: addr.into(),
            port,
        }
    }

    /// `addr:port` form used to join the overlay
    pub fn address(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }
}

/// Advertised identity and metadata for one running instance
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    /// Service name, shared by all instances of one deployment
    #[serde(default)]
    pub name: String,

    /// Unique instance identifier
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Virtual replica count on the hash ring
    #[serde(default)]
    pub weight: i32,

    #[serde(default)]
    pub priority: i32,

    /// Explicit leadership claim
    #[serde(default)]
    pub is_leader: bool,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    #[serde(default)]
    pub gossip: GossipConf,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_leader(mut self, is_leader: bool) -> Self {
        self.is_leader = is_leader;
        self
    }

    pub fn with_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_gossip(mut self, gossip: GossipConf) -> Self {
        self.gossip = gossip;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Human readable key, `name-id`
    pub fn key(&self) -> String {
        format!("{}-{}", self.name, self.id)
    }

    /// Gossip join address if the service takes part in the overlay
    pub fn gossip_address(&self) -> Option<String> {
        if self.gossip.enabled {
            Some(self.gossip.address())
        } else {
            None
        }
    }
}

impl std::fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.name, self.id)
    }
}

/// Order-independent form of a service list, sorted by id
pub fn canonical_services(services: &[ServiceDescriptor]) -> Vec<ServiceDescriptor> {
    let mut sorted = services.to_vec();
    sorted.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.name.cmp(&b.name)));
    sorted
}
