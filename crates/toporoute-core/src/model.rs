//! Coordinator configuration
//!
//! `Configuration` wraps the layered `config::Config` and exposes typed getters
//! with defaults; `CoordinatorConfig` is the validated form a coordinator is
//! constructed from.

use std::time::Duration;

use config::Config;

use toporoute_common::{
    DEFAULT_AS, DEFAULT_LEASE_TTL_SECS, DEFAULT_NS, GossipConf, Result, ServiceDescriptor,
    ToporouteError,
};
use toporoute_gossip::GossipSettings;

use crate::assignment::AssignmentPaths;

pub const DEFAULT_SERVICE_NAME: &str = "topic_service";
pub const DEFAULT_GOSSIP_ADDR: &str = "127.0.0.1";
pub const DEFAULT_GOSSIP_PORT: u16 = 7946;
pub const DEFAULT_STATE_DUMP_SECS: u64 = 10;

/// Validated settings of one coordinator
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Descriptor this node registers
    pub service: ServiceDescriptor,
    pub namespace: String,
    pub application: String,
    /// Registry path segment under `/{ns}/{as}`
    pub registry_key: String,
    pub lease_ttl: Duration,
    /// Publish one key per topic in a transaction instead of one aggregated key
    pub topic_per_key: bool,
    /// Topics the leader assigns on every publish
    pub topics: Vec<String>,
    pub gossip: GossipSettings,
    /// Periodic state log, disabled when `None`
    pub state_dump_interval: Option<Duration>,
}

impl CoordinatorConfig {
    pub fn new(service: ServiceDescriptor, registry_key: impl Into<String>) -> Self {
        Self {
            service,
            namespace: DEFAULT_NS.to_string(),
            application: DEFAULT_AS.to_string(),
            registry_key: registry_key.into(),
            lease_ttl: Duration::from_secs(DEFAULT_LEASE_TTL_SECS),
            topic_per_key: false,
            topics: Vec::new(),
            gossip: GossipSettings::default(),
            state_dump_interval: Some(Duration::from_secs(DEFAULT_STATE_DUMP_SECS)),
        }
    }

    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_topic_per_key(mut self, topic_per_key: bool) -> Self {
        self.topic_per_key = topic_per_key;
        self
    }

    pub fn with_gossip(mut self, gossip: GossipSettings) -> Self {
        self.gossip = gossip;
        self
    }

    pub fn with_state_dump_interval(mut self, interval: Option<Duration>) -> Self {
        self.state_dump_interval = interval;
        self
    }

    /// Fill empty path segments with defaults and reject missing identity
    pub fn validate(mut self) -> Result<Self> {
        if self.service.id.trim().is_empty() {
            return Err(ToporouteError::Config("service id is empty".to_string()));
        }
        if self.registry_key.trim().is_empty() {
            return Err(ToporouteError::Config("registry key is empty".to_string()));
        }
        if self.lease_ttl.is_zero() {
            return Err(ToporouteError::Config("lease ttl must be positive".to_string()));
        }
        if self.namespace.is_empty() {
            self.namespace = DEFAULT_NS.to_string();
        }
        if self.application.is_empty() {
            self.application = DEFAULT_AS.to_string();
        }
        if self.service.name.is_empty() {
            self.service.name = DEFAULT_SERVICE_NAME.to_string();
        }

        // Every publish clears the assignment prefix, registrations must live elsewhere
        let registry = format!("{}/", self.registry_prefix());
        let assignment = self.assignment_paths().prefix();
        if registry.starts_with(&assignment) || assignment.starts_with(&registry) {
            return Err(ToporouteError::Config(format!(
                "registry prefix {} overlaps assignment prefix {}",
                registry, assignment
            )));
        }
        Ok(self)
    }

    /// `/{ns}/{as}/{registry_key}`
    pub fn registry_prefix(&self) -> String {
        format!(
            "/{}/{}/{}",
            self.namespace, self.application, self.registry_key
        )
    }

    pub fn assignment_paths(&self) -> AssignmentPaths {
        AssignmentPaths::new(&self.namespace, &self.application)
    }

    /// Address the local gossip node binds to
    pub fn gossip_address(&self) -> String {
        self.service
            .gossip_address()
            .unwrap_or_else(|| format!("local:{}", self.service.id))
    }
}

/// Application configuration loaded from config files and environment
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: Config,
}

impl Configuration {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    // ========================================================================
    // Service Identity
    // ========================================================================

    pub fn service_id(&self) -> String {
        self.config
            .get_string("toporoute.service.id")
            .unwrap_or_default()
    }

    pub fn service_name(&self) -> String {
        self.config
            .get_string("toporoute.service.name")
            .unwrap_or(DEFAULT_SERVICE_NAME.to_string())
    }

    pub fn service_weight(&self) -> i32 {
        self.config.get_int("toporoute.service.weight").unwrap_or(0) as i32
    }

    pub fn service_priority(&self) -> i32 {
        self.config
            .get_int("toporoute.service.priority")
            .unwrap_or(0) as i32
    }

    pub fn service_leader(&self) -> bool {
        self.config
            .get_bool("toporoute.service.leader")
            .unwrap_or(false)
    }

    pub fn service_endpoints(&self) -> Vec<String> {
        self.config
            .get::<Vec<String>>("toporoute.service.endpoints")
            .unwrap_or_default()
    }

    // ========================================================================
    // Store Layout
    // ========================================================================

    pub fn namespace(&self) -> String {
        self.config
            .get_string("toporoute.ns")
            .unwrap_or(DEFAULT_NS.to_string())
    }

    pub fn application(&self) -> String {
        self.config
            .get_string("toporoute.as")
            .unwrap_or(DEFAULT_AS.to_string())
    }

    pub fn registry_key(&self) -> String {
        self.config
            .get_string("toporoute.registry.key")
            .unwrap_or_default()
    }

    pub fn lease_ttl_secs(&self) -> u64 {
        self.config
            .get_int("toporoute.lease.ttl-secs")
            .unwrap_or(DEFAULT_LEASE_TTL_SECS as i64)
            .max(1) as u64
    }

    pub fn topic_per_key(&self) -> bool {
        self.config
            .get_bool("toporoute.assignment.topic-per-key")
            .unwrap_or(false)
    }

    /// Topics as a list or a comma separated string
    pub fn topics(&self) -> Vec<String> {
        if let Ok(topics) = self.config.get::<Vec<String>>("toporoute.topics") {
            return topics;
        }
        self.config
            .get_string("toporoute.topics")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    // ========================================================================
    // Gossip Configuration
    // ========================================================================

    pub fn gossip_enabled(&self) -> bool {
        self.config
            .get_bool("toporoute.gossip.enabled")
            .unwrap_or(true)
    }

    pub fn gossip_addr(&self) -> String {
        self.config
            .get_string("toporoute.gossip.addr")
            .unwrap_or(DEFAULT_GOSSIP_ADDR.to_string())
    }

    pub fn gossip_port(&self) -> u16 {
        self.config
            .get_int("toporoute.gossip.port")
            .unwrap_or(DEFAULT_GOSSIP_PORT.into()) as u16
    }

    pub fn gossip_retransmit_mult(&self) -> usize {
        self.config
            .get_int("toporoute.gossip.retransmit-mult")
            .unwrap_or(3)
            .max(1) as usize
    }

    pub fn gossip_purge_on_leave(&self) -> bool {
        self.config
            .get_bool("toporoute.gossip.purge-on-leave")
            .unwrap_or(true)
    }

    pub fn gossip_interval_ms(&self) -> u64 {
        self.config
            .get_int("toporoute.gossip.interval-ms")
            .unwrap_or(200)
            .max(1) as u64
    }

    pub fn gossip_push_pull_interval_secs(&self) -> u64 {
        self.config
            .get_int("toporoute.gossip.push-pull-interval-secs")
            .unwrap_or(30)
            .max(1) as u64
    }

    /// Zero disables the periodic state log
    pub fn state_dump_interval_secs(&self) -> u64 {
        self.config
            .get_int("toporoute.state-dump.interval-secs")
            .unwrap_or(DEFAULT_STATE_DUMP_SECS as i64)
            .max(0) as u64
    }

    pub fn gossip_settings(&self) -> GossipSettings {
        GossipSettings {
            retransmit_mult: self.gossip_retransmit_mult(),
            purge_on_leave: self.gossip_purge_on_leave(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms()),
            push_pull_interval: Duration::from_secs(self.gossip_push_pull_interval_secs()),
            ..GossipSettings::default()
        }
    }

    pub fn service_descriptor(&self) -> ServiceDescriptor {
        let mut service = ServiceDescriptor::new(self.service_name(), self.service_id())
            .with_weight(self.service_weight())
            .with_leader(self.service_leader())
            .with_endpoints(self.service_endpoints());
        service.priority = self.service_priority();
        if self.gossip_enabled() {
            service.gossip = GossipConf::new(self.gossip_addr(), self.gossip_port());
        }
        service
    }

    /// Validated coordinator settings
    pub fn coordinator_config(&self) -> Result<CoordinatorConfig> {
        let interval = self.state_dump_interval_secs();
        CoordinatorConfig {
            namespace: self.namespace(),
            application: self.application(),
            lease_ttl: Duration::from_secs(self.lease_ttl_secs()),
            topic_per_key: self.topic_per_key(),
            topics: self.topics(),
            gossip: self.gossip_settings(),
            state_dump_interval: (interval > 0).then(|| Duration::from_secs(interval)),
            ..CoordinatorConfig::new(self.service_descriptor(), self.registry_key())
        }
        .validate()
    }
}
