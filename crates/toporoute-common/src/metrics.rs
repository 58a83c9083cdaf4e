//! Metric names recorded by the coordinator, gossip and server crates

/// Leader transitions observed by this node
pub const LEADER_CHANGES: &str = "toporoute_leader_changes_total";

/// Successful assignment publishes by the leader
pub const ASSIGNMENT_PUBLISH: &str = "toporoute_assignment_publish_total";

pub const ASSIGNMENT_PUBLISH_ERRORS: &str = "toporoute_assignment_publish_errors_total";

/// Gossip messages, labelled by `direction`
pub const GOSSIP_MESSAGES: &str = "toporoute_gossip_messages_total";

pub const GLOBAL_TOPICS: &str = "toporoute_global_topics";

/// Every metric name above
pub const ALL: [&str; 5] = [
    LEADER_CHANGES,
    ASSIGNMENT_PUBLISH,
    ASSIGNMENT_PUBLISH_ERRORS,
    GOSSIP_MESSAGES,
    GLOBAL_TOPICS,
];
