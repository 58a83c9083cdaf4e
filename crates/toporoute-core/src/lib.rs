//! Toporoute Core - Topic routing coordinator
//!
//! Control flow: a registry watch delivers the peer list, every node elects the
//! same leader, and the leader balances the configured topics over the peers,
//! publishes the result under a lease and joins the gossip overlay. Every node
//! watches the published assignment and keeps its own gossip ownership view.

pub mod assignment;
pub mod balancer;
pub mod cache;
pub mod coordinator;
pub mod election;
pub mod lease;
pub mod model;
pub mod registry;
pub mod ring;

pub use assignment::{Assignment, AssignmentPaths, AssignmentPublisher, AssignmentView};
pub use balancer::{ConsistentHashBalancer, ServiceBalancer};
pub use cache::{BalanceCache, BalanceResult};
pub use coordinator::TopicCoordinator;
pub use election::elect_leader;
pub use model::{Configuration, CoordinatorConfig};
pub use registry::{ServiceRegistry, ServiceWatch};
pub use ring::HashRing;
