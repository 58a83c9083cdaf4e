//! Toporoute Gossip - Epidemic topic ownership
//!
//! Every node owns a `TopicState` holding the topics it serves itself and the
//! union of ownership facts observed from peers. The state plugs into a gossip
//! transport through two capability traits:
//! - `GossipDelegate`: message, broadcast and full-state exchange hooks
//! - `EventDelegate`: membership join/leave/update notifications
//!
//! `MemoryGossipNetwork` is an in-process transport used by tests and the demo
//! cluster; a networked transport only needs to drive the same traits.

pub mod memory;
pub mod message;
pub mod queue;
pub mod state;
pub mod traits;

pub use memory::{MemoryGossipNetwork, MemoryGossipNode};
pub use message::{TopicInfo, TopicOp, TopicSnapshot};
pub use queue::BroadcastQueue;
pub use state::{GossipSettings, LocalTopic, TopicState};
pub use traits::{EventDelegate, GossipDelegate, GossipTransport, Member};
