// Gossip capability traits
// A transport drives one delegate and one event delegate per local node

use async_trait::async_trait;

use toporoute_common::Result;

/// A node in the gossip overlay
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    /// Node name, equal to the service id
    pub name: String,
    /// `addr:port` the node is reachable on
    pub addr: String,
    pub meta: Vec<u8>,
}

impl Member {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            meta: Vec::new(),
        }
    }
}

impl std::fmt::Display for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name, self.addr)
    }
}

/// Hooks the transport calls to exchange application state
pub trait GossipDelegate: Send + Sync {
    /// Metadata attached to the local node when it announces itself
    fn node_meta(&self, limit: usize) -> Vec<u8>;

    /// A user message received from a peer
    fn notify_msg(&self, msg: &[u8]);

    /// Pending broadcasts that fit in `limit` bytes, each costing `overhead` extra
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;

    /// Full local state offered to a peer during push/pull
    fn local_state(&self, join: bool) -> Vec<u8>;

    /// Merge the full state received from a peer
    fn merge_remote_state(&self, buf: &[u8], join: bool);
}

/// Membership notifications
pub trait EventDelegate: Send + Sync {
    fn notify_join(&self, member: &Member);

    fn notify_leave(&self, member: &Member);

    fn notify_update(&self, member: &Member);
}

/// Operations the coordinator needs from a gossip overlay
#[async_trait]
pub trait GossipTransport: Send + Sync {
    /// Join the overlay through the given `addr:port` peers, returning how many were contacted
    async fn join(&self, peers: &[String]) -> Result<usize>;

    /// Leave the overlay
    async fn leave(&self) -> Result<()>;

    /// Known live members, including the local node
    fn members(&self) -> Vec<Member>;

    fn num_members(&self) -> usize;

    fn local_member(&self) -> Member;
}
