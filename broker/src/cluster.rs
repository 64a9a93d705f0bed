/*
Cluster liveness and coordination. Nodes form a cluster by connecting to each
other over Tcp links. Heart beats on each link detect dead peers, the
membership table tracks the liveness of every known node, and ballots decide
which survivor takes over a dead node's responsibilities. The rest of the
broker (message log replication, topic ownership) consumes membership change
notifications, it never touches links or node records directly.
*/

use courier_net::data_types::{BallotSubject, NodeUuid};

pub mod ballot;
pub mod heartbeat;
pub mod link;
pub mod membership;
pub mod service;

/// Notifications of cluster membership events. Implementations override the
/// methods they care about and ignore the rest.
pub trait ClusterListener: Send + Sync {
    /// A node completed its handshake and is a live member of the cluster
    fn node_became_alive(&self, _node_uuid: NodeUuid) {}

    /// A node was declared dead. Fires exactly once per dead node record.
    fn node_became_dead(&self, _node_uuid: NodeUuid) {}

    /// A ballot resolved, the winner now owns the subject
    fn ballot_resolved(&self, _subject: BallotSubject, _winner: NodeUuid) {}

    /// Time for the message log to compact itself
    fn compaction_due(&self) {}
}
