/*
The authoritative view of the nodes in the cluster. Records move through
Connecting, Alive and Dead as handshakes complete and heart beats fail. Dead
is terminal, a dead record is kept so that the history of the cluster is
never silently rewritten. A node id that reappears after dying gets a brand
new record. A single mutex guards the table, membership changes are rare
compared with link traffic so nothing finer grained is needed.
*/

use log::{debug, info};
use std::sync::{Arc, Mutex, RwLock};

use courier_net::data_types::{BallotSubject, NodeUuid, Timestamp};

use super::{link::LinkId, ClusterListener};

/// The liveness of one node record. Suspect is defined for an intermediate
/// degraded state but nothing transitions into it, the first missed heart
/// beat timeout is treated as authoritative.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Connecting,
    Alive,
    Suspect,
    Dead,
}

struct NodeRecord {
    address: String,
    node_uuid: Option<NodeUuid>,
    state: NodeState,
    link_id: Option<LinkId>,
    outbound: bool,
    is_loopback: bool,
    last_heart_beat: Option<Timestamp>,
    created: Timestamp,
}

/// A read-only snapshot of one node record
#[cfg_attr(debug_assertions, derive(Debug))]
pub struct NodeView {
    pub address: String,
    pub node_uuid: Option<NodeUuid>,
    pub state: NodeState,
    pub link_id: Option<LinkId>,
    pub is_loopback: bool,
    pub last_heart_beat: Option<Timestamp>,
}

/// The result of confirming a node's identity on a link.
///
/// When both ends of the cluster dial each other there are briefly two
/// connections to the same node. Both ends resolve the duplicate the same
/// way without negotiating: the connection dialed by the node with the lower
/// uuid survives. Arrival order decides nothing, so the two ends can never
/// disagree about which connection to keep.
#[derive(Debug, PartialEq)]
pub enum ConfirmOutcome {
    /// The node is now a live member of the cluster
    Alive { node_uuid: NodeUuid },
    /// The handshake already completed on this link, nothing changed
    AlreadyAlive,
    /// The link resolves to this same node
    Loopback,
    /// This link took over from an older connection to the same node, close
    /// the old link
    Replaced { close_link_id: Option<LinkId> },
    /// An older connection to the same node wins the tie-break, close this
    /// link
    Duplicate,
    /// No record is tracking this link
    UnknownLink,
}

/// The result of declaring a node dead
#[derive(Debug, PartialEq)]
pub enum DeadNodeOutcome {
    /// The node was alive or connecting and is now recorded dead
    MarkedDead {
        node_uuid: Option<NodeUuid>,
        link_id: Option<LinkId>,
    },
    /// The node was already dead or was never known, nothing changed
    NoOp,
}

struct TableState {
    records: Vec<NodeRecord>,
}

pub struct MembershipTable {
    my_uuid: NodeUuid,
    mutable: Mutex<TableState>,
    listeners: RwLock<Vec<Arc<dyn ClusterListener>>>,
}

impl MembershipTable {
    pub fn my_uuid(self: &Self) -> NodeUuid {
        self.my_uuid
    }

    pub fn new(my_uuid: NodeUuid) -> Self {
        Self {
            my_uuid,
            mutable: Mutex::new(TableState {
                records: Vec::new(),
            }),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn register_listener(self: &Self, listener: Arc<dyn ClusterListener>) {
        self.listeners.write().unwrap().push(listener);
    }

    /// Starts tracking a freshly opened link. The peer's identity is not
    /// known until the start handshake completes.
    pub fn add_connecting(self: &Self, address: &str, link_id: LinkId, outbound: bool, now: Timestamp) {
        debug!("MembershipTable: Tracking connection to {address} on link {link_id}");
        let mutable = &mut *self.mutable.lock().unwrap();
        mutable.records.push(NodeRecord {
            address: address.to_owned(),
            node_uuid: None,
            state: NodeState::Connecting,
            link_id: Some(link_id),
            outbound,
            is_loopback: false,
            last_heart_beat: None,
            created: now,
        });
    }

    /// The start handshake completed on a link, recording the peer's
    /// identity. The advertised address is the authority the peer listens
    /// on, which replaces the ephemeral address an inbound connection was
    /// first recorded under. Emits node_became_alive exactly once per node,
    /// however many connections complete a handshake.
    pub fn confirm_alive(
        self: &Self,
        link_id: LinkId,
        node_uuid: NodeUuid,
        advertised_address: Option<&str>,
        now: Timestamp,
    ) -> ConfirmOutcome {
        let outcome = {
            let mutable = &mut *self.mutable.lock().unwrap();

            let this_index = match mutable
                .records
                .iter()
                .position(|record| record.link_id == Some(link_id))
            {
                Some(index) => index,
                None => return ConfirmOutcome::UnknownLink,
            };

            if node_uuid == self.my_uuid {
                let record = &mut mutable.records[this_index];
                record.node_uuid = Some(node_uuid);
                record.is_loopback = true;
                ConfirmOutcome::Loopback
            } else if mutable.records[this_index].node_uuid == Some(node_uuid)
                && mutable.records[this_index].state == NodeState::Alive
            {
                ConfirmOutcome::AlreadyAlive
            } else {
                let existing_index = mutable.records.iter().position(|record| {
                    record.node_uuid == Some(node_uuid)
                        && record.state != NodeState::Dead
                        && record.link_id != Some(link_id)
                });

                match existing_index {
                    Some(existing_index) => {
                        // Two connections to the same node. The one dialed
                        // by the lower uuid survives on both ends.
                        let canonical =
                            mutable.records[this_index].outbound == (self.my_uuid < node_uuid);
                        if canonical {
                            let old_link_id =
                                mutable.records[existing_index].link_id.replace(link_id);
                            mutable.records[existing_index].outbound =
                                mutable.records[this_index].outbound;
                            mutable.records[existing_index].last_heart_beat = Some(now);
                            if let Some(address) = advertised_address {
                                mutable.records[existing_index].address = address.to_owned();
                            }
                            mutable.records.swap_remove(this_index);
                            ConfirmOutcome::Replaced {
                                close_link_id: old_link_id,
                            }
                        } else {
                            mutable.records.swap_remove(this_index);
                            ConfirmOutcome::Duplicate
                        }
                    }
                    None => {
                        let record = &mut mutable.records[this_index];
                        record.node_uuid = Some(node_uuid);
                        record.state = NodeState::Alive;
                        record.last_heart_beat = Some(now);
                        if let Some(address) = advertised_address {
                            record.address = address.to_owned();
                        }
                        ConfirmOutcome::Alive { node_uuid }
                    }
                }
            }
        };

        if let ConfirmOutcome::Alive { node_uuid } = outcome {
            info!("MembershipTable: Node {node_uuid} is alive");
            self.notify(|listener| listener.node_became_alive(node_uuid));
        }
        outcome
    }

    /// Declares the node with this identity dead. Idempotent, a node that is
    /// already dead stays dead and no second notification is emitted.
    pub fn dead_node(self: &Self, node_uuid: NodeUuid) -> DeadNodeOutcome {
        let outcome = {
            let mutable = &mut *self.mutable.lock().unwrap();
            match mutable.records.iter_mut().find(|record| {
                record.node_uuid == Some(node_uuid) && record.state != NodeState::Dead
            }) {
                Some(record) => {
                    record.state = NodeState::Dead;
                    let link_id = record.link_id.take();
                    DeadNodeOutcome::MarkedDead {
                        node_uuid: Some(node_uuid),
                        link_id,
                    }
                }
                None => DeadNodeOutcome::NoOp,
            }
        };

        if let DeadNodeOutcome::MarkedDead { .. } = outcome {
            info!("MembershipTable: Node {node_uuid} is dead");
            self.notify(|listener| listener.node_became_dead(node_uuid));
        }
        outcome
    }

    /// Declares the peer on a link dead. Used when the heart beat protocol
    /// trips before the peer's identity is known, in which case the record
    /// is dropped because there is no identity to remember.
    pub fn dead_link(self: &Self, link_id: LinkId) -> DeadNodeOutcome {
        let identified: Option<NodeUuid>;
        {
            let mutable = &mut *self.mutable.lock().unwrap();
            let index = match mutable
                .records
                .iter()
                .position(|record| record.link_id == Some(link_id))
            {
                Some(index) => index,
                None => return DeadNodeOutcome::NoOp,
            };

            let node_uuid = mutable.records[index].node_uuid;
            let is_loopback = mutable.records[index].is_loopback;

            if node_uuid.is_none() || is_loopback {
                mutable.records.swap_remove(index);
                return DeadNodeOutcome::MarkedDead {
                    node_uuid: None,
                    link_id: Some(link_id),
                };
            }
            identified = node_uuid;
        }

        match identified {
            Some(node_uuid) => self.dead_node(node_uuid),
            None => DeadNodeOutcome::NoOp,
        }
    }

    /// Records that a heart beat was seen from the node on this link
    pub fn touch(self: &Self, link_id: LinkId, now: Timestamp) {
        let mutable = &mut *self.mutable.lock().unwrap();
        if let Some(record) = mutable
            .records
            .iter_mut()
            .find(|record| record.link_id == Some(link_id))
        {
            record.last_heart_beat = Some(now);
        }
    }

    pub fn uuid_of_link(self: &Self, link_id: LinkId) -> Option<NodeUuid> {
        let mutable = self.mutable.lock().unwrap();
        mutable
            .records
            .iter()
            .find(|record| record.link_id == Some(link_id))?
            .node_uuid
    }

    pub fn state_of(self: &Self, node_uuid: NodeUuid) -> Option<NodeState> {
        let mutable = self.mutable.lock().unwrap();
        mutable
            .records
            .iter()
            .filter(|record| record.node_uuid == Some(node_uuid))
            .map(|record| record.state)
            .max_by_key(|state| match state {
                NodeState::Dead => 0,
                _ => 1,
            })
    }

    pub fn is_alive(self: &Self, node_uuid: NodeUuid) -> bool {
        self.state_of(node_uuid) == Some(NodeState::Alive)
    }

    /// The links to every live, non loopback member, used for broadcasts
    pub fn alive_links(self: &Self) -> Vec<LinkId> {
        let mutable = self.mutable.lock().unwrap();
        mutable
            .records
            .iter()
            .filter(|record| record.state == NodeState::Alive && !record.is_loopback)
            .filter_map(|record| record.link_id)
            .collect()
    }

    /// The identities of every live, non loopback member
    pub fn alive_nodes(self: &Self) -> Vec<NodeUuid> {
        let mutable = self.mutable.lock().unwrap();
        mutable
            .records
            .iter()
            .filter(|record| record.state == NodeState::Alive && !record.is_loopback)
            .filter_map(|record| record.node_uuid)
            .collect()
    }

    pub fn link_for_node(self: &Self, node_uuid: NodeUuid) -> Option<LinkId> {
        let mutable = self.mutable.lock().unwrap();
        mutable
            .records
            .iter()
            .find(|record| {
                record.node_uuid == Some(node_uuid) && record.state == NodeState::Alive
            })?
            .link_id
    }

    /// Whether a configured peer address needs no reconnect attempt because
    /// a record with a link is already tracking it
    pub fn has_link_to(self: &Self, address: &str) -> bool {
        let mutable = self.mutable.lock().unwrap();
        mutable
            .records
            .iter()
            .any(|record| record.address == address && record.link_id.is_some())
    }

    /// Drops records that have been in Connecting for longer than the start
    /// timeout and returns their links for closure
    pub fn connecting_timed_out(self: &Self, now: Timestamp, timeout: Timestamp) -> Vec<LinkId> {
        let mutable = &mut *self.mutable.lock().unwrap();
        let mut closed = Vec::new();
        mutable.records.retain(|record| {
            let expired = record.state == NodeState::Connecting
                && !record.is_loopback
                && now > record.created + timeout;
            if expired {
                if let Some(link_id) = record.link_id {
                    closed.push(link_id);
                }
            }
            !expired
        });
        closed
    }

    /// Merges records that point to the same node, keeping the record whose
    /// link was opened first. Returns the links of the merged away records
    /// for closure.
    pub fn coalesce(self: &Self) -> Vec<LinkId> {
        let mutable = &mut *self.mutable.lock().unwrap();
        let mut closed = Vec::new();

        let mut index = 0;
        while index < mutable.records.len() {
            let duplicate = {
                let record = &mutable.records[index];
                record.state != NodeState::Dead
                    && mutable.records[..index].iter().any(|earlier| {
                        earlier.state != NodeState::Dead
                            && earlier.link_id.is_some()
                            && (earlier.address == record.address
                                || (earlier.node_uuid.is_some()
                                    && earlier.node_uuid == record.node_uuid))
                    })
            };
            if duplicate {
                let record = mutable.records.remove(index);
                if let Some(link_id) = record.link_id {
                    info!(
                        "MembershipTable: Coalescing duplicate record for {} on link {link_id}",
                        record.address
                    );
                    closed.push(link_id);
                }
            } else {
                index += 1;
            }
        }
        closed
    }

    /// A snapshot of every record in the table, dead ones included
    pub fn nodes(self: &Self) -> Vec<NodeView> {
        let mutable = self.mutable.lock().unwrap();
        mutable
            .records
            .iter()
            .map(|record| NodeView {
                address: record.address.clone(),
                node_uuid: record.node_uuid,
                state: record.state,
                link_id: record.link_id,
                is_loopback: record.is_loopback,
                last_heart_beat: record.last_heart_beat,
            })
            .collect()
    }

    pub fn node_count(self: &Self) -> usize {
        self.mutable.lock().unwrap().records.len()
    }

    /// Tells every registered listener that a ballot resolved. Called by the
    /// ballot coordinator, routed through the table because it owns the
    /// listener registrations.
    pub fn notify_ballot_resolved(self: &Self, subject: BallotSubject, winner: NodeUuid) {
        self.notify(|listener| listener.ballot_resolved(subject, winner));
    }

    /// Tells every registered listener that the message log should compact
    pub fn notify_compaction_due(self: &Self) {
        self.notify(|listener| listener.compaction_due());
    }

    fn notify(self: &Self, notification: impl Fn(&Arc<dyn ClusterListener>)) {
        for listener in self.listeners.read().unwrap().iter() {
            notification(listener);
        }
    }
}
