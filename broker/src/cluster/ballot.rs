/*
When a node dies, the survivors hold a ballot to decide which of them takes
over the dead node's responsibilities. This is a single round of best-bid
negotiation, not a consensus protocol. The initiator broadcasts an auction,
every live node replies with a bid, and the highest bid wins with ties broken
toward the lowest node uuid. Missing bids are no vote, never a winning
default. A ballot resolves exactly once, at the earlier of every expected
participant bidding or the auction deadline.
*/

use log::{debug, info, warn};
use std::{
    cmp::Reverse,
    collections::HashMap,
    sync::{mpsc::Sender, Arc, Mutex, Weak},
    time::Duration,
};

use courier_net::{
    bin_serialization::ClusterMessage,
    contracts::v1,
    data_types::{BallotSubject, BidValue, NodeUuid, Timestamp},
};

use crate::{
    alarms::{AlarmClock, AlarmKind, AlarmResult, Alarmable},
    utils::now_epoc_millis,
};

use super::membership::MembershipTable;

/// Computes this node's bid for a subject. The default policy bids a random
/// value. Replace it with a load or capacity based policy to make takeover
/// decisions less arbitrary.
pub trait BidPolicy: Send + Sync {
    fn bid(&self, subject: &BallotSubject) -> BidValue;
}

pub struct RandomBidPolicy;

impl BidPolicy for RandomBidPolicy {
    fn bid(&self, _subject: &BallotSubject) -> BidValue {
        rand::random()
    }
}

/// A message the coordinator wants sent to other nodes. The cluster service
/// drains these and writes them to the right links.
pub enum OutboundMessage {
    Broadcast(ClusterMessage),
    ToNode(NodeUuid, ClusterMessage),
}

/// One round of negotiation over a single subject
pub struct Ballot {
    subject: BallotSubject,
    initiator: NodeUuid,
    deadline: Timestamp,
    bids: HashMap<NodeUuid, Option<BidValue>>,
    resolved: bool,
}

impl Ballot {
    pub fn subject(self: &Self) -> BallotSubject {
        self.subject
    }
    pub fn initiator(self: &Self) -> NodeUuid {
        self.initiator
    }
    pub fn deadline(self: &Self) -> Timestamp {
        self.deadline
    }
    pub fn is_resolved(self: &Self) -> bool {
        self.resolved
    }

    pub fn new(
        subject: BallotSubject,
        initiator: NodeUuid,
        participants: impl Iterator<Item = NodeUuid>,
        deadline: Timestamp,
    ) -> Self {
        Self {
            subject,
            initiator,
            deadline,
            bids: participants.map(|node_uuid| (node_uuid, None)).collect(),
            resolved: false,
        }
    }

    /// Records a bid from a participant. Bids after resolution and bids from
    /// nodes that are not expected participants are ignored.
    pub fn record_bid(self: &mut Self, node_uuid: NodeUuid, value: BidValue) {
        if self.resolved {
            debug!("Ballot: Ignoring a bid for {} after resolution", self.subject);
            return;
        }
        match self.bids.get_mut(&node_uuid) {
            Some(bid) => *bid = Some(value),
            None => debug!(
                "Ballot: Ignoring a bid for {} from {node_uuid} which is not a participant",
                self.subject
            ),
        }
    }

    /// Whether every expected participant has bid
    pub fn all_bids_in(self: &Self) -> bool {
        self.bids.values().all(|bid| bid.is_some())
    }

    /// Resolves the ballot, choosing the winner from the bids recorded so
    /// far. Returns None if the ballot was already resolved. When no bids at
    /// all were recorded the initiator is the only visible survivor and wins
    /// by default.
    pub fn resolve(self: &mut Self) -> Option<NodeUuid> {
        if self.resolved {
            return None;
        }
        self.resolved = true;

        let winner = self
            .bids
            .iter()
            .filter_map(|(node_uuid, bid)| bid.map(|value| (value, Reverse(*node_uuid))))
            .max()
            .map(|(_, Reverse(node_uuid))| node_uuid)
            .unwrap_or(self.initiator);

        Some(winner)
    }
}

/// A ballot we bid in that was opened by another node. If the initiator dies
/// before the deadline someone has to re-open the auction.
struct AwaitingInitiator {
    initiator: NodeUuid,
    deadline: Timestamp,
}

struct MutableState {
    ballots: Vec<Ballot>,
    awaiting: HashMap<BallotSubject, AwaitingInitiator>,
}

/// Runs the auction/bid negotiation for this node, both as initiator and as
/// participant in other nodes' ballots
pub struct BallotCoordinator {
    my_uuid: NodeUuid,
    membership: Arc<MembershipTable>,
    policy: Box<dyn BidPolicy>,
    alarm_clock: Arc<AlarmClock>,
    outbound_tx: Sender<OutboundMessage>,
    auction_timeout: Timestamp,
    bid_timeout: Timestamp,
    weak_self: Weak<BallotCoordinator>,
    mutable: Mutex<MutableState>,
}

impl BallotCoordinator {
    pub fn new(
        membership: &Arc<MembershipTable>,
        policy: Box<dyn BidPolicy>,
        alarm_clock: &Arc<AlarmClock>,
        outbound_tx: Sender<OutboundMessage>,
        auction_timeout: Timestamp,
        bid_timeout: Timestamp,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            my_uuid: membership.my_uuid(),
            membership: Arc::clone(membership),
            policy,
            alarm_clock: Arc::clone(alarm_clock),
            outbound_tx,
            auction_timeout,
            bid_timeout,
            weak_self: weak_self.clone(),
            mutable: Mutex::new(MutableState {
                ballots: Vec::new(),
                awaiting: HashMap::new(),
            }),
        })
    }

    /// The number of ballots still open, for observability
    pub fn open_ballot_count(self: &Self) -> usize {
        self.mutable.lock().unwrap().ballots.len()
    }

    /// Opens a ballot for a subject and broadcasts the auction to every live
    /// node. This node bids in its own ballot like any other participant.
    pub fn begin_ballot(self: &Self, subject: BallotSubject) {
        let now = now_epoc_millis();
        let mut participants = self.membership.alive_nodes();
        participants.push(self.my_uuid);

        let mut ballot = Ballot::new(
            subject,
            self.my_uuid,
            participants.into_iter(),
            now + self.auction_timeout,
        );
        ballot.record_bid(self.my_uuid, self.policy.bid(&subject));
        let complete = ballot.all_bids_in();

        {
            let mutable = &mut *self.mutable.lock().unwrap();
            if mutable
                .ballots
                .iter()
                .any(|open| open.subject() == subject)
            {
                debug!("BallotCoordinator: A ballot for {subject} is already open");
                return;
            }
            mutable.ballots.push(ballot);
        }

        info!("BallotCoordinator: Opened a ballot for {subject}");
        let _ = self.outbound_tx.send(OutboundMessage::Broadcast(
            ClusterMessage::Auction(v1::Auction {
                subject,
                sender: self.my_uuid,
            }),
        ));

        if let Some(coordinator) = self.weak_self.upgrade() {
            self.alarm_clock.schedule_once(
                coordinator,
                AlarmKind::Auction,
                Duration::from_millis(self.auction_timeout),
            );
        }

        // Sole node in the cluster, nobody else can bid
        if complete {
            self.resolve_ballot(subject);
        }
    }

    /// Another node opened a ballot. Reply with our bid and remember to
    /// check later that the initiator survived long enough to resolve it.
    pub fn on_auction(self: &Self, subject: BallotSubject, sender: NodeUuid) {
        if sender == self.my_uuid {
            return;
        }

        let value = self.policy.bid(&subject);
        let _ = self
            .outbound_tx
            .send(OutboundMessage::ToNode(
                sender,
                ClusterMessage::Bid(v1::Bid {
                    subject,
                    sender: self.my_uuid,
                    value,
                }),
            ));

        let now = now_epoc_millis();
        {
            let mutable = &mut *self.mutable.lock().unwrap();
            mutable.awaiting.insert(
                subject,
                AwaitingInitiator {
                    initiator: sender,
                    deadline: now + self.bid_timeout,
                },
            );
        }

        if let Some(coordinator) = self.weak_self.upgrade() {
            self.alarm_clock.schedule_once(
                coordinator,
                AlarmKind::Bid,
                Duration::from_millis(self.bid_timeout),
            );
        }
    }

    /// A bid arrived for a ballot this node initiated. Resolves the ballot
    /// early once every expected participant has bid. Bids for ballots that
    /// already resolved are ignored, that is an expected race.
    pub fn record_bid(self: &Self, subject: BallotSubject, node_uuid: NodeUuid, value: BidValue) {
        let complete = {
            let mutable = &mut *self.mutable.lock().unwrap();
            match mutable
                .ballots
                .iter_mut()
                .find(|ballot| ballot.subject() == subject)
            {
                Some(ballot) => {
                    ballot.record_bid(node_uuid, value);
                    ballot.all_bids_in()
                }
                None => {
                    debug!("BallotCoordinator: Ignoring a bid for {subject} with no open ballot");
                    false
                }
            }
        };

        if complete {
            self.resolve_ballot(subject);
        }
    }

    /// Resolves every open ballot whose deadline has passed
    pub fn resolve_due(self: &Self, now: Timestamp) {
        let due: Vec<BallotSubject> = {
            let mutable = self.mutable.lock().unwrap();
            mutable
                .ballots
                .iter()
                .filter(|ballot| now >= ballot.deadline())
                .map(|ballot| ballot.subject())
                .collect()
        };

        for subject in due {
            self.resolve_ballot(subject);
        }
    }

    /// Bid timeouts fired. Any ballot whose initiator died before resolving
    /// it is re-auctioned from here, otherwise the cluster would wedge on a
    /// double failure.
    pub fn check_awaiting(self: &Self, now: Timestamp) {
        let expired: Vec<(BallotSubject, NodeUuid)> = {
            let mutable = &mut *self.mutable.lock().unwrap();
            let subjects: Vec<BallotSubject> = mutable
                .awaiting
                .iter()
                .filter(|(_, awaiting)| now >= awaiting.deadline)
                .map(|(subject, _)| *subject)
                .collect();
            subjects
                .into_iter()
                .map(|subject| {
                    let awaiting = mutable.awaiting.remove(&subject).unwrap();
                    (subject, awaiting.initiator)
                })
                .collect()
        };

        for (subject, initiator) in expired {
            if !self.membership.is_alive(initiator) {
                warn!(
                    "BallotCoordinator: Initiator {initiator} died mid ballot, re-auctioning {subject}"
                );
                self.begin_ballot(subject);
            }
        }
    }

    fn resolve_ballot(self: &Self, subject: BallotSubject) {
        let resolution = {
            let mutable = &mut *self.mutable.lock().unwrap();
            match mutable
                .ballots
                .iter()
                .position(|ballot| ballot.subject() == subject)
            {
                Some(index) => {
                    let mut ballot = mutable.ballots.swap_remove(index);
                    ballot.resolve()
                }
                None => None,
            }
        };

        if let Some(winner) = resolution {
            info!("BallotCoordinator: Ballot for {subject} resolved, winner is {winner}");
            self.membership.notify_ballot_resolved(subject, winner);
        }
    }
}

impl Alarmable for BallotCoordinator {
    fn on_alarm(&self, alarm: AlarmKind) -> AlarmResult {
        match alarm {
            AlarmKind::Auction => self.resolve_due(now_epoc_millis()),
            // The dead node timeout is a backstop that forces any ballot
            // that should have closed by now to resolve with what it has
            AlarmKind::DeadNode => self.resolve_due(now_epoc_millis()),
            AlarmKind::Bid => self.check_awaiting(now_epoc_millis()),
            _ => {}
        }
        Ok(())
    }
}
