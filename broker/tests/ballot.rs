use std::sync::{
    mpsc::{channel, Receiver},
    Arc, Mutex,
};

use courier_broker::{
    alarms::AlarmClock,
    cluster::{
        ballot::{Ballot, BallotCoordinator, BidPolicy, OutboundMessage},
        membership::MembershipTable,
        ClusterListener,
    },
    utils::now_epoc_millis,
};
use courier_net::{
    bin_serialization::ClusterMessage,
    data_types::{BallotSubject, BidValue, NodeUuid},
};

struct FixedBidPolicy {
    value: BidValue,
}

impl BidPolicy for FixedBidPolicy {
    fn bid(&self, _subject: &BallotSubject) -> BidValue {
        self.value
    }
}

#[derive(Default)]
struct RecordingListener {
    resolved: Mutex<Vec<(BallotSubject, NodeUuid)>>,
}

impl ClusterListener for RecordingListener {
    fn ballot_resolved(&self, subject: BallotSubject, winner: NodeUuid) {
        self.resolved.lock().unwrap().push((subject, winner));
    }
}

fn ordered_uuids(count: usize) -> Vec<NodeUuid> {
    let mut uuids: Vec<NodeUuid> = (0..count).map(|_| NodeUuid::new_v4()).collect();
    uuids.sort();
    uuids
}

#[test]
fn the_highest_bid_wins_regardless_of_arrival_order() {
    let uuids = ordered_uuids(3);
    let (a, b, c) = (uuids[0], uuids[1], uuids[2]);
    let initiator = a;

    let arrival_orders = [[a, b, c], [c, b, a], [b, a, c]];
    for order in arrival_orders {
        let mut ballot = Ballot::new(
            NodeUuid::new_v4(),
            initiator,
            uuids.iter().copied(),
            now_epoc_millis() + 1000,
        );
        for node in order {
            let value = match node {
                node if node == a => 5,
                node if node == b => 9,
                _ => 2,
            };
            ballot.record_bid(node, value);
        }
        assert!(ballot.all_bids_in());
        assert_eq!(ballot.resolve(), Some(b));
    }
}

#[test]
fn equal_bids_break_toward_the_lowest_uuid() {
    let uuids = ordered_uuids(3);
    let mut ballot = Ballot::new(
        NodeUuid::new_v4(),
        uuids[2],
        uuids.iter().copied(),
        now_epoc_millis() + 1000,
    );

    for node in &uuids {
        ballot.record_bid(*node, 7);
    }

    assert_eq!(ballot.resolve(), Some(uuids[0]));
}

#[test]
fn a_ballot_resolves_exactly_once() {
    let uuids = ordered_uuids(2);
    let mut ballot = Ballot::new(
        NodeUuid::new_v4(),
        uuids[0],
        uuids.iter().copied(),
        now_epoc_millis() + 1000,
    );

    ballot.record_bid(uuids[0], 3);
    ballot.record_bid(uuids[1], 8);

    assert_eq!(ballot.resolve(), Some(uuids[1]));
    assert_eq!(ballot.resolve(), None);
    assert!(ballot.is_resolved());
}

#[test]
fn missing_bids_are_no_vote() {
    let uuids = ordered_uuids(3);
    let mut ballot = Ballot::new(
        NodeUuid::new_v4(),
        uuids[1],
        uuids.iter().copied(),
        now_epoc_millis() + 1000,
    );

    // Only the lowest uuid bids, and with a low value. It still wins
    // because nodes that never bid cannot.
    ballot.record_bid(uuids[0], 1);

    assert!(!ballot.all_bids_in());
    assert_eq!(ballot.resolve(), Some(uuids[0]));
}

#[test]
fn a_ballot_with_no_bids_falls_back_to_the_initiator() {
    let uuids = ordered_uuids(3);
    let mut ballot = Ballot::new(
        NodeUuid::new_v4(),
        uuids[1],
        uuids.iter().copied(),
        now_epoc_millis() + 1000,
    );

    assert_eq!(ballot.resolve(), Some(uuids[1]));
}

struct CoordinatorFixture {
    membership: Arc<MembershipTable>,
    coordinator: Arc<BallotCoordinator>,
    listener: Arc<RecordingListener>,
    outbound_rx: Receiver<OutboundMessage>,
    clock: Arc<AlarmClock>,
}

fn coordinator_fixture(my_bid: BidValue) -> CoordinatorFixture {
    let membership = Arc::new(MembershipTable::new(NodeUuid::new_v4()));
    let listener = Arc::new(RecordingListener::default());
    membership.register_listener(listener.clone());

    let clock = AlarmClock::new();
    let (outbound_tx, outbound_rx) = channel();
    let coordinator = BallotCoordinator::new(
        &membership,
        Box::new(FixedBidPolicy { value: my_bid }),
        &clock,
        outbound_tx,
        1000,
        1000,
    );

    CoordinatorFixture {
        membership,
        coordinator,
        listener,
        outbound_rx,
        clock,
    }
}

#[test]
fn a_sole_survivor_ballot_resolves_immediately() {
    let fixture = coordinator_fixture(42);
    let subject = NodeUuid::new_v4();

    fixture.coordinator.begin_ballot(subject);

    let resolved = fixture.listener.resolved.lock().unwrap();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0], (subject, fixture.membership.my_uuid()));

    // The auction was still broadcast so that any node we cannot see can
    // re-open it if it disagrees
    match fixture.outbound_rx.try_recv() {
        Ok(OutboundMessage::Broadcast(ClusterMessage::Auction(auction))) => {
            assert_eq!(auction.subject, subject);
            assert_eq!(auction.sender, fixture.membership.my_uuid());
        }
        _ => panic!("Expected an auction broadcast"),
    }
    fixture.clock.stop();
}

#[test]
fn bids_after_resolution_are_ignored() {
    let fixture = coordinator_fixture(42);
    let subject = NodeUuid::new_v4();

    fixture.coordinator.begin_ballot(subject);
    assert_eq!(fixture.coordinator.open_ballot_count(), 0);

    // A late bid arrives after the ballot resolved
    fixture
        .coordinator
        .record_bid(subject, NodeUuid::new_v4(), 9999);

    let resolved = fixture.listener.resolved.lock().unwrap();
    assert_eq!(resolved.len(), 1);
    fixture.clock.stop();
}

#[test]
fn a_participant_reauctions_when_the_initiator_dies() {
    let fixture = coordinator_fixture(7);
    let subject = NodeUuid::new_v4();
    let initiator = NodeUuid::new_v4();

    // Another node opened a ballot, we bid in it
    fixture.coordinator.on_auction(subject, initiator);

    match fixture.outbound_rx.try_recv() {
        Ok(OutboundMessage::ToNode(target, ClusterMessage::Bid(bid))) => {
            assert_eq!(target, initiator);
            assert_eq!(bid.subject, subject);
            assert_eq!(bid.value, 7);
        }
        _ => panic!("Expected a bid reply to the initiator"),
    }

    // The bid timeout passes and the initiator is not a live member, so
    // this node re-opens the auction and, being alone, wins it
    fixture
        .coordinator
        .check_awaiting(now_epoc_millis() + 10000);

    let resolved = fixture.listener.resolved.lock().unwrap();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0], (subject, fixture.membership.my_uuid()));
    fixture.clock.stop();
}
