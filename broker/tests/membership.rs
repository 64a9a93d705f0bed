use std::sync::{Arc, Mutex};

use courier_broker::cluster::{
    membership::{ConfirmOutcome, DeadNodeOutcome, MembershipTable, NodeState},
    ClusterListener,
};
use courier_net::data_types::NodeUuid;

#[derive(Default)]
struct RecordingListener {
    alive: Mutex<Vec<NodeUuid>>,
    dead: Mutex<Vec<NodeUuid>>,
}

impl ClusterListener for RecordingListener {
    fn node_became_alive(&self, node_uuid: NodeUuid) {
        self.alive.lock().unwrap().push(node_uuid);
    }

    fn node_became_dead(&self, node_uuid: NodeUuid) {
        self.dead.lock().unwrap().push(node_uuid);
    }
}

struct Fixture {
    table: MembershipTable,
    listener: Arc<RecordingListener>,
}

fn fixture() -> Fixture {
    let table = MembershipTable::new(NodeUuid::new_v4());
    let listener = Arc::new(RecordingListener::default());
    table.register_listener(listener.clone());
    Fixture { table, listener }
}

#[test]
fn a_handshake_moves_a_node_from_connecting_to_alive() {
    let fixture = fixture();
    let peer = NodeUuid::new_v4();

    fixture.table.add_connecting("10.0.22.1:8002", 1, true, 1000);
    assert_eq!(fixture.table.nodes()[0].state, NodeState::Connecting);
    assert_eq!(fixture.table.alive_nodes().len(), 0);

    let outcome = fixture.table.confirm_alive(1, peer, None, 1500);

    assert_eq!(outcome, ConfirmOutcome::Alive { node_uuid: peer });
    assert_eq!(fixture.table.state_of(peer), Some(NodeState::Alive));
    assert_eq!(fixture.table.alive_nodes(), vec![peer]);
    assert_eq!(*fixture.listener.alive.lock().unwrap(), vec![peer]);
}

#[test]
fn confirming_the_same_link_twice_notifies_once() {
    let fixture = fixture();
    let peer = NodeUuid::new_v4();

    fixture.table.add_connecting("10.0.22.1:8002", 1, true, 1000);
    fixture.table.confirm_alive(1, peer, None, 1500);
    let outcome = fixture.table.confirm_alive(1, peer, None, 1600);

    assert_eq!(outcome, ConfirmOutcome::AlreadyAlive);
    assert_eq!(fixture.listener.alive.lock().unwrap().len(), 1);
}

#[test]
fn dead_node_notifies_exactly_once() {
    let fixture = fixture();
    let peer = NodeUuid::new_v4();

    fixture.table.add_connecting("10.0.22.1:8002", 1, true, 1000);
    fixture.table.confirm_alive(1, peer, None, 1500);

    let first = fixture.table.dead_node(peer);
    let second = fixture.table.dead_node(peer);

    assert_eq!(
        first,
        DeadNodeOutcome::MarkedDead {
            node_uuid: Some(peer),
            link_id: Some(1),
        }
    );
    assert_eq!(second, DeadNodeOutcome::NoOp);
    assert_eq!(*fixture.listener.dead.lock().unwrap(), vec![peer]);
}

#[test]
fn a_dead_node_is_recorded_not_removed() {
    let fixture = fixture();
    let peer = NodeUuid::new_v4();

    fixture.table.add_connecting("10.0.22.1:8002", 1, true, 1000);
    fixture.table.confirm_alive(1, peer, None, 1500);
    fixture.table.dead_node(peer);

    assert_eq!(fixture.table.node_count(), 1);
    assert_eq!(fixture.table.state_of(peer), Some(NodeState::Dead));
    assert_eq!(fixture.table.alive_nodes().len(), 0);
}

#[test]
fn a_reappearing_node_gets_a_new_record() {
    let fixture = fixture();
    let peer = NodeUuid::new_v4();

    fixture.table.add_connecting("10.0.22.1:8002", 1, true, 1000);
    fixture.table.confirm_alive(1, peer, None, 1500);
    fixture.table.dead_node(peer);

    // The same identity reappears on a fresh connection
    fixture.table.add_connecting("10.0.22.1:8002", 2, true, 5000);
    let outcome = fixture.table.confirm_alive(2, peer, None, 5500);

    assert_eq!(outcome, ConfirmOutcome::Alive { node_uuid: peer });
    assert_eq!(fixture.table.node_count(), 2);
    assert_eq!(fixture.table.state_of(peer), Some(NodeState::Alive));

    // The old record was not resurrected
    let dead_records = fixture
        .table
        .nodes()
        .iter()
        .filter(|node| node.state == NodeState::Dead)
        .count();
    assert_eq!(dead_records, 1);
    assert_eq!(fixture.listener.alive.lock().unwrap().len(), 2);
}

#[test]
fn the_connection_dialed_by_the_lower_uuid_wins_the_tie_break() {
    let low = NodeUuid::nil();
    let table = MembershipTable::new(low);
    let peer = NodeUuid::new_v4();
    assert!(low < peer);

    // Our outbound dial completes its handshake first
    table.add_connecting("10.0.22.1:8002", 1, true, 1000);
    table.confirm_alive(1, peer, None, 1500);

    // Then the peer's own dial to us identifies itself. We dialed and our
    // uuid is lower, so the inbound connection loses.
    table.add_connecting("10.0.22.9:49152", 2, false, 1600);
    let outcome = table.confirm_alive(2, peer, Some("10.0.22.1:8002"), 1700);

    assert_eq!(outcome, ConfirmOutcome::Duplicate);
    assert_eq!(table.link_for_node(peer), Some(1));
}

#[test]
fn a_canonical_connection_replaces_an_earlier_one() {
    let low = NodeUuid::nil();
    let table = MembershipTable::new(low);
    let peer = NodeUuid::new_v4();

    // The peer's dial to us completes first
    table.add_connecting("10.0.22.9:49152", 1, false, 1000);
    table.confirm_alive(1, peer, Some("10.0.22.1:8002"), 1500);

    // Then our own outbound dial completes. We dialed and our uuid is
    // lower, so our connection takes over and the old link is closed.
    table.add_connecting("10.0.22.1:8002", 2, true, 1600);
    let outcome = table.confirm_alive(2, peer, None, 1700);

    assert_eq!(
        outcome,
        ConfirmOutcome::Replaced {
            close_link_id: Some(1),
        }
    );
    assert_eq!(table.link_for_node(peer), Some(2));
    assert_eq!(table.node_count(), 1);
}

#[test]
fn a_loopback_connection_is_never_a_peer() {
    let my_uuid = NodeUuid::new_v4();
    let table = MembershipTable::new(my_uuid);

    table.add_connecting("127.0.0.1:8002", 1, true, 1000);
    let outcome = table.confirm_alive(1, my_uuid, None, 1500);

    assert_eq!(outcome, ConfirmOutcome::Loopback);
    assert_eq!(table.alive_nodes().len(), 0);
    assert_eq!(table.alive_links().len(), 0);
}

#[test]
fn handshakes_that_never_complete_are_timed_out() {
    let fixture = fixture();

    fixture.table.add_connecting("10.0.22.1:8002", 1, true, 1000);
    fixture.table.add_connecting("10.0.22.2:8002", 2, true, 5000);

    let closed = fixture.table.connecting_timed_out(5500, 1000);

    assert_eq!(closed, vec![1]);
    assert_eq!(fixture.table.node_count(), 1);
}

#[test]
fn coalesce_merges_records_for_the_same_address() {
    let fixture = fixture();

    fixture.table.add_connecting("10.0.22.1:8002", 1, true, 1000);
    fixture.table.add_connecting("10.0.22.1:8002", 2, true, 1100);

    let closed = fixture.table.coalesce();

    assert_eq!(closed, vec![2]);
    assert_eq!(fixture.table.node_count(), 1);
}

#[test]
fn dead_link_before_the_handshake_drops_the_record_silently() {
    let fixture = fixture();

    fixture.table.add_connecting("10.0.22.1:8002", 1, true, 1000);
    let outcome = fixture.table.dead_link(1);

    assert_eq!(
        outcome,
        DeadNodeOutcome::MarkedDead {
            node_uuid: None,
            link_id: Some(1),
        }
    );
    assert_eq!(fixture.table.node_count(), 0);
    assert_eq!(fixture.listener.dead.lock().unwrap().len(), 0);
}

#[test]
fn dead_link_after_the_handshake_declares_the_node_dead() {
    let fixture = fixture();
    let peer = NodeUuid::new_v4();

    fixture.table.add_connecting("10.0.22.1:8002", 1, true, 1000);
    fixture.table.confirm_alive(1, peer, None, 1500);

    let outcome = fixture.table.dead_link(1);

    assert_eq!(
        outcome,
        DeadNodeOutcome::MarkedDead {
            node_uuid: Some(peer),
            link_id: Some(1),
        }
    );
    assert_eq!(*fixture.listener.dead.lock().unwrap(), vec![peer]);
}
