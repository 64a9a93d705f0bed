/*
Version 1 data contracts for the messages that nodes exchange over cluster
links. Heart beats are not contracts, they are a reserved frame recognized
before deserialization, see the frames module.
*/

use crate::data_types::{BallotSubject, BidValue, NodeUuid, PortNumber};
use serde::{Deserialize, Serialize};

/// Announces this node's identity on a newly opened link
#[derive(Serialize, Deserialize)]
#[cfg_attr(debug_assertions, derive(Debug))]
pub struct Start {
    pub node_uuid: NodeUuid,
    pub ip_address: String,
    pub port: PortNumber,
}

/// Confirms receipt of a Start, completing the handshake on a link
#[derive(Serialize, Deserialize)]
#[cfg_attr(debug_assertions, derive(Debug))]
pub struct StartAck {
    pub node_uuid: NodeUuid,
}

/// Broadcast to the survivors when a node has been declared dead
#[derive(Serialize, Deserialize)]
#[cfg_attr(debug_assertions, derive(Debug))]
pub struct DeadNode {
    pub node_uuid: NodeUuid,
    pub sender: NodeUuid,
}

/// Opens a ballot deciding which survivor takes over the subject
#[derive(Serialize, Deserialize)]
#[cfg_attr(debug_assertions, derive(Debug))]
pub struct Auction {
    pub subject: BallotSubject,
    pub sender: NodeUuid,
}

/// One participant's bid in an open ballot
#[derive(Serialize, Deserialize)]
#[cfg_attr(debug_assertions, derive(Debug))]
pub struct Bid {
    pub subject: BallotSubject,
    pub sender: NodeUuid,
    pub value: BidValue,
}
