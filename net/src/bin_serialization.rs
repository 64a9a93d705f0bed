/*
Wraps each cluster message in an envelope that contains the type that was
serialized, then serializes and deserilizes these messages to byte arrays for
transmission over Tcp. Heart beat frames never pass through here, they are
recognized from the raw bytes before the decoder is consulted.
*/

use rmp_serde::{Deserializer, Serializer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    contracts::v1,
    sockets::{buffer_pool::BufferPool, MessageLength},
};

pub type SerializeResult = Result<Vec<u8>, SerializeError>;
pub type DeserializeResult<T> = Result<T, DeserializeError>;

#[derive(Debug, PartialEq)]
pub enum SerializeError {
    Error { msg: String },
}

#[derive(Debug, PartialEq)]
pub enum DeserializeError {
    Error { msg: String },
    UnknownMessageType { message_type: MessageTypeId },
}

/// A message received from or destined for another node in the cluster
#[cfg_attr(debug_assertions, derive(Debug))]
pub enum ClusterMessage {
    Start(v1::Start),
    StartAck(v1::StartAck),
    DeadNode(v1::DeadNode),
    Auction(v1::Auction),
    Bid(v1::Bid),
}

pub type MessageTypeId = u16;

const BUFFER_CAPACITY: MessageLength = 256;
const MESSAGE_TYPE_SIZE: usize = size_of::<MessageTypeId>();

const START_MESSAGE_TYPE_ID: MessageTypeId = 1;
const START_ACK_MESSAGE_TYPE_ID: MessageTypeId = 2;
const DEAD_NODE_MESSAGE_TYPE_ID: MessageTypeId = 3;
const AUCTION_MESSAGE_TYPE_ID: MessageTypeId = 4;
const BID_MESSAGE_TYPE_ID: MessageTypeId = 5;

pub struct ClusterSerializer {
    buffer_pool: Arc<BufferPool>,
}

impl ClusterSerializer {
    pub fn new(buffer_pool: &Arc<BufferPool>) -> Self {
        Self {
            buffer_pool: buffer_pool.clone(),
        }
    }

    pub fn serialize_message(self: &Self, message: &ClusterMessage) -> SerializeResult {
        match message {
            ClusterMessage::Start(start) => self.serialize_entity(start, START_MESSAGE_TYPE_ID),
            ClusterMessage::StartAck(start_ack) => {
                self.serialize_entity(start_ack, START_ACK_MESSAGE_TYPE_ID)
            }
            ClusterMessage::DeadNode(dead_node) => {
                self.serialize_entity(dead_node, DEAD_NODE_MESSAGE_TYPE_ID)
            }
            ClusterMessage::Auction(auction) => {
                self.serialize_entity(auction, AUCTION_MESSAGE_TYPE_ID)
            }
            ClusterMessage::Bid(bid) => self.serialize_entity(bid, BID_MESSAGE_TYPE_ID),
        }
    }

    pub fn deserialize_message(self: &Self, buffer: Vec<u8>) -> DeserializeResult<ClusterMessage> {
        let message_type = self.extract_message_type(&buffer);

        match message_type {
            START_MESSAGE_TYPE_ID => match self.deserialize_entity::<v1::Start>(buffer) {
                Ok(start) => Ok(ClusterMessage::Start(start)),
                Err(err) => Err(err),
            },
            START_ACK_MESSAGE_TYPE_ID => match self.deserialize_entity::<v1::StartAck>(buffer) {
                Ok(start_ack) => Ok(ClusterMessage::StartAck(start_ack)),
                Err(err) => Err(err),
            },
            DEAD_NODE_MESSAGE_TYPE_ID => match self.deserialize_entity::<v1::DeadNode>(buffer) {
                Ok(dead_node) => Ok(ClusterMessage::DeadNode(dead_node)),
                Err(err) => Err(err),
            },
            AUCTION_MESSAGE_TYPE_ID => match self.deserialize_entity::<v1::Auction>(buffer) {
                Ok(auction) => Ok(ClusterMessage::Auction(auction)),
                Err(err) => Err(err),
            },
            BID_MESSAGE_TYPE_ID => match self.deserialize_entity::<v1::Bid>(buffer) {
                Ok(bid) => Ok(ClusterMessage::Bid(bid)),
                Err(err) => Err(err),
            },
            _ => Err(DeserializeError::UnknownMessageType { message_type }),
        }
    }

    fn serialize_entity<T: Serialize>(
        self: &Self,
        entity: &T,
        message_type_id: MessageTypeId,
    ) -> SerializeResult {
        let mut buffer = self.buffer_pool.get_with_capacity(0, BUFFER_CAPACITY);
        buffer.extend_from_slice(&message_type_id.to_le_bytes());
        let mut serializer = Serializer::new(&mut buffer);
        match entity.serialize(&mut serializer) {
            Ok(_) => Ok(buffer),
            Err(err) => Err(SerializeError::Error {
                msg: format!("{err}"),
            }),
        }
    }

    fn extract_message_type(self: &Self, buffer: &Vec<u8>) -> MessageTypeId {
        if buffer.len() < MESSAGE_TYPE_SIZE {
            return 0;
        }
        MessageTypeId::from_le_bytes(buffer[0..MESSAGE_TYPE_SIZE].try_into().unwrap())
    }

    fn deserialize_entity<'a, T>(self: &Self, buffer: Vec<u8>) -> DeserializeResult<T>
    where
        T: Deserialize<'a>,
    {
        let mut deserializer = Deserializer::new(&buffer[MESSAGE_TYPE_SIZE..]);
        let result = match Deserialize::deserialize(&mut deserializer) {
            Ok(entity) => DeserializeResult::Ok(entity),
            Err(err) => Err(DeserializeError::Error {
                msg: format!("{err:?}"),
            }),
        };
        self.buffer_pool.reuse(buffer);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_types::NodeUuid;

    fn serializer() -> ClusterSerializer {
        ClusterSerializer::new(&Arc::new(BufferPool::new()))
    }

    #[test]
    fn roundtrip_start() {
        let serializer = serializer();
        let node_uuid = NodeUuid::new_v4();

        let original = ClusterMessage::Start(v1::Start {
            node_uuid,
            ip_address: String::from("10.0.22.1"),
            port: 8002,
        });

        let buffer = serializer.serialize_message(&original).unwrap();
        let deserialized = serializer.deserialize_message(buffer).unwrap();

        if let ClusterMessage::Start(start) = deserialized {
            assert_eq!(start.node_uuid, node_uuid);
            assert_eq!(start.ip_address, "10.0.22.1");
            assert_eq!(start.port, 8002);
        } else {
            panic!("Wrong type of message")
        }
    }

    #[test]
    fn roundtrip_bid() {
        let serializer = serializer();
        let subject = NodeUuid::new_v4();
        let sender = NodeUuid::new_v4();

        let original = ClusterMessage::Bid(v1::Bid {
            subject,
            sender,
            value: 117,
        });

        let buffer = serializer.serialize_message(&original).unwrap();
        let deserialized = serializer.deserialize_message(buffer).unwrap();

        if let ClusterMessage::Bid(bid) = deserialized {
            assert_eq!(bid.subject, subject);
            assert_eq!(bid.sender, sender);
            assert_eq!(bid.value, 117);
        } else {
            panic!("Wrong type of message")
        }
    }

    #[test]
    fn unknown_message_type_is_an_error() {
        let serializer = serializer();

        match serializer.deserialize_message(vec![0xff, 0xff, 0x00]) {
            Err(err) => assert_eq!(
                err,
                DeserializeError::UnknownMessageType {
                    message_type: 0xffff
                }
            ),
            Ok(_) => panic!("Message type 0xffff should not deserialize"),
        }
    }

    #[test]
    fn heart_beat_bytes_never_decode_as_a_message() {
        let serializer = serializer();

        let result = serializer.deserialize_message(crate::frames::HEART_BEAT_FRAME.to_vec());

        assert!(result.is_err());
    }
}
