/*
Aliases for data types for readability and to allow resizing in future
*/

pub type Timestamp = u64; // Epoch milliseconds, compatible with Rust time library
pub type PortNumber = u16; // Conforms to TCP/IP port numbering
pub type BidValue = u32; // The value of one bid in a ballot, higher wins

pub type NodeUuid = uuid::Uuid; // Identifies a node across the whole cluster
pub type BallotSubject = uuid::Uuid; // Identifies the thing a ballot is deciding ownership of
