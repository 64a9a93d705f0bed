/// Aliases for the data types used in wire contracts and cluster identity
pub mod data_types;

/// Reserved frames that both ends of a link recognize without deserialization
pub mod frames;

/// Data contracts for the messages that nodes exchange over cluster links
pub mod contracts;

/// Envelope serialization of cluster messages for transmission over Tcp
pub mod bin_serialization;

/// Threaded Tcp plumbing for inter-node links
pub mod sockets;
