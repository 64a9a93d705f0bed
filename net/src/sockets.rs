/*
Thin wrapper around the sockets implemenation in the standard library.
Each link to another node is serviced by its own thread that moves whole
frames between the Tcp stream and a pair of channels.
*/

pub mod buffer_pool;
pub mod tcp_channel;

pub type MessageLength = u16;
