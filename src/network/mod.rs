//! Peer-to-peer networking
//!
//! Message envelopes, the known-peer list and the node server that answers
//! handshakes, serves blocks and relays transactions.

pub mod message;
pub mod node;
pub mod server;

pub use message::{read_envelope, Message, OpType, COMMAND_LEN, MAX_MESSAGE_SIZE, NODE_VERSION};
pub use node::{Node, Nodes};
pub use server::{join_network, send_data, send_tx, Outbound, Server};
