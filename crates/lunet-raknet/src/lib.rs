//! # lunet-raknet
//!
//! A RakNet 3.25 reliability layer over UDP: per-connection delivery
//! guarantees (unreliable, unreliable-sequenced, reliable,
//! reliable-ordered) with retransmission, range-compressed ACKs, packet
//! splitting and reassembly, and TCP-Reno-style congestion control, plus
//! the server glue and replica broadcasting built on top.

pub mod calcs;
pub mod connection;
pub mod error;
pub mod messages;
pub mod rangelist;
pub mod reliability;
pub mod replica;
pub mod server;
pub mod transport;

pub use connection::{Connection, MAX_DATAGRAM_PAYLOAD, MTU_SIZE, UDP_HEADER_SIZE};
pub use error::{RakNetError, Result};
pub use messages::Message;
pub use rangelist::{Range, RangeList};
pub use reliability::Reliability;
pub use replica::{Replica, ReplicaManager};
pub use server::{Server, ServerEvent};
pub use transport::{DatagramSink, Transport, UdpSink};
