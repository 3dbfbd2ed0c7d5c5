//! Replica broadcasting: object construction, serialization, and
//! destruction messages fanned out to registered participants.

use crate::messages::Message;
use crate::reliability::Reliability;
use crate::server::Server;
use bytes::Bytes;
use log::debug;
use lunet_binary::BitWriter;
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;

/// An object whose lifecycle is mirrored to participants.
pub trait Replica {
    /// Writes the data sent with the construction message.
    fn write_construction(&self, out: &mut BitWriter);

    /// Writes the data sent with a serialization message. The manager does
    /// not watch for changes; the owner calls
    /// [`ReplicaManager::serialize`] explicitly.
    fn serialize(&self, out: &mut BitWriter);

    /// Called right before the destruction message is sent.
    fn on_destruction(&self) {}
}

/// Broadcasts replica lifecycle messages to its participants. Participants
/// added later receive construction messages for every replica still alive.
#[derive(Default)]
pub struct ReplicaManager {
    participants: HashSet<SocketAddr>,
    /// Live replicas by network id; ordered so catch-up constructions
    /// replay in creation order.
    replicas: BTreeMap<u16, Box<dyn Replica>>,
    next_network_id: u16,
}

impl ReplicaManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a participant and replays constructions of all live
    /// replicas to it.
    pub fn add_participant(&mut self, server: &mut Server, addr: SocketAddr, now: Instant) {
        self.participants.insert(addr);
        for (&network_id, replica) in &self.replicas {
            let message = construction_message(network_id, replica.as_ref());
            server.send(message, addr, Reliability::ReliableOrdered, now);
        }
    }

    /// Forgets a participant. Call this when its connection closes.
    pub fn remove_participant(&mut self, addr: SocketAddr) {
        self.participants.remove(&addr);
    }

    /// Registers a replica and broadcasts its construction. Returns the
    /// network id used for later serialize/destruct calls.
    pub fn construct(
        &mut self,
        server: &mut Server,
        replica: Box<dyn Replica>,
        now: Instant,
    ) -> u16 {
        let network_id = self.next_network_id;
        self.next_network_id = self.next_network_id.wrapping_add(1);
        let message = construction_message(network_id, replica.as_ref());
        self.replicas.insert(network_id, replica);
        self.broadcast(server, message, now);
        network_id
    }

    /// Broadcasts the current serialization of a replica. Returns false for
    /// an unknown id.
    pub fn serialize(&mut self, server: &mut Server, network_id: u16, now: Instant) -> bool {
        let Some(replica) = self.replicas.get(&network_id) else {
            return false;
        };
        let message = serialize_message(network_id, replica.as_ref());
        self.broadcast(server, message, now);
        true
    }

    /// Deregisters a replica and broadcasts its destruction. Returns false
    /// for an unknown id.
    pub fn destruct(&mut self, server: &mut Server, network_id: u16, now: Instant) -> bool {
        let Some(replica) = self.replicas.remove(&network_id) else {
            return false;
        };
        debug!("destructing replica {network_id}");
        replica.on_destruction();
        self.broadcast(server, destruction_message(network_id), now);
        true
    }

    fn broadcast(&self, server: &mut Server, data: Bytes, now: Instant) {
        for &addr in &self.participants {
            server.send(data.clone(), addr, Reliability::ReliableOrdered, now);
        }
    }
}

fn construction_message(network_id: u16, replica: &dyn Replica) -> Bytes {
    let mut out = BitWriter::new();
    out.write_u8(Message::ReplicaManagerConstruction as u8);
    out.write_bit(true);
    out.write_u16_le(network_id);
    replica.write_construction(&mut out);
    out.into_bytes()
}

fn serialize_message(network_id: u16, replica: &dyn Replica) -> Bytes {
    let mut out = BitWriter::new();
    out.write_u8(Message::ReplicaManagerSerialize as u8);
    out.write_u16_le(network_id);
    replica.serialize(&mut out);
    out.into_bytes()
}

fn destruction_message(network_id: u16) -> Bytes {
    let mut out = BitWriter::new();
    out.write_u8(Message::ReplicaManagerDestruction as u8);
    out.write_u16_le(network_id);
    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestReplica;

    impl Replica for TestReplica {
        fn write_construction(&self, out: &mut BitWriter) {
            out.write_bytes(b"construction");
        }

        fn serialize(&self, out: &mut BitWriter) {
            out.write_bytes(b"serialize");
        }
    }

    #[test]
    fn test_construction_message_bytes() {
        let message = construction_message(0, &TestReplica);
        assert_eq!(
            message.as_ref(),
            hex::decode("24800031b7b739ba393ab1ba34b7b700").unwrap()
        );
    }

    #[test]
    fn test_serialize_message_bytes() {
        let mut expected = vec![0x27, 0x00, 0x00];
        expected.extend_from_slice(b"serialize");
        assert_eq!(serialize_message(0, &TestReplica).as_ref(), expected);
    }

    #[test]
    fn test_destruction_message_bytes() {
        assert_eq!(destruction_message(0).as_ref(), &[0x25, 0x00, 0x00]);
    }

    #[test]
    fn test_network_ids_are_sequential() {
        let mut manager = ReplicaManager::new();
        let sink = std::sync::Arc::new(NullSink);
        let (mut server, _events) = Server::new(
            sink,
            "127.0.0.1:1234".parse().unwrap(),
            10,
            Bytes::from_static(b"test"),
        );
        let now = Instant::now();
        assert_eq!(manager.construct(&mut server, Box::new(TestReplica), now), 0);
        assert_eq!(manager.construct(&mut server, Box::new(TestReplica), now), 1);
        assert!(manager.destruct(&mut server, 0, now));
        assert!(!manager.destruct(&mut server, 0, now));
        assert!(!manager.serialize(&mut server, 0, now));
        assert!(manager.serialize(&mut server, 1, now));
    }

    struct NullSink;

    impl crate::transport::DatagramSink for NullSink {
        fn send_datagram(&self, _datagram: &[u8], _addr: SocketAddr) {}
    }

    #[test]
    fn test_participants_receive_broadcasts() {
        use std::sync::{Arc, Mutex};

        #[derive(Default)]
        struct CountingSink {
            count: Mutex<usize>,
        }

        impl crate::transport::DatagramSink for CountingSink {
            fn send_datagram(&self, _datagram: &[u8], _addr: SocketAddr) {
                *self.count.lock().unwrap() += 1;
            }
        }

        impl CountingSink {
            fn take(&self) -> usize {
                std::mem::take(&mut *self.count.lock().unwrap())
            }
        }

        let sink = Arc::new(CountingSink::default());
        let (mut server, _events) = Server::new(
            sink.clone(),
            "127.0.0.1:1234".parse().unwrap(),
            10,
            Bytes::from_static(b"test"),
        );
        let now = Instant::now();
        let addr: SocketAddr = "127.0.0.1:2001".parse().unwrap();
        server.handle_incoming(&[Message::OpenConnectionRequest as u8, 0], addr, now);
        sink.take(); // the handshake reply

        let mut manager = ReplicaManager::new();
        // A construction before anyone participates reaches nobody.
        manager.construct(&mut server, Box::new(TestReplica), now);
        assert_eq!(sink.take(), 0);

        // A late joiner is caught up on the live replica.
        manager.add_participant(&mut server, addr, now);
        assert_eq!(sink.take(), 1);

        // Ack the construction so the congestion window lets the next
        // message out immediately.
        let mut acks = crate::rangelist::RangeList::new();
        acks.insert(0);
        let mut out = BitWriter::new();
        out.write_bit(true);
        out.write_u32_le(0);
        acks.serialize(&mut out);
        server.handle_incoming(out.as_bytes(), addr, now);

        manager.serialize(&mut server, 0, now);
        assert_eq!(sink.take(), 1);

        manager.remove_participant(addr);
        manager.destruct(&mut server, 0, now);
        assert_eq!(sink.take(), 0);
    }
}
