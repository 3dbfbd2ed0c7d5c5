//! Datagram demultiplexing and connection lifecycle.
//!
//! The transport owns the address → connection map. Datagrams of two bytes
//! or less are raw control messages (the open-connection handshake);
//! anything longer is routed to the owning connection's reliability layer.

use crate::connection::Connection;
use crate::messages::Message;
use crate::reliability::Reliability;
use bytes::Bytes;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;

/// Non-blocking datagram output. Shared across all connections of a
/// transport; an explicit dependency so connections are testable without a
/// socket.
pub trait DatagramSink: Send + Sync {
    fn send_datagram(&self, datagram: &[u8], addr: SocketAddr);
}

/// Production sink over a bound UDP socket. Sends never block; a datagram
/// that cannot be written right now is dropped like any other lost packet.
pub struct UdpSink {
    socket: Arc<UdpSocket>,
}

impl UdpSink {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

impl DatagramSink for UdpSink {
    fn send_datagram(&self, datagram: &[u8], addr: SocketAddr) {
        if let Err(e) = self.socket.try_send_to(datagram, addr) {
            warn!("failed to send {} bytes to {addr}: {e}", datagram.len());
        }
    }
}

/// What [`Transport::handle_datagram`] did with an inbound datagram.
pub enum Inbound {
    /// Payloads released for delivery by the owning connection.
    Delivered(Vec<Bytes>),
    /// No connection is known for the sender.
    Unknown,
    /// The connection failed to parse the datagram and must be closed.
    Poisoned,
}

/// Connection table plus the raw open/close handshake.
pub struct Transport {
    sink: Arc<dyn DatagramSink>,
    connections: HashMap<SocketAddr, Connection>,
    max_connections: usize,
}

impl Transport {
    pub fn new(sink: Arc<dyn DatagramSink>, max_connections: usize) -> Self {
        Self {
            sink,
            connections: HashMap::new(),
            max_connections,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_connected(&self, addr: SocketAddr) -> bool {
        self.connections.contains_key(&addr)
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.connections.keys().copied().collect()
    }

    /// Handles a raw (≤ 2 byte) control datagram.
    pub fn handle_raw(&mut self, data: &[u8], addr: SocketAddr, now: Instant) {
        match data.first().copied() {
            Some(id) if id == Message::OpenConnectionRequest as u8 => {
                if self.connections.contains_key(&addr) {
                    // A repeated request keeps the existing connection; only
                    // the reply is repeated.
                    self.sink
                        .send_datagram(&[Message::OpenConnectionReply as u8, 0], addr);
                } else if self.connections.len() < self.max_connections {
                    info!("new connection from {addr}");
                    self.connections
                        .insert(addr, Connection::new(self.sink.clone(), addr, now));
                    self.sink
                        .send_datagram(&[Message::OpenConnectionReply as u8, 0], addr);
                } else {
                    warn!("refusing connection from {addr}: table is full");
                    self.sink
                        .send_datagram(&[Message::NoFreeIncomingConnections as u8, 0], addr);
                }
            }
            Some(id) => debug!("ignoring raw datagram {id:#04x} from {addr}"),
            None => {}
        }
    }

    /// Routes a framed datagram to its connection.
    pub fn handle_datagram(&mut self, data: &[u8], addr: SocketAddr, now: Instant) -> Inbound {
        let Some(conn) = self.connections.get_mut(&addr) else {
            debug!("ignoring datagram from unknown address {addr}");
            return Inbound::Unknown;
        };
        match conn.handle_datagram(data, now) {
            Ok(delivered) => Inbound::Delivered(delivered),
            Err(e) => {
                warn!("failed to parse datagram from {addr}: {e}");
                Inbound::Poisoned
            }
        }
    }

    /// Queues a payload on a connection. Returns false when the address is
    /// not connected.
    pub fn send(
        &mut self,
        payload: Bytes,
        addr: SocketAddr,
        reliability: Reliability,
        now: Instant,
    ) -> bool {
        match self.connections.get_mut(&addr) {
            Some(conn) => {
                conn.send(payload, reliability, now);
                true
            }
            None => false,
        }
    }

    /// Ticks every connection and returns the addresses whose liveness
    /// probe gave up.
    pub fn tick(&mut self, now: Instant) -> Vec<SocketAddr> {
        let mut dead = Vec::new();
        for (addr, conn) in &mut self.connections {
            if conn.tick(now) {
                dead.push(*addr);
            }
        }
        dead
    }

    /// Removes a connection, dropping all its pending state.
    pub fn remove(&mut self, addr: SocketAddr) -> bool {
        match self.connections.remove(&addr) {
            Some(mut conn) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    pub fn sink(&self) -> &Arc<dyn DatagramSink> {
        &self.sink
    }
}
