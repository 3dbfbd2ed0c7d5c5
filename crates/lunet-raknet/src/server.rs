//! Server glue: the packet semantics layered on top of the transport.
//!
//! The server answers the handshake (password check, address echo), the
//! internal ping, and disconnections itself; everything else is forwarded
//! to the application through the event channel.

use crate::connection::SEND_INTERVAL;
use crate::error::Result;
use crate::messages::Message;
use crate::reliability::Reliability;
use crate::transport::{DatagramSink, Inbound, Transport, UdpSink};
use bytes::Bytes;
use log::{debug, error, info, warn};
use lunet_binary::BitWriter;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Receive buffer size; larger than any datagram the protocol produces.
const MAX_UDP_PACKET_SIZE: usize = 1492;

/// What the application sees of the connection lifecycle.
#[derive(Debug, PartialEq, Eq)]
pub enum ServerEvent {
    /// The peer completed the handshake with `NewIncomingConnection`.
    NewConnection(SocketAddr),
    /// The connection was closed, by either side or by the liveness probe.
    Disconnect(SocketAddr),
    /// An application-level payload. For `UserPacket` (0x53) the id byte is
    /// stripped; other unhandled ids are forwarded whole.
    UserPacket { address: SocketAddr, data: Bytes },
}

pub struct Server {
    transport: Transport,
    local_addr: SocketAddr,
    password: Bytes,
    start_time: Instant,
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl Server {
    /// Builds a server over any sink. The socket only enters the picture in
    /// [`Server::run`], so tests drive this with a mock sink and direct
    /// calls to [`Server::handle_incoming`].
    pub fn new(
        sink: Arc<dyn DatagramSink>,
        local_addr: SocketAddr,
        max_connections: usize,
        password: Bytes,
    ) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let server = Self {
            transport: Transport::new(sink, max_connections),
            local_addr,
            password,
            start_time: Instant::now(),
            events,
        };
        (server, receiver)
    }

    /// Binds a UDP socket and builds a server around it.
    pub async fn bind(
        addr: SocketAddr,
        max_connections: usize,
        password: Bytes,
    ) -> Result<(Self, Arc<UdpSocket>, mpsc::UnboundedReceiver<ServerEvent>)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        info!("listening on {local_addr}");
        let sink = Arc::new(UdpSink::new(socket.clone()));
        let (server, receiver) = Server::new(sink, local_addr, max_connections, password);
        Ok((server, socket, receiver))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.transport.connection_count()
    }

    /// Receive loop plus the periodic tick. Runs until the socket fails
    /// unrecoverably.
    pub async fn run(&mut self, socket: Arc<UdpSocket>) -> Result<()> {
        let mut buf = [0u8; MAX_UDP_PACKET_SIZE];
        let mut ticker = tokio::time::interval(SEND_INTERVAL);
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, addr)) => self.handle_incoming(&buf[..len], addr, Instant::now()),
                    Err(e) => error!("failed to receive datagram: {e}"),
                },
                _ = ticker.tick() => self.tick(Instant::now()),
            }
        }
    }

    /// Dispatches one inbound datagram.
    pub fn handle_incoming(&mut self, data: &[u8], addr: SocketAddr, now: Instant) {
        if data.is_empty() {
            return;
        }
        if data.len() <= 2 {
            // Raw control datagram.
            self.transport.handle_raw(data, addr, now);
            return;
        }
        match self.transport.handle_datagram(data, addr, now) {
            Inbound::Delivered(payloads) => {
                for payload in payloads {
                    self.on_packet(payload, addr, now);
                }
            }
            Inbound::Unknown => {}
            Inbound::Poisoned => self.drop_connection(addr),
        }
    }

    /// Periodic work across all connections.
    pub fn tick(&mut self, now: Instant) {
        for addr in self.transport.tick(now) {
            self.drop_connection(addr);
        }
    }

    /// Queues a message on one connection.
    pub fn send(&mut self, data: Bytes, addr: SocketAddr, reliability: Reliability, now: Instant) {
        log_packet(&data, "snd");
        if !self.transport.send(data, addr, reliability, now) {
            warn!("tried to send to {addr} but it is not connected");
        }
    }

    /// Sends to every connection except the excluded addresses.
    pub fn broadcast(
        &mut self,
        data: Bytes,
        reliability: Reliability,
        exclude: &[SocketAddr],
        now: Instant,
    ) {
        for addr in self.transport.addresses() {
            if !exclude.contains(&addr) {
                self.send(data.clone(), addr, reliability, now);
            }
        }
    }

    /// Locally-initiated close: notify the peer, then drop the connection.
    pub fn close_connection(&mut self, addr: SocketAddr, now: Instant) {
        if self.transport.is_connected(addr) {
            self.send(
                Bytes::from_static(&[Message::DisconnectionNotification as u8]),
                addr,
                Reliability::ReliableOrdered,
                now,
            );
            self.drop_connection(addr);
        } else {
            warn!("tried to close {addr} but it is not connected");
        }
    }

    fn drop_connection(&mut self, addr: SocketAddr) {
        if self.transport.remove(addr) {
            info!("connection to {addr} closed");
            let _ = self.events.send(ServerEvent::Disconnect(addr));
        }
    }

    fn on_packet(&mut self, data: Bytes, addr: SocketAddr, now: Instant) {
        let Some(&id) = data.first() else {
            return;
        };
        log_packet(&data, "got");
        match Message::from_id(id) {
            Some(Message::ConnectionRequest) => self.on_connection_request(&data, addr, now),
            Some(Message::NewIncomingConnection) => {
                info!("new incoming connection from {addr}");
                let _ = self.events.send(ServerEvent::NewConnection(addr));
            }
            Some(Message::InternalPing) => self.on_internal_ping(&data, addr, now),
            Some(Message::DisconnectionNotification) | Some(Message::ConnectionLost) => {
                self.drop_connection(addr);
            }
            Some(Message::UserPacket) => {
                let _ = self.events.send(ServerEvent::UserPacket {
                    address: addr,
                    data: data.slice(1..),
                });
            }
            _ => {
                // Anything unhandled is the application's business; keep the
                // id so the payload stays self-describing.
                let _ = self.events.send(ServerEvent::UserPacket { address: addr, data });
            }
        }
    }

    fn on_connection_request(&mut self, data: &Bytes, addr: SocketAddr, now: Instant) {
        if data.slice(1..) == self.password {
            let response = connection_request_accepted(addr, self.local_addr);
            self.send(response, addr, Reliability::Reliable, now);
        } else {
            warn!("rejecting connection from {addr}: wrong password");
            self.drop_connection(addr);
        }
    }

    fn on_internal_ping(&mut self, data: &Bytes, addr: SocketAddr, now: Instant) {
        if data.len() < 5 {
            warn!("short internal ping from {addr}");
            return;
        }
        let elapsed = now.duration_since(self.start_time).as_millis() as u32;
        let response = connected_pong(&data[1..5], elapsed);
        self.send(response, addr, Reliability::Unreliable, now);
    }
}

/// `ConnectionRequestAccepted`: the peer's own address echoed back, the
/// connection index RakNet itself ignores, and our address.
fn connection_request_accepted(peer: SocketAddr, local: SocketAddr) -> Bytes {
    let mut out = BitWriter::new();
    out.write_u8(Message::ConnectionRequestAccepted as u8);
    write_address(&mut out, peer);
    out.write_bytes(&[0, 0]);
    write_address(&mut out, local);
    out.into_bytes()
}

/// `ConnectedPong`: the peer's 4-byte send time echoed verbatim, then our
/// millisecond clock.
fn connected_pong(echo_time: &[u8], elapsed_ms: u32) -> Bytes {
    let mut out = BitWriter::new();
    out.write_u8(Message::ConnectedPong as u8);
    out.write_bytes(echo_time);
    out.write_u32_le(elapsed_ms);
    out.into_bytes()
}

/// Wire addresses are 4 IPv4 octets followed by a little-endian port.
fn write_address(out: &mut BitWriter, addr: SocketAddr) {
    match addr {
        SocketAddr::V4(v4) => {
            out.write_bytes(&v4.ip().octets());
            out.write_u16_le(v4.port());
        }
        // The wire format has no IPv6 representation.
        SocketAddr::V6(_) => {
            out.write_bytes(&[0; 4]);
            out.write_u16_le(0);
        }
    }
}

fn log_packet(data: &[u8], direction: &str) {
    let Some(&id) = data.first() else {
        return;
    };
    // Pings are too chatty for the console log.
    if id == Message::InternalPing as u8 || id == Message::ConnectedPong as u8 {
        return;
    }
    if id != Message::UserPacket as u8 {
        debug!("{direction} {}", Message::name_of(id));
    }
}
