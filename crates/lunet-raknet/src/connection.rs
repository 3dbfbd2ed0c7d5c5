//! Per-peer reliability state machine.
//!
//! A connection turns the unreliable datagram channel into the delivery
//! guarantees of [`Reliability`]: it frames outgoing packets, splits
//! payloads that exceed the link MTU, gates transmission on a congestion
//! window, retransmits reliable packets on an RTO deadline, accumulates and
//! flushes ACKs, and reconstructs ordering on the receive side.
//!
//! All timing is deadline-based: the transport's 30 ms tick drives resends,
//! queued sends, the ACK flush, and the liveness probe. Removing an entry
//! is what cancels its deadline.

use crate::calcs::{CongestionWindow, RtoEstimator};
use crate::error::{RakNetError, Result};
use crate::rangelist::RangeList;
use crate::reliability::{OutgoingPacket, Reliability, SplitInfo, header_length};
use crate::transport::DatagramSink;
use bytes::{Bytes, BytesMut};
use log::{debug, info};
use lunet_binary::{BitReader, BitWriter};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Link MTU. 1492 would be the Ethernet default; 1228 is what the original
/// protocol hardcodes.
pub const MTU_SIZE: usize = 1228;
pub const UDP_HEADER_SIZE: usize = 28;
/// Effective per-datagram payload ceiling.
pub const MAX_DATAGRAM_PAYLOAD: usize = MTU_SIZE - UDP_HEADER_SIZE;

/// Cadence of the transport tick that retries queued and timed-out packets.
pub const SEND_INTERVAL: Duration = Duration::from_millis(30);
/// Delay between receiving a reliable packet and flushing ACKs for it.
const ACK_FLUSH_DELAY: Duration = Duration::from_millis(30);
/// Cadence of the liveness probe, and the ACK silence it tolerates.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(10);
/// How many recently received Reliable message numbers are remembered for
/// duplicate detection. The adequacy of the window depends on reliable
/// packet frequency; 20 matches the original protocol.
const RELIABLE_DUPLICATE_WINDOW: usize = 20;
/// Upper bound on fragments per split packet, against hostile counts.
const MAX_SPLIT_PARTS: u32 = 4096;

#[derive(Debug)]
struct Resend {
    packet: OutgoingPacket,
    deadline: Instant,
}

/// Reliability state for one remote address. Owned exclusively by the
/// transport; every entry point takes the current instant so the machine
/// has a single timeline.
pub struct Connection {
    sink: Arc<dyn DatagramSink>,
    address: SocketAddr,
    start_time: Instant,
    /// Last millisecond clock sample received from the peer, echoed back in
    /// our ACK headers.
    remote_system_time: u32,
    acks: RangeList,
    ack_flush_at: Option<Instant>,
    last_ack_time: Instant,
    liveness_at: Instant,
    rto: RtoEstimator,
    cwnd: CongestionWindow,
    /// Datagrams transmitted since the last ACK arrived.
    packets_sent: u32,
    send_message_number: u32,
    split_packet_id: u16,
    sequenced_write_index: u32,
    sequenced_read_index: u32,
    ordered_write_index: u32,
    ordered_read_index: u32,
    recent_reliable: VecDeque<u32>,
    /// ReliableOrdered payloads that arrived before their predecessors.
    out_of_order: HashMap<u32, Bytes>,
    split_queue: HashMap<u16, Vec<Option<Bytes>>>,
    /// Packets waiting for their first transmission.
    sends: VecDeque<OutgoingPacket>,
    /// In-flight reliable packets keyed by message number.
    resends: BTreeMap<u32, Resend>,
}

impl Connection {
    pub fn new(sink: Arc<dyn DatagramSink>, address: SocketAddr, now: Instant) -> Self {
        debug!("creating connection for {address}");
        Self {
            sink,
            address,
            start_time: now,
            remote_system_time: 0,
            acks: RangeList::new(),
            ack_flush_at: None,
            last_ack_time: now,
            liveness_at: now + LIVENESS_INTERVAL,
            rto: RtoEstimator::new(),
            cwnd: CongestionWindow::new(),
            packets_sent: 0,
            send_message_number: 0,
            split_packet_id: 0,
            sequenced_write_index: 0,
            sequenced_read_index: 0,
            ordered_write_index: 0,
            ordered_read_index: 0,
            recent_reliable: VecDeque::with_capacity(RELIABLE_DUPLICATE_WINDOW),
            out_of_order: HashMap::new(),
            split_queue: HashMap::new(),
            sends: VecDeque::new(),
            resends: BTreeMap::new(),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn has_resends(&self) -> bool {
        !self.resends.is_empty()
    }

    fn elapsed_ms(&self, now: Instant) -> u32 {
        now.duration_since(self.start_time).as_millis() as u32
    }

    // --- Send path ---

    /// Queues a payload, splitting it if it cannot fit one datagram, and
    /// transmits as much as the congestion window allows right away.
    pub fn send(&mut self, payload: Bytes, reliability: Reliability, now: Instant) {
        let ordering_index = match reliability {
            Reliability::UnreliableSequenced => {
                let index = self.sequenced_write_index;
                self.sequenced_write_index = self.sequenced_write_index.wrapping_add(1);
                Some(index)
            }
            Reliability::ReliableOrdered => {
                let index = self.ordered_write_index;
                self.ordered_write_index = self.ordered_write_index.wrapping_add(1);
                Some(index)
            }
            _ => None,
        };

        if header_length(reliability, false) + payload.len() >= MAX_DATAGRAM_PAYLOAD {
            let chunk_len = MAX_DATAGRAM_PAYLOAD - header_length(reliability, true);
            let split_id = self.split_packet_id;
            self.split_packet_id = self.split_packet_id.wrapping_add(1);
            let count = payload.len().div_ceil(chunk_len) as u32;
            let mut offset = 0;
            let mut index = 0;
            while offset < payload.len() {
                let end = (offset + chunk_len).min(payload.len());
                self.sends.push_back(OutgoingPacket {
                    payload: payload.slice(offset..end),
                    reliability,
                    ordering_index,
                    split: Some(SplitInfo {
                        id: split_id,
                        index,
                        count,
                    }),
                });
                offset = end;
                index += 1;
            }
        } else {
            self.sends.push_back(OutgoingPacket {
                payload,
                reliability,
                ordering_index,
                split: None,
            });
        }

        self.pump_sends(now);
    }

    /// Periodic work: retransmissions, queued sends, the ACK flush, and the
    /// liveness probe. Returns true when the peer is considered dead.
    pub fn tick(&mut self, now: Instant) -> bool {
        self.pump_resends(now);
        self.pump_sends(now);

        if let Some(deadline) = self.ack_flush_at
            && now >= deadline
        {
            self.ack_flush_at = None;
            self.flush_acks();
        }

        if now >= self.liveness_at {
            self.liveness_at = now + LIVENESS_INTERVAL;
            if !self.resends.is_empty()
                && now.duration_since(self.last_ack_time) > LIVENESS_INTERVAL
            {
                info!("connection to {} is probably dead", self.address);
                return true;
            }
        }
        false
    }

    /// Drops all queued and in-flight state. Nothing fires afterwards.
    pub fn close(&mut self) {
        self.sends.clear();
        self.resends.clear();
        self.split_queue.clear();
        self.out_of_order.clear();
        self.acks.clear();
        self.ack_flush_at = None;
    }

    fn pump_resends(&mut self, now: Instant) {
        let due: Vec<u32> = self
            .resends
            .iter()
            .filter(|(_, resend)| resend.deadline <= now)
            .map(|(&number, _)| number)
            .collect();
        for message_number in due {
            if self.packets_sent as f64 >= self.cwnd.cwnd() {
                break;
            }
            let rto = Duration::from_secs_f64(self.rto.rto());
            let packet = match self.resends.get_mut(&message_number) {
                Some(resend) => {
                    resend.deadline = now + rto;
                    resend.packet.clone()
                }
                None => continue,
            };
            debug!("retransmitting #{message_number} to {}", self.address);
            self.packets_sent += 1;
            self.transmit(&packet, message_number, now);
        }
    }

    fn pump_sends(&mut self, now: Instant) {
        while (self.packets_sent as f64) < self.cwnd.cwnd() {
            let Some(packet) = self.sends.pop_front() else {
                break;
            };
            let message_number = self.send_message_number;
            self.send_message_number = self.send_message_number.wrapping_add(1);
            self.packets_sent += 1;
            self.transmit(&packet, message_number, now);
            if packet.reliability.is_reliable() {
                let deadline = now + Duration::from_secs_f64(self.rto.rto());
                self.resends.insert(message_number, Resend { packet, deadline });
            }
        }
    }

    /// Frames and sends one packet as a datagram, piggybacking any pending
    /// ACKs in the header.
    fn transmit(&mut self, packet: &OutgoingPacket, message_number: u32, now: Instant) {
        debug_assert!(
            header_length(packet.reliability, packet.split.is_some()) + packet.payload.len()
                <= MAX_DATAGRAM_PAYLOAD
        );

        let mut out = BitWriter::new();
        let has_acks = !self.acks.is_empty();
        out.write_bit(has_acks);
        if has_acks {
            out.write_u32_le(self.remote_system_time);
            self.acks.serialize(&mut out);
            self.acks.clear();
        }

        out.write_bit(true); // system time present on every data datagram
        out.write_u32_le(self.elapsed_ms(now));

        out.write_u32_le(message_number);
        out.write_bits(packet.reliability as u8, 3);
        if let Some(ordering_index) = packet.ordering_index {
            out.write_bits(0, 5); // ordering channel, always 0
            out.write_u32_le(ordering_index);
        }
        out.write_bit(packet.split.is_some());
        if let Some(split) = &packet.split {
            out.write_u16_le(split.id);
            out.write_compressed_u32(split.index);
            out.write_compressed_u32(split.count);
        }
        out.write_compressed_u16((packet.payload.len() * 8) as u16);
        out.align_write();
        out.write_bytes(&packet.payload);

        self.sink.send_datagram(out.as_bytes(), self.address);
    }

    /// Sends an ACKs-only datagram if any ACKs are pending.
    fn flush_acks(&mut self) {
        if self.acks.is_empty() {
            return;
        }
        let mut out = BitWriter::new();
        out.write_bit(true);
        out.write_u32_le(self.remote_system_time);
        self.acks.serialize(&mut out);
        self.acks.clear();
        self.sink.send_datagram(out.as_bytes(), self.address);
    }

    // --- Receive path ---

    /// Parses one inbound datagram and returns the payloads it released for
    /// delivery, in order. A parse error poisons the connection; the caller
    /// closes it.
    pub fn handle_datagram(&mut self, datagram: &[u8], now: Instant) -> Result<Vec<Bytes>> {
        let mut stream = BitReader::new(datagram);
        if self.handle_header(&mut stream, now)? {
            return Ok(Vec::new()); // ACKs-only datagram
        }
        let mut delivered = Vec::new();
        while !stream.all_read() {
            self.parse_packet(&mut stream, &mut delivered, now)?;
        }
        Ok(delivered)
    }

    /// Reads the datagram header. Returns true when the datagram carried
    /// only ACKs.
    fn handle_header(&mut self, stream: &mut BitReader, now: Instant) -> Result<bool> {
        let has_acks = stream.read_bit()?;
        if has_acks {
            let echo_time = stream.read_u32_le()?;
            // The peer echoes our own millisecond clock, so both sides of
            // the subtraction share the connection start as their base.
            let rtt = now.duration_since(self.start_time).as_secs_f64() - echo_time as f64 / 1000.0;
            self.rto.update(rtt);

            let acks = RangeList::deserialize(stream)?;
            for message_number in acks.iter() {
                self.resends.remove(&message_number);
            }
            let num_acks = acks.len();
            let num_holes = acks
                .holes()
                .filter(|hole| self.resends.contains_key(hole))
                .count();
            if num_holes > 0 {
                info!("{num_holes} ack holes from {}", self.address);
            }
            self.cwnd.update(self.packets_sent, num_acks, num_holes);
            self.packets_sent = 0;
            self.last_ack_time = now;
        }
        if stream.all_read() {
            return Ok(true);
        }
        if stream.read_bit()? {
            self.remote_system_time = stream.read_u32_le()?;
        }
        Ok(false)
    }

    /// Parses one packet record, applying ACK accumulation, reassembly, and
    /// the per-reliability duplicate and ordering filters.
    fn parse_packet(
        &mut self,
        stream: &mut BitReader,
        delivered: &mut Vec<Bytes>,
        now: Instant,
    ) -> Result<()> {
        let message_number = stream.read_u32_le()?;
        let reliability = Reliability::from_wire(stream.read_bits(3)?)?;

        let mut ordering_index = None;
        if reliability.needs_ordering_index() {
            let channel = stream.read_bits(5)?;
            if channel != 0 {
                return Err(RakNetError::OrderingChannel(channel));
            }
            ordering_index = Some(stream.read_u32_le()?);
        }

        let is_split = stream.read_bit()?;
        let split = if is_split {
            let id = stream.read_u16_le()?;
            let index = stream.read_compressed_u32()?;
            let count = stream.read_compressed_u32()?;
            Some((id, index, count))
        } else {
            None
        };

        let length_bits = stream.read_compressed_u16()? as usize;
        stream.align_read();
        let mut payload = stream.read_bytes(length_bits.div_ceil(8))?;

        if reliability.is_reliable() {
            self.acks.insert(message_number);
            if self.ack_flush_at.is_none() {
                self.ack_flush_at = Some(now + ACK_FLUSH_DELAY);
            }
        }

        if let Some((id, index, count)) = split {
            match self.take_split_part(id, index, count, payload)? {
                Some(complete) => payload = complete,
                None => return Ok(()), // waiting for more fragments
            }
        }

        match reliability {
            Reliability::Unreliable => {}
            Reliability::UnreliableSequenced => {
                let Some(index) = ordering_index else {
                    return Ok(());
                };
                if index >= self.sequenced_read_index {
                    self.sequenced_read_index = index.wrapping_add(1);
                } else {
                    // Sequenced means older packets are silently dropped.
                    return Ok(());
                }
            }
            Reliability::Reliable => {
                // Plain reliable packets can arrive out of order, so
                // duplicates are caught against a ring of recent numbers.
                if self.recent_reliable.contains(&message_number) {
                    debug!("duplicate reliable #{message_number} from {}", self.address);
                    return Ok(());
                }
                if self.recent_reliable.len() == RELIABLE_DUPLICATE_WINDOW {
                    self.recent_reliable.pop_front();
                }
                self.recent_reliable.push_back(message_number);
            }
            Reliability::ReliableOrdered => {
                let Some(index) = ordering_index else {
                    return Ok(());
                };
                if index == self.ordered_read_index {
                    self.ordered_read_index = self.ordered_read_index.wrapping_add(1);
                    delivered.push(payload);
                    // Drain successors that were waiting on this packet.
                    while let Some(queued) = self.out_of_order.remove(&self.ordered_read_index) {
                        debug!("releasing ordering index {}", self.ordered_read_index);
                        self.ordered_read_index = self.ordered_read_index.wrapping_add(1);
                        delivered.push(queued);
                    }
                } else if index < self.ordered_read_index {
                    debug!("duplicate ordered #{message_number} from {}", self.address);
                } else {
                    // Arrived too early; park until the gap fills.
                    debug!(
                        "early ordered packet, index {index} > {}",
                        self.ordered_read_index
                    );
                    self.out_of_order.insert(index, payload);
                }
                return Ok(());
            }
            Reliability::ReliableSequenced => unreachable!("rejected by Reliability::from_wire"),
        }

        delivered.push(payload);
        Ok(())
    }

    /// Stores one fragment; returns the reassembled payload once every slot
    /// is filled.
    fn take_split_part(
        &mut self,
        id: u16,
        index: u32,
        count: u32,
        part: Bytes,
    ) -> Result<Option<Bytes>> {
        if count == 0 || count > MAX_SPLIT_PARTS {
            return Err(RakNetError::InvalidSplit(format!(
                "part count {count} out of bounds"
            )));
        }
        if index >= count {
            return Err(RakNetError::InvalidSplit(format!(
                "part index {index} >= count {count}"
            )));
        }
        let inconsistent = self
            .split_queue
            .get(&id)
            .is_some_and(|existing| existing.len() != count as usize);
        if inconsistent {
            self.split_queue.remove(&id);
            return Err(RakNetError::InvalidSplit(format!(
                "inconsistent part count for split {id}"
            )));
        }

        let parts = self
            .split_queue
            .entry(id)
            .or_insert_with(|| vec![None; count as usize]);
        parts[index as usize] = Some(part);
        if parts.iter().any(|slot| slot.is_none()) {
            return Ok(None);
        }

        let parts = self.split_queue.remove(&id).unwrap_or_default();
        let mut complete = BytesMut::new();
        for part in parts.into_iter().flatten() {
            complete.extend_from_slice(&part);
        }
        Ok(Some(complete.freeze()))
    }
}
