//! Delivery guarantees and outgoing-packet bookkeeping.

use crate::error::{RakNetError, Result};
use bytes::Bytes;

/// Delivery guarantee of a single packet.
///
/// ReliableSequenced exists in the wire encoding but is never transmitted or
/// accepted; seeing it on the wire is a protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reliability {
    Unreliable = 0,
    UnreliableSequenced = 1,
    Reliable = 2,
    ReliableOrdered = 3,
    ReliableSequenced = 4,
}

impl Reliability {
    /// Decodes the 3-bit wire field.
    pub fn from_wire(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Reliability::Unreliable),
            1 => Ok(Reliability::UnreliableSequenced),
            2 => Ok(Reliability::Reliable),
            3 => Ok(Reliability::ReliableOrdered),
            4 => Err(RakNetError::ReservedReliability),
            other => Err(RakNetError::InvalidReliability(other)),
        }
    }

    /// Retransmitted until acknowledged.
    #[inline]
    pub fn is_reliable(self) -> bool {
        matches!(self, Reliability::Reliable | Reliability::ReliableOrdered)
    }

    /// Carries an ordering channel and index on the wire.
    #[inline]
    pub fn needs_ordering_index(self) -> bool {
        matches!(
            self,
            Reliability::UnreliableSequenced | Reliability::ReliableOrdered
        )
    }
}

/// Fragment coordinates of a split payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitInfo {
    pub id: u16,
    pub index: u32,
    pub count: u32,
}

/// A queued outbound packet. The message number is assigned at first
/// transmission, not at queueing time.
#[derive(Debug, Clone)]
pub struct OutgoingPacket {
    pub payload: Bytes,
    pub reliability: Reliability,
    pub ordering_index: Option<u32>,
    pub split: Option<SplitInfo>,
}

/// Worst-case packet header size in bytes for the given reliability and
/// split flag. Compressed fields are counted at their maximum widths.
pub fn header_length(reliability: Reliability, is_split: bool) -> usize {
    let mut bits: usize = 32; // message number
    bits += 3; // reliability
    if reliability.needs_ordering_index() {
        bits += 5; // ordering channel
        bits += 32; // ordering index
    }
    bits += 1; // is-split flag
    if is_split {
        bits += 16; // split packet id
        bits += 32; // split packet index (compressed, assume the maximum)
        bits += 32; // split packet count (compressed, assume the maximum)
    }
    bits += 16; // payload length (compressed, assume the maximum)
    bits.div_ceil(8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_wire() {
        assert_eq!(Reliability::from_wire(0).unwrap(), Reliability::Unreliable);
        assert_eq!(Reliability::from_wire(3).unwrap(), Reliability::ReliableOrdered);
        assert!(matches!(
            Reliability::from_wire(4),
            Err(RakNetError::ReservedReliability)
        ));
        assert!(matches!(
            Reliability::from_wire(7),
            Err(RakNetError::InvalidReliability(7))
        ));
    }

    #[test]
    fn test_predicates() {
        assert!(Reliability::Reliable.is_reliable());
        assert!(Reliability::ReliableOrdered.is_reliable());
        assert!(!Reliability::Unreliable.is_reliable());
        assert!(!Reliability::UnreliableSequenced.is_reliable());

        assert!(Reliability::UnreliableSequenced.needs_ordering_index());
        assert!(Reliability::ReliableOrdered.needs_ordering_index());
        assert!(!Reliability::Reliable.needs_ordering_index());
    }

    #[test]
    fn test_header_length() {
        // message number + reliability + split flag + length, rounded up
        assert_eq!(header_length(Reliability::Unreliable, false), 7);
        assert_eq!(header_length(Reliability::Reliable, false), 7);
        // plus ordering channel and index
        assert_eq!(header_length(Reliability::ReliableOrdered, false), 12);
        // plus split id/index/count
        assert_eq!(header_length(Reliability::ReliableOrdered, true), 22);
        assert_eq!(header_length(Reliability::Reliable, true), 17);
    }
}
