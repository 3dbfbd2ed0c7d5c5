//! Message id bytes: the first byte of every application-level payload.

/// Known message ids. Values follow the RakNet 3.25 encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Message {
    InternalPing = 0x00,
    ConnectedPong = 0x03,
    ConnectionRequest = 0x04,
    OpenConnectionRequest = 0x09,
    NoFreeIncomingConnections = 0x0c,
    DisconnectionNotification = 0x0d,
    ConnectionRequestAccepted = 0x0e,
    NewIncomingConnection = 0x11,
    ConnectionLost = 0x12,
    OpenConnectionReply = 0x13,
    ReplicaManagerConstruction = 0x24,
    ReplicaManagerDestruction = 0x25,
    ReplicaManagerSerialize = 0x27,
    UserPacket = 0x53,
}

impl Message {
    pub fn from_id(id: u8) -> Option<Self> {
        Some(match id {
            0x00 => Message::InternalPing,
            0x03 => Message::ConnectedPong,
            0x04 => Message::ConnectionRequest,
            0x09 => Message::OpenConnectionRequest,
            0x0c => Message::NoFreeIncomingConnections,
            0x0d => Message::DisconnectionNotification,
            0x0e => Message::ConnectionRequestAccepted,
            0x11 => Message::NewIncomingConnection,
            0x12 => Message::ConnectionLost,
            0x13 => Message::OpenConnectionReply,
            0x24 => Message::ReplicaManagerConstruction,
            0x25 => Message::ReplicaManagerDestruction,
            0x27 => Message::ReplicaManagerSerialize,
            0x53 => Message::UserPacket,
            _ => return None,
        })
    }

    /// Name used for packet logging; unknown ids log their hex value.
    pub fn name_of(id: u8) -> String {
        match Message::from_id(id) {
            Some(message) => format!("{message:?}"),
            None => format!("{id:#04x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_round_trip() {
        for id in 0..=0xff {
            if let Some(message) = Message::from_id(id) {
                assert_eq!(message as u8, id);
            }
        }
        assert_eq!(Message::from_id(0x53), Some(Message::UserPacket));
        assert_eq!(Message::from_id(0x01), None);
    }

    #[test]
    fn test_name_of() {
        assert_eq!(Message::name_of(0x00), "InternalPing");
        assert_eq!(Message::name_of(0xab), "0xab");
    }
}
