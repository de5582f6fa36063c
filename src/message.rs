use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use anyhow::bail;

use crate::packet_id::PacketId;
use crate::serialize::{DataDeserializer, DataSerializer};

pub type MessageId = u32;

pub const MSG_ID_PING_REQUEST: MessageId = 0;
pub const MSG_ID_PING_REPLY: MessageId = 1;
pub const MSG_ID_FLOW_CONTROL_REQUEST: MessageId = 2;
pub const MSG_ID_PACKET_ACK: MessageId = 3;
pub const MSG_ID_DISCONNECT: MessageId = 0x3FFF_FFFF;
pub const MSG_ID_DISCONNECT_ACK: MessageId = 0x3FFF_FFFE;

/// Message ids 0..=5 plus the two disconnect ids belong to the protocol and are never
///  surfaced to application message handlers.
pub fn is_reserved_message_id(id: MessageId) -> bool {
    id <= 5 || id == MSG_ID_DISCONNECT || id == MSG_ID_DISCONNECT_ACK
}

/// The highest priority an application message can carry.
pub const MAX_PRIORITY: u32 = 0xFFFF_FFFE;

/// A message with this priority is admitted but never serialized to the wire.
pub const NEVER_SEND_PRIORITY: u32 = 0xFFFF_FFFF;

/// Links a fragment message to its transfer in the fragmented send manager. The wire-level
///  8-bit transfer id lives in the manager and is allocated lazily, so fragments reference
///  their transfer by an internal key instead.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FragmentRef {
    pub transfer_key: u32,
    pub index: u32,
}

/// One outbound application or control message plus its delivery metadata.
#[derive(Debug)]
pub struct NetworkMessage {
    pub id: MessageId,
    pub data: Vec<u8>,
    pub priority: u32,
    pub reliable: bool,
    pub in_order: bool,
    /// 0 means this message does not participate in content-id replacement.
    pub content_id: u32,
    /// Monotonic admission counter, shared per connection. Tie-break for equal
    ///  priorities: the older (smaller) number goes out first.
    pub message_number: u64,
    pub send_count: u32,
    /// Shared with the content-id table so a later admission can retract this message
    ///  after it has already been queued.
    obsolete: Arc<AtomicBool>,
    pub fragment: Option<FragmentRef>,
}

impl NetworkMessage {
    pub fn new(id: MessageId) -> NetworkMessage {
        NetworkMessage {
            id,
            data: Vec::new(),
            priority: 100,
            reliable: false,
            in_order: false,
            content_id: 0,
            message_number: 0,
            send_count: 0,
            obsolete: Arc::new(AtomicBool::new(false)),
            fragment: None,
        }
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(AtomicOrdering::Acquire)
    }

    pub fn obsolete_flag(&self) -> Arc<AtomicBool> {
        self.obsolete.clone()
    }

    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, AtomicOrdering::Release);
    }

    /// All fragments of one transfer share a single obsolete flag, so retracting the
    ///  original message retracts every fragment.
    pub(crate) fn set_obsolete_flag(&mut self, flag: Arc<AtomicBool>) {
        self.obsolete = flag;
    }

    pub fn is_first_fragment(&self) -> bool {
        matches!(self.fragment, Some(FragmentRef { index: 0, .. }))
    }

    /// Whether the message id goes on the wire for this message. Non-first fragments
    ///  omit it; the reassembled buffer starts with the first fragment's id field.
    pub fn carries_message_id(&self) -> bool {
        match self.fragment {
            None => true,
            Some(f) => f.index == 0,
        }
    }
}

/// Max-heap ordering for the outbound priority queue: higher priority first, and among
///  equal priorities the earlier-admitted message first.
pub struct QueuedMessage(pub Box<NetworkMessage>);

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority && self.0.message_number == other.0.message_number
    }
}
impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.priority.cmp(&other.0.priority)
            .then(other.0.message_number.cmp(&self.0.message_number))
    }
}

/// Bounds for the datagram send rate a peer may request.
pub const MIN_DATAGRAMS_PER_SECOND: u16 = 5;
pub const MAX_DATAGRAMS_PER_SECOND: u16 = 10240;

/// The protocol's built-in control messages and their payload formats.
#[derive(Debug, Eq, PartialEq)]
pub enum ControlMessage {
    PingRequest { ping_id: u8 },
    PingReply { ping_id: u8 },
    FlowControlRequest { datagrams_per_second: u16 },
    /// Acknowledges `base` plus, for each set bit i of `sequence`, the packet `base + i + 1`.
    PacketAck { base: PacketId, sequence: u32 },
    Disconnect,
    DisconnectAck,
}

impl ControlMessage {
    pub fn message_id(&self) -> MessageId {
        match self {
            ControlMessage::PingRequest { .. } => MSG_ID_PING_REQUEST,
            ControlMessage::PingReply { .. } => MSG_ID_PING_REPLY,
            ControlMessage::FlowControlRequest { .. } => MSG_ID_FLOW_CONTROL_REQUEST,
            ControlMessage::PacketAck { .. } => MSG_ID_PACKET_ACK,
            ControlMessage::Disconnect => MSG_ID_DISCONNECT,
            ControlMessage::DisconnectAck => MSG_ID_DISCONNECT_ACK,
        }
    }

    pub fn ser(&self) -> Vec<u8> {
        let mut writer = DataSerializer::new();
        match self {
            ControlMessage::PingRequest { ping_id } | ControlMessage::PingReply { ping_id } => {
                writer.add_u8(*ping_id);
            }
            ControlMessage::FlowControlRequest { datagrams_per_second } => {
                writer.add_u16(*datagrams_per_second);
            }
            ControlMessage::PacketAck { base, sequence } => {
                writer.add_u8((base.to_raw() & 0xFF) as u8);
                writer.add_u16((base.to_raw() >> 8) as u16);
                writer.add_u32(*sequence);
            }
            ControlMessage::Disconnect | ControlMessage::DisconnectAck => {}
        }
        writer.into_vec()
    }

    /// Decodes a control message payload, or returns `None` for a non-reserved id.
    pub fn deser(id: MessageId, payload: &[u8]) -> anyhow::Result<Option<ControlMessage>> {
        let mut reader = DataDeserializer::new(payload);
        let msg = match id {
            MSG_ID_PING_REQUEST => ControlMessage::PingRequest { ping_id: reader.read_u8()? },
            MSG_ID_PING_REPLY => ControlMessage::PingReply { ping_id: reader.read_u8()? },
            MSG_ID_FLOW_CONTROL_REQUEST => {
                let rate = reader.read_u16()?;
                ControlMessage::FlowControlRequest {
                    datagrams_per_second: rate.clamp(MIN_DATAGRAMS_PER_SECOND, MAX_DATAGRAMS_PER_SECOND),
                }
            }
            MSG_ID_PACKET_ACK => {
                if payload.len() != 7 {
                    bail!("malformed PacketAck payload: {} bytes, expected 7", payload.len());
                }
                let low = reader.read_u8()? as u32;
                let high = reader.read_u16()? as u32;
                ControlMessage::PacketAck {
                    base: PacketId::from_raw(low | (high << 8)),
                    sequence: reader.read_u32()?,
                }
            }
            MSG_ID_DISCONNECT => ControlMessage::Disconnect,
            MSG_ID_DISCONNECT_ACK => ControlMessage::DisconnectAck,
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::ping_request(ControlMessage::PingRequest { ping_id: 42 })]
    #[case::ping_reply(ControlMessage::PingReply { ping_id: 255 })]
    #[case::flow_control(ControlMessage::FlowControlRequest { datagrams_per_second: 120 })]
    #[case::packet_ack(ControlMessage::PacketAck { base: PacketId::from_raw(0x3F_F123), sequence: 0xA5A5_A5A5 })]
    #[case::disconnect(ControlMessage::Disconnect)]
    #[case::disconnect_ack(ControlMessage::DisconnectAck)]
    fn test_control_message_roundtrip(#[case] msg: ControlMessage) {
        let payload = msg.ser();
        let decoded = ControlMessage::deser(msg.message_id(), &payload).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_packet_ack_wire_layout() {
        let payload = ControlMessage::PacketAck {
            base: PacketId::from_raw(0x030201),
            sequence: 1,
        }.ser();
        assert_eq!(payload, vec![0x01, 0x02, 0x03, 0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_packet_ack_wrong_size_rejected() {
        assert!(ControlMessage::deser(MSG_ID_PACKET_ACK, &[0; 6]).is_err());
        assert!(ControlMessage::deser(MSG_ID_PACKET_ACK, &[0; 8]).is_err());
    }

    #[test]
    fn test_flow_control_clamped() {
        let payload = ControlMessage::FlowControlRequest { datagrams_per_second: 3 }.ser();
        let decoded = ControlMessage::deser(MSG_ID_FLOW_CONTROL_REQUEST, &payload).unwrap().unwrap();
        assert_eq!(decoded, ControlMessage::FlowControlRequest { datagrams_per_second: MIN_DATAGRAMS_PER_SECOND });
    }

    #[test]
    fn test_non_reserved_id_is_not_control() {
        assert_eq!(ControlMessage::deser(77, &[1, 2, 3]).unwrap(), None);
    }

    #[rstest]
    #[case::ping(0, true)]
    #[case::boundary(5, true)]
    #[case::application(6, false)]
    #[case::application_2(1000, false)]
    #[case::disconnect(MSG_ID_DISCONNECT, true)]
    #[case::disconnect_ack(MSG_ID_DISCONNECT_ACK, true)]
    fn test_reserved_ids(#[case] id: MessageId, #[case] expected: bool) {
        assert_eq!(is_reserved_message_id(id), expected);
    }

    #[test]
    fn test_queue_ordering() {
        let mut high = NetworkMessage::new(10);
        high.priority = 200;
        high.message_number = 5;

        let mut low = NetworkMessage::new(10);
        low.priority = 100;
        low.message_number = 1;

        let mut high_but_later = NetworkMessage::new(10);
        high_but_later.priority = 200;
        high_but_later.message_number = 9;

        let mut heap = std::collections::BinaryHeap::new();
        heap.push(QueuedMessage(Box::new(low)));
        heap.push(QueuedMessage(Box::new(high_but_later)));
        heap.push(QueuedMessage(Box::new(high)));

        assert_eq!(heap.pop().unwrap().0.message_number, 5);
        assert_eq!(heap.pop().unwrap().0.message_number, 9);
        assert_eq!(heap.pop().unwrap().0.priority, 100);
    }

    #[test]
    fn test_obsolete_flag_shared() {
        let msg = NetworkMessage::new(10);
        let flag = msg.obsolete_flag();
        assert!(!msg.is_obsolete());

        flag.store(true, AtomicOrdering::Release);
        assert!(msg.is_obsolete());
    }
}
