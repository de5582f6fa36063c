//! Wire layout of UDP datagrams and the TCP stream.
//!
//! UDP datagram:
//! ```ascii
//! 0: bits 0-5: packet id low 6 bits
//!    bit 6:    reliable flag - the receiver must ack this datagram
//!    bit 7:    in-order flag - an order delta field follows the header
//! 1: packet id bits 6-21 (u16 LE)
//! *: order delta to the previous in-order packet id (VLE 1.7/8), present only if bit 7 set
//! *: messages, repeated until the end of the datagram:
//!    0: u16 LE: content length (bits 0-10) | in-order (bit 13)
//!        | fragment (bit 14) | fragment start (bit 15)
//!    *: total fragment count (VLE 1.7/1.7/16), only if fragment start
//!    *: fragment transfer id (u8), only if fragment
//!    *: fragment index (VLE 1.7/1.7/16), only if fragment and not fragment start
//!    *: content: message id (VLE 1.7/1.7/16, omitted for non-first fragments) + payload.
//!       The content length field covers both.
//! ```
//!
//! TCP stream: repeated `[content length (VLE 1.7/1.7/16)][message id (VLE 1.7/1.7/16)][payload]`
//!  where the length again covers the id field plus the payload.

use anyhow::bail;

use crate::message::MessageId;
use crate::packet_id::PacketId;
use crate::serialize::{DataDeserializer, DataSerializer, VLE_8_16, VLE_8_16_32};

bitflags::bitflags! {
    /// Flag bits of the per-message header word; the low 11 bits hold the content length.
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct MessageHeaderFlags: u16 {
        const IN_ORDER = 1 << 13;
        const FRAGMENT = 1 << 14;
        const FRAGMENT_START = 1 << 15;
    }
}

pub const MESSAGE_CONTENT_LENGTH_MASK: u16 = (1 << 11) - 1;

/// The largest in-order delta VLE(1.7/8) can carry; bigger deltas are sent as 0, which
///  the receiver treats as 'predecessor unknown'.
pub const MAX_IN_ORDER_DELTA: u32 = 0x7FFF;

#[derive(Debug, Eq, PartialEq)]
pub struct DatagramHeader {
    pub packet_id: PacketId,
    pub reliable: bool,
    /// Present iff the datagram carries in-order messages: modular delta from the
    ///  previous in-order packet id to this one.
    pub in_order_delta: Option<u32>,
}

impl DatagramHeader {
    pub fn ser(&self, writer: &mut DataSerializer) -> anyhow::Result<()> {
        let id = self.packet_id.to_raw();
        let byte0 = (id & 0x3F) as u8
            | ((self.reliable as u8) << 6)
            | ((self.in_order_delta.is_some() as u8) << 7);
        writer.add_u8(byte0);
        writer.add_u16((id >> 6) as u16);
        if let Some(delta) = self.in_order_delta {
            writer.add_vle(VLE_8_16, delta)?;
        }
        Ok(())
    }

    pub fn deser(reader: &mut DataDeserializer) -> anyhow::Result<DatagramHeader> {
        let byte0 = reader.read_u8()?;
        let high = reader.read_u16()? as u32;
        let packet_id = PacketId::from_raw((byte0 & 0x3F) as u32 | (high << 6));
        let reliable = byte0 & (1 << 6) != 0;
        let in_order = byte0 & (1 << 7) != 0;

        let in_order_delta = if in_order {
            Some(reader.read_vle(VLE_8_16)?)
        } else {
            None
        };

        Ok(DatagramHeader { packet_id, reliable, in_order_delta })
    }
}

/// Fragment-related fields of a message header.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FragmentFields {
    Start { transfer_id: u8, total_fragments: u32 },
    Piece { transfer_id: u8, index: u32 },
}

/// One message as it sits inside a UDP datagram, ready to serialize.
pub struct DatagramMessage<'a> {
    /// `None` for non-first fragments, whose reassembled content starts with the id
    ///  written by the first fragment.
    pub message_id: Option<MessageId>,
    pub payload: &'a [u8],
    pub in_order: bool,
    pub fragment: Option<FragmentFields>,
}

impl<'a> DatagramMessage<'a> {
    /// Bytes this message will occupy in the datagram, header word included.
    pub fn packed_size(&self) -> usize {
        2 + self.content_len() + match self.fragment {
            None => 0,
            Some(FragmentFields::Start { total_fragments, .. }) => {
                1 + VLE_8_16_32.encoded_byte_len(total_fragments)
            }
            Some(FragmentFields::Piece { index, .. }) => {
                1 + VLE_8_16_32.encoded_byte_len(index)
            }
        }
    }

    fn content_len(&self) -> usize {
        let id_len = match self.message_id {
            Some(id) => VLE_8_16_32.encoded_byte_len(id),
            None => 0,
        };
        id_len + self.payload.len()
    }

    pub fn ser(&self, writer: &mut DataSerializer) -> anyhow::Result<()> {
        let content_len = self.content_len();
        if content_len == 0 || content_len > MESSAGE_CONTENT_LENGTH_MASK as usize {
            bail!("message content of {} bytes does not fit the 11-bit length field", content_len);
        }

        let mut flags = MessageHeaderFlags::empty();
        if self.in_order {
            flags |= MessageHeaderFlags::IN_ORDER;
        }
        match self.fragment {
            Some(FragmentFields::Start { .. }) => {
                flags |= MessageHeaderFlags::FRAGMENT | MessageHeaderFlags::FRAGMENT_START;
            }
            Some(FragmentFields::Piece { .. }) => {
                flags |= MessageHeaderFlags::FRAGMENT;
            }
            None => {}
        }
        writer.add_u16(content_len as u16 | flags.bits());

        match self.fragment {
            Some(FragmentFields::Start { transfer_id, total_fragments }) => {
                writer.add_vle(VLE_8_16_32, total_fragments)?;
                writer.add_u8(transfer_id);
            }
            Some(FragmentFields::Piece { transfer_id, index }) => {
                writer.add_u8(transfer_id);
                writer.add_vle(VLE_8_16_32, index)?;
            }
            None => {}
        }

        if let Some(id) = self.message_id {
            writer.add_vle(VLE_8_16_32, id)?;
        }
        writer.add_bytes(self.payload);
        Ok(())
    }
}

/// One message parsed out of a UDP datagram. `content` is the raw content bytes - for
///  anything but a non-first fragment it starts with the VLE message id.
#[derive(Debug, Eq, PartialEq)]
pub struct ParsedDatagramMessage {
    pub in_order: bool,
    pub fragment: Option<FragmentFields>,
    pub content: Vec<u8>,
}

impl ParsedDatagramMessage {
    pub fn deser(reader: &mut DataDeserializer) -> anyhow::Result<ParsedDatagramMessage> {
        let header = reader.read_u16()?;
        let flags = MessageHeaderFlags::from_bits_truncate(header);
        let content_len = (header & MESSAGE_CONTENT_LENGTH_MASK) as usize;
        if content_len == 0 {
            bail!("message with zero content length (the message id alone needs 1-4 bytes)");
        }

        let fragment_start = flags.contains(MessageHeaderFlags::FRAGMENT_START);
        let fragment = fragment_start || flags.contains(MessageHeaderFlags::FRAGMENT);

        let fragment = if fragment_start {
            let total_fragments = reader.read_vle(VLE_8_16_32)?;
            if total_fragments <= 1 {
                bail!("fragmented transfer with {} total fragments", total_fragments);
            }
            Some(FragmentFields::Start {
                total_fragments,
                transfer_id: reader.read_u8()?,
            })
        } else if fragment {
            Some(FragmentFields::Piece {
                transfer_id: reader.read_u8()?,
                index: reader.read_vle(VLE_8_16_32)?,
            })
        } else {
            None
        };

        if reader.bytes_left() < content_len {
            bail!("declared content length {} exceeds the {} bytes left in the datagram",
                content_len, reader.bytes_left());
        }

        Ok(ParsedDatagramMessage {
            in_order: flags.contains(MessageHeaderFlags::IN_ORDER),
            fragment,
            content: reader.read_bytes(content_len)?,
        })
    }
}

/// Splits a message's content into its id and payload. Used both for messages straight
///  out of a datagram and for reassembled fragmented transfers.
pub fn split_message_content(content: &[u8]) -> anyhow::Result<(MessageId, &[u8])> {
    let mut reader = DataDeserializer::new(content);
    let id = reader.read_vle(VLE_8_16_32)?;
    Ok((id, &content[reader.byte_pos()..]))
}

pub fn write_stream_message(writer: &mut DataSerializer, id: MessageId, payload: &[u8]) -> anyhow::Result<()> {
    let content_len = VLE_8_16_32.encoded_byte_len(id) + payload.len();
    writer.add_vle(VLE_8_16_32, content_len as u32)?;
    writer.add_vle(VLE_8_16_32, id)?;
    writer.add_bytes(payload);
    Ok(())
}

/// Result of scanning the front of the TCP inbound buffer for one complete message.
#[derive(Debug, Eq, PartialEq)]
pub enum StreamReadResult {
    /// Not enough bytes buffered yet for a complete message.
    Incomplete,
    /// One message, plus the number of buffer bytes it consumed.
    Message { consumed: usize, content: Vec<u8> },
}

/// TCP framing errors are connection-fatal: once a length prefix is wrong there is no
///  way to find the next message boundary in the stream.
pub fn read_stream_message(buf: &[u8], max_message_size: usize) -> anyhow::Result<StreamReadResult> {
    let mut reader = DataDeserializer::new(buf);
    let content_len = match reader.read_vle(VLE_8_16_32) {
        Ok(len) => len as usize,
        Err(_) => return Ok(StreamReadResult::Incomplete),
    };

    if content_len == 0 || content_len > max_message_size {
        bail!("invalid message size {} in TCP stream", content_len);
    }
    if reader.bytes_left() < content_len {
        return Ok(StreamReadResult::Incomplete);
    }

    let content = reader.read_bytes(content_len)?;
    Ok(StreamReadResult::Message { consumed: reader.byte_pos(), content })
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::plain(DatagramHeader { packet_id: PacketId::from_raw(5), reliable: false, in_order_delta: None }, vec![0x05, 0x00, 0x00])]
    #[case::reliable(DatagramHeader { packet_id: PacketId::from_raw(0x40), reliable: true, in_order_delta: None }, vec![0x40, 0x01, 0x00])]
    #[case::in_order(DatagramHeader { packet_id: PacketId::from_raw(3), reliable: true, in_order_delta: Some(2) }, vec![0xC3, 0x00, 0x00, 0x02])]
    #[case::max_id(DatagramHeader { packet_id: PacketId::from_raw(0x3F_FFFF), reliable: false, in_order_delta: None }, vec![0x3F, 0xFF, 0xFF])]
    fn test_datagram_header(#[case] header: DatagramHeader, #[case] expected: Vec<u8>) {
        let mut writer = DataSerializer::new();
        header.ser(&mut writer).unwrap();
        assert_eq!(writer.as_bytes(), &expected[..]);

        let mut reader = DataDeserializer::new(&expected);
        assert_eq!(DatagramHeader::deser(&mut reader).unwrap(), header);
    }

    #[test]
    fn test_datagram_header_wide_delta() {
        let header = DatagramHeader {
            packet_id: PacketId::from_raw(1000),
            reliable: true,
            in_order_delta: Some(0x1234),
        };
        let mut writer = DataSerializer::new();
        header.ser(&mut writer).unwrap();
        assert_eq!(writer.bytes_filled(), 5);

        let mut reader = DataDeserializer::new(writer.as_bytes());
        assert_eq!(DatagramHeader::deser(&mut reader).unwrap(), header);
    }

    #[rstest]
    #[case::plain(None, false)]
    #[case::in_order(None, true)]
    #[case::fragment_start(Some(FragmentFields::Start { transfer_id: 7, total_fragments: 3 }), false)]
    #[case::fragment_piece(Some(FragmentFields::Piece { transfer_id: 7, index: 2 }), false)]
    fn test_datagram_message_roundtrip(#[case] fragment: Option<FragmentFields>, #[case] in_order: bool) {
        let carries_id = !matches!(fragment, Some(FragmentFields::Piece { .. }));
        let msg = DatagramMessage {
            message_id: if carries_id { Some(321) } else { None },
            payload: b"hello world",
            in_order,
            fragment,
        };

        let mut writer = DataSerializer::new();
        msg.ser(&mut writer).unwrap();
        assert_eq!(writer.bytes_filled(), msg.packed_size());

        let buf = writer.into_vec();
        let mut reader = DataDeserializer::new(&buf);
        let parsed = ParsedDatagramMessage::deser(&mut reader).unwrap();

        assert_eq!(parsed.in_order, in_order);
        assert_eq!(parsed.fragment, fragment);
        if carries_id {
            let (id, payload) = split_message_content(&parsed.content).unwrap();
            assert_eq!(id, 321);
            assert_eq!(payload, b"hello world");
        } else {
            assert_eq!(parsed.content, b"hello world");
        }
        assert_eq!(reader.bytes_left(), 0);
    }

    #[test]
    fn test_content_length_covers_id_field() {
        let msg = DatagramMessage {
            message_id: Some(5),
            payload: &[0xAA; 10],
            in_order: false,
            fragment: None,
        };
        let mut writer = DataSerializer::new();
        msg.ser(&mut writer).unwrap();

        let buf = writer.into_vec();
        let header = u16::from_le_bytes([buf[0], buf[1]]);
        assert_eq!(header & MESSAGE_CONTENT_LENGTH_MASK, 11);
    }

    #[test]
    fn test_oversized_message_rejected() {
        let payload = vec![0u8; 2048];
        let msg = DatagramMessage {
            message_id: Some(5),
            payload: &payload,
            in_order: false,
            fragment: None,
        };
        let mut writer = DataSerializer::new();
        assert!(msg.ser(&mut writer).is_err());
    }

    #[rstest]
    #[case::zero_content_length(vec![0x00, 0x00])]
    #[case::truncated_content(vec![0x05, 0x00, 0x01])]
    #[case::single_fragment_transfer(vec![0x02, 0x80, 0x01, 0x07, 0x09, 0x09])]
    fn test_malformed_datagram_message(#[case] data: Vec<u8>) {
        let mut reader = DataDeserializer::new(&data);
        assert!(ParsedDatagramMessage::deser(&mut reader).is_err());
    }

    #[test]
    fn test_stream_message_roundtrip() {
        let mut writer = DataSerializer::new();
        write_stream_message(&mut writer, 42, b"abc").unwrap();
        write_stream_message(&mut writer, 600, b"defg").unwrap();

        let buf = writer.into_vec();
        let first = read_stream_message(&buf, 1024).unwrap();
        let StreamReadResult::Message { consumed, content } = first else {
            panic!("expected a complete message");
        };
        let (id, payload) = split_message_content(&content).unwrap();
        assert_eq!(id, 42);
        assert_eq!(payload, b"abc");

        let second = read_stream_message(&buf[consumed..], 1024).unwrap();
        let StreamReadResult::Message { content, .. } = second else {
            panic!("expected a complete message");
        };
        let (id, payload) = split_message_content(&content).unwrap();
        assert_eq!(id, 600);
        assert_eq!(payload, b"defg");
    }

    #[test]
    fn test_stream_message_incomplete() {
        let mut writer = DataSerializer::new();
        write_stream_message(&mut writer, 42, b"abcdef").unwrap();
        let buf = writer.into_vec();

        for cut in 0..buf.len() {
            assert_eq!(read_stream_message(&buf[..cut], 1024).unwrap(), StreamReadResult::Incomplete);
        }
    }

    #[rstest]
    #[case::zero_length(vec![0x00])]
    #[case::over_limit(vec![0xFF, 0xFF, 0xFF, 0xFF])]
    fn test_stream_message_invalid_length_is_fatal(#[case] data: Vec<u8>) {
        assert!(read_stream_message(&data, 1024).is_err());
    }
}
