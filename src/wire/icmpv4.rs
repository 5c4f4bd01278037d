use byteorder::{ByteOrder, NetworkEndian};

use super::ip::checksum;
use super::{Error, Result};

enum_with_unknown! {
    /// Internet protocol control message type.
    pub doc enum Message(u8) {
        /// Echo reply
        EchoReply = 0,
        /// Destination unreachable
        DstUnreachable = 3,
        /// Echo request
        EchoRequest = 8,
        /// Time exceeded
        TimeExceeded = 11,
    }
}

enum_with_unknown! {
    /// Internet protocol control message subtype for type "Destination Unreachable".
    pub doc enum DstUnreachable(u8) {
        /// Destination network unreachable
        NetUnreachable = 0,
        /// Destination host unreachable
        HostUnreachable = 1,
        /// Destination protocol unreachable
        ProtoUnreachable = 2,
        /// Destination port unreachable
        PortUnreachable = 3,
        /// Fragmentation required, and DF flag set
        FragRequired = 4,
    }
}

enum_with_unknown! {
    /// Internet protocol control message subtype for type "Time Exceeded".
    pub doc enum TimeExceeded(u8) {
        /// TTL expired in transit
        TtlExpired = 0,
        /// Fragment reassembly time exceeded
        FragExpired = 1,
    }
}

byte_wrapper! {
    /// A byte sequence representing an ICMPv4 packet.
    #[derive(Debug, PartialEq, Eq)]
    pub struct icmpv4([u8]);
}

mod field {
    use crate::wire::field::{Field, Rest};

    pub(crate) const TYPE: usize = 0;
    pub(crate) const CODE: usize = 1;
    pub(crate) const CHECKSUM: Field = 2..4;

    pub(crate) const ECHO_IDENT: Field = 4..6;
    pub(crate) const ECHO_SEQNO: Field = 6..8;

    pub(crate) const UNUSED: Field = 4..8;

    pub(crate) const PAYLOAD: Rest = 8..;
}

impl icmpv4 {
    /// Imbue a raw octet buffer with ICMPv4 packet structure.
    pub fn new_unchecked(buffer: &[u8]) -> &icmpv4 {
        Self::__from_macro_new_unchecked(buffer)
    }

    /// Imbue a mutable octet buffer with ICMPv4 packet structure.
    pub fn new_unchecked_mut(buffer: &mut [u8]) -> &mut icmpv4 {
        Self::__from_macro_new_unchecked_mut(buffer)
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(data: &[u8]) -> Result<&icmpv4> {
        let packet = Self::new_unchecked(data);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no accessor method will panic if called.
    pub fn check_len(&self) -> Result<()> {
        if self.0.len() < field::PAYLOAD.start {
            Err(Error::Truncated)
        } else {
            Ok(())
        }
    }

    /// Return the message type field.
    pub fn msg_type(&self) -> Message {
        Message::from(self.0[field::TYPE])
    }

    /// Return the message code field.
    pub fn msg_code(&self) -> u8 {
        self.0[field::CODE]
    }

    /// Return the checksum field.
    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::CHECKSUM])
    }

    /// Return the identifier field (for echo request and reply packets).
    pub fn echo_ident(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::ECHO_IDENT])
    }

    /// Return the sequence number field (for echo request and reply packets).
    pub fn echo_seq_no(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::ECHO_SEQNO])
    }

    /// Validate the packet checksum.
    pub fn verify_checksum(&self) -> bool {
        checksum::data(&self.0) == !0
    }

    /// Return the payload following the first eight octets.
    pub fn payload_slice(&self) -> &[u8] {
        &self.0[field::PAYLOAD]
    }

    /// Set the message type field.
    pub fn set_msg_type(&mut self, value: Message) {
        self.0[field::TYPE] = value.into()
    }

    /// Set the message code field.
    pub fn set_msg_code(&mut self, value: u8) {
        self.0[field::CODE] = value
    }

    /// Set the checksum field.
    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::CHECKSUM], value)
    }

    /// Set the identifier field (for echo request and reply packets).
    pub fn set_echo_ident(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::ECHO_IDENT], value)
    }

    /// Set the sequence number field (for echo request and reply packets).
    pub fn set_echo_seq_no(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::ECHO_SEQNO], value)
    }

    /// Compute and fill in the packet checksum.
    pub fn fill_checksum(&mut self) {
        self.set_checksum(0);
        let sum = !checksum::data(&self.0);
        self.set_checksum(sum)
    }

    /// Return the payload as a mutable byte slice.
    pub fn payload_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0[field::PAYLOAD]
    }
}

impl AsRef<[u8]> for icmpv4 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A high-level representation of an ICMPv4 packet header.
///
/// For error messages the payload carries the offending datagram's IP header plus the first eight
/// octets of its payload, as required of senders by RFC 792.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Repr<'a> {
    EchoRequest {
        ident: u16,
        seq_no: u16,
        data: &'a [u8],
    },
    EchoReply {
        ident: u16,
        seq_no: u16,
        data: &'a [u8],
    },
    DstUnreachable {
        reason: DstUnreachable,
        data: &'a [u8],
    },
    TimeExceeded {
        reason: TimeExceeded,
        data: &'a [u8],
    },
}

impl<'a> Repr<'a> {
    /// Parse an ICMPv4 packet and return a high-level representation.
    pub fn parse(packet: &'a icmpv4) -> Result<Repr<'a>> {
        packet.check_len()?;
        if !packet.verify_checksum() {
            return Err(Error::WrongChecksum);
        }
        match (packet.msg_type(), packet.msg_code()) {
            (Message::EchoRequest, 0) => Ok(Repr::EchoRequest {
                ident: packet.echo_ident(),
                seq_no: packet.echo_seq_no(),
                data: packet.payload_slice(),
            }),
            (Message::EchoReply, 0) => Ok(Repr::EchoReply {
                ident: packet.echo_ident(),
                seq_no: packet.echo_seq_no(),
                data: packet.payload_slice(),
            }),
            (Message::DstUnreachable, code) => Ok(Repr::DstUnreachable {
                reason: DstUnreachable::from(code),
                data: packet.payload_slice(),
            }),
            (Message::TimeExceeded, code) => Ok(Repr::TimeExceeded {
                reason: TimeExceeded::from(code),
                data: packet.payload_slice(),
            }),
            _ => Err(Error::Unrecognized),
        }
    }

    /// Return the length of a packet that will be emitted from this high-level representation.
    pub fn buffer_len(&self) -> usize {
        match self {
            Repr::EchoRequest { data, .. }
            | Repr::EchoReply { data, .. }
            | Repr::DstUnreachable { data, .. }
            | Repr::TimeExceeded { data, .. } => field::PAYLOAD.start + data.len(),
        }
    }

    /// Emit a high-level representation into an ICMPv4 packet, filling the checksum.
    pub fn emit(&self, packet: &mut icmpv4) {
        match *self {
            Repr::EchoRequest { ident, seq_no, data } => {
                packet.set_msg_type(Message::EchoRequest);
                packet.set_msg_code(0);
                packet.set_echo_ident(ident);
                packet.set_echo_seq_no(seq_no);
                packet.payload_mut_slice()[..data.len()].copy_from_slice(data);
            }
            Repr::EchoReply { ident, seq_no, data } => {
                packet.set_msg_type(Message::EchoReply);
                packet.set_msg_code(0);
                packet.set_echo_ident(ident);
                packet.set_echo_seq_no(seq_no);
                packet.payload_mut_slice()[..data.len()].copy_from_slice(data);
            }
            Repr::DstUnreachable { reason, data } => {
                packet.set_msg_type(Message::DstUnreachable);
                packet.set_msg_code(reason.into());
                NetworkEndian::write_u32(&mut packet.0[field::UNUSED], 0);
                packet.payload_mut_slice()[..data.len()].copy_from_slice(data);
            }
            Repr::TimeExceeded { reason, data } => {
                packet.set_msg_type(Message::TimeExceeded);
                packet.set_msg_code(reason.into());
                NetworkEndian::write_u32(&mut packet.0[field::UNUSED], 0);
                packet.payload_mut_slice()[..data.len()].copy_from_slice(data);
            }
        }
        packet.fill_checksum()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    static ECHO_PACKET_BYTES: [u8; 12] =
        [0x08, 0x00, 0x8e, 0xfe,
         0x12, 0x34, 0xab, 0xcd,
         0xaa, 0x00, 0x00, 0xff];

    static ECHO_DATA_BYTES: [u8; 4] = [0xaa, 0x00, 0x00, 0xff];

    #[test]
    fn test_echo_deconstruct() {
        let packet = icmpv4::new_checked(&ECHO_PACKET_BYTES[..]).unwrap();
        assert_eq!(packet.msg_type(), Message::EchoRequest);
        assert_eq!(packet.msg_code(), 0);
        assert_eq!(packet.checksum(), 0x8efe);
        assert_eq!(packet.echo_ident(), 0x1234);
        assert_eq!(packet.echo_seq_no(), 0xabcd);
        assert_eq!(packet.payload_slice(), &ECHO_DATA_BYTES[..]);
        assert_eq!(packet.verify_checksum(), true);
    }

    #[test]
    fn test_echo_construct() {
        let repr = Repr::EchoRequest {
            ident: 0x1234,
            seq_no: 0xabcd,
            data: &ECHO_DATA_BYTES[..],
        };
        let mut bytes = vec![0xa5; repr.buffer_len()];
        repr.emit(icmpv4::new_unchecked_mut(&mut bytes));
        assert_eq!(&bytes[..], &ECHO_PACKET_BYTES[..]);
    }

    #[test]
    fn test_echo_round_trip() {
        let packet = icmpv4::new_checked(&ECHO_PACKET_BYTES[..]).unwrap();
        let repr = Repr::parse(packet).unwrap();
        assert_eq!(repr, Repr::EchoRequest {
            ident: 0x1234,
            seq_no: 0xabcd,
            data: &ECHO_DATA_BYTES[..],
        });
    }

    #[test]
    fn test_corrupt_checksum() {
        let mut bytes = ECHO_PACKET_BYTES;
        bytes[2] ^= 0xff;
        let packet = icmpv4::new_checked(&bytes[..]).unwrap();
        assert_eq!(Repr::parse(packet).err(), Some(Error::WrongChecksum));
    }

    #[test]
    fn test_unreachable_codes() {
        let repr = Repr::DstUnreachable {
            reason: DstUnreachable::PortUnreachable,
            data: &ECHO_DATA_BYTES[..],
        };
        let mut bytes = vec![0xa5; repr.buffer_len()];
        repr.emit(icmpv4::new_unchecked_mut(&mut bytes));
        assert_eq!(bytes[0], 3);
        assert_eq!(bytes[1], 3);
        let parsed = Repr::parse(icmpv4::new_checked(&bytes).unwrap()).unwrap();
        assert_eq!(parsed, repr);
    }
}
