use core::fmt;
use byteorder::{ByteOrder, NetworkEndian};

use super::ip::checksum;
use super::{Error, Result};

pub(crate) use super::ip::Protocol;

/// Minimum MTU required of all links supporting IPv4. See [RFC 791 § 3.1].
///
/// [RFC 791 § 3.1]: https://tools.ietf.org/html/rfc791#section-3.1
pub const MIN_MTU: usize = 576;

/// A four-octet IPv4 address.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct Address(pub [u8; 4]);

impl Address {
    /// An unspecified address.
    pub const UNSPECIFIED: Address = Address([0x00; 4]);

    /// The broadcast address.
    pub const BROADCAST: Address = Address([0xff; 4]);

    /// Construct an IPv4 address from parts.
    pub const fn new(a0: u8, a1: u8, a2: u8, a3: u8) -> Address {
        Address([a0, a1, a2, a3])
    }

    /// Construct an IPv4 address from a sequence of octets, in big-endian.
    ///
    /// # Panics
    /// The function panics if `data` is not four octets long.
    pub fn from_bytes(data: &[u8]) -> Address {
        let mut bytes = [0; 4];
        bytes.copy_from_slice(data);
        Address(bytes)
    }

    /// Return an IPv4 address as a sequence of octets, in big-endian.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Query whether the address is an unicast address.
    pub fn is_unicast(&self) -> bool {
        !(self.is_broadcast() || self.is_multicast() || self.is_unspecified())
    }

    /// Query whether the address is the broadcast address.
    pub fn is_broadcast(&self) -> bool {
        self.0 == [255; 4]
    }

    /// Query whether the address is a multicast address.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0xf0 == 224
    }

    /// Query whether the address falls into the "unspecified" range.
    pub fn is_unspecified(&self) -> bool {
        self.0[0] == 0
    }

    /// Query whether the address falls into the "loopback" range.
    pub fn is_loopback(&self) -> bool {
        self.0[0] == 127
    }

    /// Mask the address to some prefix length.
    ///
    /// Preserves only address bits that are relevant for the prefix length.
    ///
    /// # Panics
    /// This function panics if `prefix` is greater than 32.
    pub fn mask(&self, prefix: u8) -> Address {
        assert!(prefix <= 32);
        let masked = if prefix == 0 {
            0
        } else {
            u32::from_be_bytes(self.0) & (!0u32 << (32 - prefix))
        };
        Address(masked.to_be_bytes())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = self.0;
        write!(f, "{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3])
    }
}

byte_wrapper! {
    /// A byte sequence representing an IPv4 packet.
    #[derive(Debug, PartialEq, Eq)]
    pub struct ipv4([u8]);
}

#[allow(non_snake_case)]
mod field {
    use crate::wire::field::Field;

    pub(crate) const VER_IHL: usize = 0;
    pub(crate) const DSCP_ECN: usize = 1;
    pub(crate) const LENGTH: Field = 2..4;
    pub(crate) const IDENT: Field = 4..6;
    pub(crate) const FLG_OFF: Field = 6..8;
    pub(crate) const TTL: usize = 8;
    pub(crate) const PROTOCOL: usize = 9;
    pub(crate) const CHECKSUM: Field = 10..12;
    pub(crate) const SRC_ADDR: Field = 12..16;
    pub(crate) const DST_ADDR: Field = 16..20;

    pub(crate) fn OPTIONS(header_len: u8) -> Field {
        DST_ADDR.end..(header_len as usize)
    }

    pub(crate) const FLG_DF: u16 = 0x4000;
    pub(crate) const FLG_MF: u16 = 0x2000;
    pub(crate) const OFF_MASK: u16 = 0x1fff;

    pub(crate) const OPT_END: u8 = 0;
    pub(crate) const OPT_NOP: u8 = 1;
    pub(crate) const OPT_RECORD_ROUTE: u8 = 7;
    pub(crate) const OPT_TIMESTAMP: u8 = 68;
    pub(crate) const OPT_LOOSE_ROUTE: u8 = 131;
    pub(crate) const OPT_STRICT_ROUTE: u8 = 137;
}

impl ipv4 {
    /// Imbue a raw octet buffer with IPv4 packet structure.
    pub fn new_unchecked(buffer: &[u8]) -> &ipv4 {
        Self::__from_macro_new_unchecked(buffer)
    }

    /// Imbue a mutable octet buffer with IPv4 packet structure.
    pub fn new_unchecked_mut(buffer: &mut [u8]) -> &mut ipv4 {
        Self::__from_macro_new_unchecked_mut(buffer)
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(data: &[u8]) -> Result<&ipv4> {
        let packet = Self::new_unchecked(data);
        packet.check_len()?;
        Ok(packet)
    }

    /// View the packet as a raw byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Ensure that no accessor method will panic if called.
    ///
    /// Returns `Err(Error::Truncated)` if the buffer is too short.
    /// Returns `Err(Error::Malformed)` if the header length is out of bounds or the total length
    /// is less than the header length.
    pub fn check_len(&self) -> Result<()> {
        let len = self.0.len();
        if len < field::DST_ADDR.end {
            return Err(Error::Truncated);
        }
        let header_len = self.header_len() as usize;
        if header_len < field::DST_ADDR.end || header_len > len {
            return Err(Error::Malformed);
        }
        if (self.total_len() as usize) < header_len {
            return Err(Error::Malformed);
        }
        if (self.total_len() as usize) > len {
            return Err(Error::Truncated);
        }
        Ok(())
    }

    /// Return the version field.
    pub fn version(&self) -> u8 {
        self.0[field::VER_IHL] >> 4
    }

    /// Return the header length, in octets.
    pub fn header_len(&self) -> u8 {
        (self.0[field::VER_IHL] & 0x0f) * 4
    }

    /// Return the total length field.
    pub fn total_len(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::LENGTH])
    }

    /// Return the fragment identification field.
    pub fn ident(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::IDENT])
    }

    /// Return the "don't fragment" flag.
    pub fn dont_frag(&self) -> bool {
        NetworkEndian::read_u16(&self.0[field::FLG_OFF]) & field::FLG_DF != 0
    }

    /// Return the "more fragments" flag.
    pub fn more_frags(&self) -> bool {
        NetworkEndian::read_u16(&self.0[field::FLG_OFF]) & field::FLG_MF != 0
    }

    /// Return the fragment offset, in octets.
    pub fn frag_offset(&self) -> u16 {
        (NetworkEndian::read_u16(&self.0[field::FLG_OFF]) & field::OFF_MASK) * 8
    }

    /// Return the time to live field.
    pub fn hop_limit(&self) -> u8 {
        self.0[field::TTL]
    }

    /// Return the protocol field.
    pub fn protocol(&self) -> Protocol {
        Protocol::from(self.0[field::PROTOCOL])
    }

    /// Return the header checksum field.
    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::CHECKSUM])
    }

    /// Return the source address field.
    pub fn src_addr(&self) -> Address {
        Address::from_bytes(&self.0[field::SRC_ADDR])
    }

    /// Return the destination address field.
    pub fn dst_addr(&self) -> Address {
        Address::from_bytes(&self.0[field::DST_ADDR])
    }

    /// Validate the header checksum.
    pub fn verify_checksum(&self) -> bool {
        checksum::data(&self.0[..self.header_len() as usize]) == !0
    }

    /// Return the option bytes, the header octets past the fixed 20.
    pub fn options(&self) -> &[u8] {
        &self.0[field::OPTIONS(self.header_len())]
    }

    /// Return the payload as a byte slice.
    pub fn payload_slice(&self) -> &[u8] {
        let total = self.total_len() as usize;
        &self.0[self.header_len() as usize..total]
    }

    /// Set the version field.
    pub fn set_version(&mut self, value: u8) {
        self.0[field::VER_IHL] = (self.0[field::VER_IHL] & 0x0f) | (value << 4);
    }

    /// Set the header length, in octets.
    pub fn set_header_len(&mut self, value: u8) {
        self.0[field::VER_IHL] = (self.0[field::VER_IHL] & 0xf0) | (value / 4);
    }

    /// Set the differentiated services and congestion notification byte.
    pub fn set_dscp_ecn(&mut self, value: u8) {
        self.0[field::DSCP_ECN] = value;
    }

    /// Set the total length field.
    pub fn set_total_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::LENGTH], value)
    }

    /// Set the fragment identification field.
    pub fn set_ident(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::IDENT], value)
    }

    /// Set the fragmentation flags and offset at once. The offset is given in octets.
    pub fn set_frag_fields(&mut self, dont_frag: bool, more_frags: bool, offset: u16) {
        let mut raw = (offset / 8) & field::OFF_MASK;
        if dont_frag {
            raw |= field::FLG_DF;
        }
        if more_frags {
            raw |= field::FLG_MF;
        }
        NetworkEndian::write_u16(&mut self.0[field::FLG_OFF], raw)
    }

    /// Set the time to live field.
    pub fn set_hop_limit(&mut self, value: u8) {
        self.0[field::TTL] = value;
    }

    /// Set the protocol field.
    pub fn set_protocol(&mut self, value: Protocol) {
        self.0[field::PROTOCOL] = value.into();
    }

    /// Set the header checksum field.
    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::CHECKSUM], value)
    }

    /// Set the source address field.
    pub fn set_src_addr(&mut self, value: Address) {
        self.0[field::SRC_ADDR].copy_from_slice(value.as_bytes())
    }

    /// Set the destination address field.
    pub fn set_dst_addr(&mut self, value: Address) {
        self.0[field::DST_ADDR].copy_from_slice(value.as_bytes())
    }

    /// Compute and fill in the header checksum.
    pub fn fill_checksum(&mut self) {
        self.set_checksum(0);
        let sum = {
            let header_len = self.header_len() as usize;
            !checksum::data(&self.0[..header_len])
        };
        self.set_checksum(sum)
    }

    /// Return the payload as a mutable byte slice.
    pub fn payload_mut_slice(&mut self) -> &mut [u8] {
        let range = self.header_len() as usize..self.total_len() as usize;
        &mut self.0[range]
    }
}

impl AsRef<[u8]> for ipv4 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A parsed representation of a single IPv4 option.
///
/// Unknown option kinds are preserved with their raw payload bytes.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Ipv4Option<'a> {
    EndOfList,
    NoOperation,
    RecordRoute { pointer: u8, data: &'a [u8] },
    Timestamp { pointer: u8, overflow_flags: u8, data: &'a [u8] },
    LooseSourceRoute { pointer: u8, data: &'a [u8] },
    StrictSourceRoute { pointer: u8, data: &'a [u8] },
    Unknown { kind: u8, data: &'a [u8] },
}

impl<'a> Ipv4Option<'a> {
    /// Parse the option at the start of `buffer`, returning it and the rest of the buffer.
    pub fn parse(buffer: &'a [u8]) -> Result<(&'a [u8], Ipv4Option<'a>)> {
        let (length, option);
        match *buffer.get(0).ok_or(Error::Truncated)? {
            field::OPT_END => {
                length = 1;
                option = Ipv4Option::EndOfList;
            }
            field::OPT_NOP => {
                length = 1;
                option = Ipv4Option::NoOperation;
            }
            kind => {
                length = *buffer.get(1).ok_or(Error::Truncated)? as usize;
                if length < 2 {
                    return Err(Error::Malformed);
                }
                let data = buffer.get(2..length).ok_or(Error::Truncated)?;
                match kind {
                    field::OPT_RECORD_ROUTE => {
                        let (&pointer, data) = data.split_first().ok_or(Error::Malformed)?;
                        option = Ipv4Option::RecordRoute { pointer, data };
                    }
                    field::OPT_TIMESTAMP => {
                        if data.len() < 2 {
                            return Err(Error::Malformed);
                        }
                        option = Ipv4Option::Timestamp {
                            pointer: data[0],
                            overflow_flags: data[1],
                            data: &data[2..],
                        };
                    }
                    field::OPT_LOOSE_ROUTE => {
                        let (&pointer, data) = data.split_first().ok_or(Error::Malformed)?;
                        option = Ipv4Option::LooseSourceRoute { pointer, data };
                    }
                    field::OPT_STRICT_ROUTE => {
                        let (&pointer, data) = data.split_first().ok_or(Error::Malformed)?;
                        option = Ipv4Option::StrictSourceRoute { pointer, data };
                    }
                    _ => option = Ipv4Option::Unknown { kind, data },
                }
            }
        }
        Ok((&buffer[length..], option))
    }

    /// The number of octets this option occupies on the wire.
    pub fn buffer_len(&self) -> usize {
        match self {
            Ipv4Option::EndOfList | Ipv4Option::NoOperation => 1,
            Ipv4Option::RecordRoute { data, .. }
            | Ipv4Option::LooseSourceRoute { data, .. }
            | Ipv4Option::StrictSourceRoute { data, .. } => 3 + data.len(),
            Ipv4Option::Timestamp { data, .. } => 4 + data.len(),
            Ipv4Option::Unknown { data, .. } => 2 + data.len(),
        }
    }

    /// Emit the option at the start of `buffer`, returning the remaining buffer.
    pub fn emit<'b>(&self, buffer: &'b mut [u8]) -> &'b mut [u8] {
        let length = self.buffer_len();
        match *self {
            Ipv4Option::EndOfList => buffer[0] = field::OPT_END,
            Ipv4Option::NoOperation => buffer[0] = field::OPT_NOP,
            Ipv4Option::RecordRoute { pointer, data } => {
                buffer[0] = field::OPT_RECORD_ROUTE;
                buffer[1] = length as u8;
                buffer[2] = pointer;
                buffer[3..length].copy_from_slice(data);
            }
            Ipv4Option::Timestamp { pointer, overflow_flags, data } => {
                buffer[0] = field::OPT_TIMESTAMP;
                buffer[1] = length as u8;
                buffer[2] = pointer;
                buffer[3] = overflow_flags;
                buffer[4..length].copy_from_slice(data);
            }
            Ipv4Option::LooseSourceRoute { pointer, data } => {
                buffer[0] = field::OPT_LOOSE_ROUTE;
                buffer[1] = length as u8;
                buffer[2] = pointer;
                buffer[3..length].copy_from_slice(data);
            }
            Ipv4Option::StrictSourceRoute { pointer, data } => {
                buffer[0] = field::OPT_STRICT_ROUTE;
                buffer[1] = length as u8;
                buffer[2] = pointer;
                buffer[3..length].copy_from_slice(data);
            }
            Ipv4Option::Unknown { kind, data } => {
                buffer[0] = kind;
                buffer[1] = length as u8;
                buffer[2..length].copy_from_slice(data);
            }
        }
        &mut buffer[length..]
    }
}

/// A high-level representation of an IPv4 packet header.
///
/// Options are not part of the representation; they are accessed through [`ipv4::options`] and
/// [`Ipv4Option::parse`] since egress packets built by this stack never carry any.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr {
    pub src_addr: Address,
    pub dst_addr: Address,
    pub protocol: Protocol,
    pub payload_len: usize,
    pub hop_limit: u8,
    pub ident: u16,
    pub dont_frag: bool,
    pub more_frags: bool,
    pub frag_offset: u16,
}

impl Repr {
    /// Parse an IPv4 packet and return a high-level representation.
    ///
    /// The header checksum is verified here; TCP/UDP payloads are not.
    pub fn parse(packet: &ipv4) -> Result<Repr> {
        packet.check_len()?;
        if packet.version() != 4 {
            return Err(Error::Malformed);
        }
        if !packet.verify_checksum() {
            return Err(Error::WrongChecksum);
        }
        Ok(Repr {
            src_addr: packet.src_addr(),
            dst_addr: packet.dst_addr(),
            protocol: packet.protocol(),
            payload_len: packet.payload_slice().len(),
            hop_limit: packet.hop_limit(),
            ident: packet.ident(),
            dont_frag: packet.dont_frag(),
            more_frags: packet.more_frags(),
            frag_offset: packet.frag_offset(),
        })
    }

    /// Whether this datagram is one fragment of a larger one.
    pub fn is_fragment(&self) -> bool {
        self.more_frags || self.frag_offset != 0
    }

    /// Return the length of a header that will be emitted from this high-level representation.
    pub fn header_len(&self) -> usize {
        field::DST_ADDR.end
    }

    /// Return the length of a packet that will be emitted from this high-level representation.
    pub fn buffer_len(&self) -> usize {
        self.header_len() + self.payload_len
    }

    /// Emit a high-level representation into an IPv4 packet, filling the header checksum.
    pub fn emit(&self, packet: &mut ipv4) {
        packet.set_version(4);
        packet.set_header_len(self.header_len() as u8);
        packet.set_dscp_ecn(0);
        packet.set_total_len(self.buffer_len() as u16);
        packet.set_ident(self.ident);
        packet.set_frag_fields(self.dont_frag, self.more_frags, self.frag_offset);
        packet.set_hop_limit(self.hop_limit);
        packet.set_protocol(self.protocol);
        packet.set_src_addr(self.src_addr);
        packet.set_dst_addr(self.dst_addr);
        packet.fill_checksum();
    }
}

impl fmt::Display for Repr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "IPv4 src={} dst={} proto={} len={}",
               self.src_addr, self.dst_addr, self.protocol, self.payload_len)?;
        if self.is_fragment() {
            write!(f, " frag={}{}", self.frag_offset, if self.more_frags { "+" } else { "" })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    static PACKET_BYTES: [u8; 30] =
        [0x45, 0x00, 0x00, 0x1e,
         0x01, 0x02, 0x62, 0x03,
         0x1a, 0x01, 0xd5, 0x6e,
         0x11, 0x12, 0x13, 0x14,
         0x21, 0x22, 0x23, 0x24,
         0xaa, 0x00, 0x00, 0xff,
         0x00, 0x00, 0x00, 0x00,
         0x00, 0x00];

    static PAYLOAD_BYTES: [u8; 10] =
        [0xaa, 0x00, 0x00, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

    fn packet_repr() -> Repr {
        Repr {
            src_addr: Address([0x11, 0x12, 0x13, 0x14]),
            dst_addr: Address([0x21, 0x22, 0x23, 0x24]),
            protocol: Protocol::Unknown(0x01),
            payload_len: 10,
            hop_limit: 0x1a,
            ident: 0x0102,
            dont_frag: true,
            more_frags: true,
            frag_offset: 0x203 * 8,
        }
    }

    #[test]
    fn test_deconstruct() {
        let packet = ipv4::new_checked(&PACKET_BYTES[..]).unwrap();
        assert_eq!(packet.version(), 4);
        assert_eq!(packet.header_len(), 20);
        assert_eq!(packet.total_len(), 30);
        assert_eq!(packet.ident(), 0x0102);
        assert_eq!(packet.dont_frag(), true);
        assert_eq!(packet.more_frags(), true);
        assert_eq!(packet.frag_offset(), 0x203 * 8);
        assert_eq!(packet.hop_limit(), 0x1a);
        assert_eq!(packet.protocol(), Protocol::Icmp);
        assert_eq!(packet.checksum(), 0xd56e);
        assert_eq!(packet.src_addr(), Address([0x11, 0x12, 0x13, 0x14]));
        assert_eq!(packet.dst_addr(), Address([0x21, 0x22, 0x23, 0x24]));
        assert_eq!(packet.verify_checksum(), true);
        assert_eq!(packet.payload_slice(), &PAYLOAD_BYTES[..]);
    }

    #[test]
    fn test_construct() {
        let mut bytes = vec![0xa5; 30];
        let packet = ipv4::new_unchecked_mut(&mut bytes);
        packet.set_version(4);
        packet.set_header_len(20);
        packet.set_dscp_ecn(0);
        packet.set_total_len(30);
        packet.set_ident(0x0102);
        packet.set_frag_fields(true, true, 0x203 * 8);
        packet.set_hop_limit(0x1a);
        packet.set_protocol(Protocol::Icmp);
        packet.set_src_addr(Address([0x11, 0x12, 0x13, 0x14]));
        packet.set_dst_addr(Address([0x21, 0x22, 0x23, 0x24]));
        packet.fill_checksum();
        packet.payload_mut_slice().copy_from_slice(&PAYLOAD_BYTES[..]);
        assert_eq!(&bytes[..], &PACKET_BYTES[..]);
    }

    #[test]
    fn test_repr_round_trip() {
        // The protocol byte in the static packet is ICMP.
        let mut repr = packet_repr();
        repr.protocol = Protocol::Icmp;

        let mut bytes = vec![0; repr.buffer_len()];
        repr.emit(ipv4::new_unchecked_mut(&mut bytes));
        ipv4::new_unchecked_mut(&mut bytes)
            .payload_mut_slice()
            .copy_from_slice(&PAYLOAD_BYTES[..]);
        assert_eq!(&bytes[..], &PACKET_BYTES[..]);

        let parsed = Repr::parse(ipv4::new_checked(&bytes).unwrap()).unwrap();
        assert_eq!(parsed, repr);
    }

    #[test]
    fn test_truncated() {
        assert_eq!(ipv4::new_checked(&PACKET_BYTES[..19]).err(), Some(Error::Truncated));
    }

    #[test]
    fn test_corrupt_checksum() {
        let mut bytes = PACKET_BYTES;
        bytes[10] ^= 0xff;
        let packet = ipv4::new_checked(&bytes[..]).unwrap();
        assert_eq!(Repr::parse(packet).err(), Some(Error::WrongChecksum));
    }

    #[test]
    fn test_options_parse() {
        // NOP, RR(len 7, ptr 4, one recorded hop), EOL.
        static OPTIONS: [u8; 9] = [0x01, 0x07, 0x07, 0x04, 10, 0, 0, 1, 0x00];
        let (rest, nop) = Ipv4Option::parse(&OPTIONS[..]).unwrap();
        assert_eq!(nop, Ipv4Option::NoOperation);
        let (rest, rr) = Ipv4Option::parse(rest).unwrap();
        assert_eq!(rr, Ipv4Option::RecordRoute { pointer: 4, data: &[10, 0, 0, 1] });
        let (_, end) = Ipv4Option::parse(rest).unwrap();
        assert_eq!(end, Ipv4Option::EndOfList);
    }

    #[test]
    fn test_unknown_option_preserved() {
        static OPTION: [u8; 5] = [0x94, 0x05, 0x01, 0x02, 0x03];
        let (_, opt) = Ipv4Option::parse(&OPTION[..]).unwrap();
        assert_eq!(opt, Ipv4Option::Unknown { kind: 0x94, data: &[0x01, 0x02, 0x03] });
        let mut out = [0u8; 5];
        opt.emit(&mut out);
        assert_eq!(out, OPTION);
    }
}
