use byteorder::{ByteOrder, NetworkEndian};

use super::ip::{checksum, Protocol};
use super::ipv4::Address as Ipv4Address;
use super::{Error, Result};

byte_wrapper! {
    /// A byte sequence representing a UDP datagram.
    #[derive(Debug, PartialEq, Eq)]
    pub struct udp([u8]);
}

mod field {
    use crate::wire::field::{Field, Rest};

    pub(crate) const SRC_PORT: Field = 0..2;
    pub(crate) const DST_PORT: Field = 2..4;
    pub(crate) const LENGTH: Field = 4..6;
    pub(crate) const CHECKSUM: Field = 6..8;

    pub(crate) const PAYLOAD: Rest = 8..;
}

/// The length of a UDP header.
pub const HEADER_LEN: usize = field::PAYLOAD.start;

impl udp {
    /// Imbue a raw octet buffer with UDP datagram structure.
    pub fn new_unchecked(buffer: &[u8]) -> &udp {
        Self::__from_macro_new_unchecked(buffer)
    }

    /// Imbue a mutable octet buffer with UDP datagram structure.
    pub fn new_unchecked_mut(buffer: &mut [u8]) -> &mut udp {
        Self::__from_macro_new_unchecked_mut(buffer)
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(data: &[u8]) -> Result<&udp> {
        let packet = Self::new_unchecked(data);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no accessor method will panic if called.
    pub fn check_len(&self) -> Result<()> {
        if self.0.len() < HEADER_LEN {
            return Err(Error::Truncated);
        }
        let len = self.len() as usize;
        if len < HEADER_LEN {
            return Err(Error::Malformed);
        }
        if len > self.0.len() {
            return Err(Error::Truncated);
        }
        Ok(())
    }

    /// Return the source port field.
    pub fn src_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::SRC_PORT])
    }

    /// Return the destination port field.
    pub fn dst_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::DST_PORT])
    }

    /// Return the length field.
    pub fn len(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::LENGTH])
    }

    /// Return the checksum field.
    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::CHECKSUM])
    }

    /// Return the payload as a byte slice.
    pub fn payload_slice(&self) -> &[u8] {
        &self.0[HEADER_LEN..self.len() as usize]
    }

    /// Set the source port field.
    pub fn set_src_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::SRC_PORT], value)
    }

    /// Set the destination port field.
    pub fn set_dst_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::DST_PORT], value)
    }

    /// Set the length field.
    pub fn set_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::LENGTH], value)
    }

    /// Set the checksum field.
    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::CHECKSUM], value)
    }

    /// Return the payload as a mutable byte slice.
    pub fn payload_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len() as usize;
        &mut self.0[HEADER_LEN..len]
    }

    /// Compute and fill in the checksum, using the IPv4 pseudo header.
    ///
    /// A computed checksum of zero is transmitted as all ones, since zero marks the checksum as
    /// absent.
    pub fn fill_checksum(&mut self, src_addr: Ipv4Address, dst_addr: Ipv4Address) {
        self.set_checksum(0);
        let sum = {
            let len = self.len() as usize;
            !checksum::combine(&[
                checksum::pseudo_header(&src_addr, &dst_addr, Protocol::Udp, len as u32),
                checksum::data(&self.0[..len]),
            ])
        };
        self.set_checksum(if sum == 0 { 0xffff } else { sum })
    }
}

impl AsRef<[u8]> for udp {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A high-level representation of a UDP header.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload_len: usize,
}

impl Repr {
    /// Parse a UDP datagram and return a high-level representation.
    ///
    /// The checksum is not validated, only filled in on emission.
    pub fn parse(packet: &udp) -> Result<Repr> {
        packet.check_len()?;
        if packet.dst_port() == 0 {
            return Err(Error::Malformed);
        }
        Ok(Repr {
            src_port: packet.src_port(),
            dst_port: packet.dst_port(),
            payload_len: packet.payload_slice().len(),
        })
    }

    /// Return the length of a datagram that will be emitted from this high-level representation.
    pub fn buffer_len(&self) -> usize {
        HEADER_LEN + self.payload_len
    }

    /// Emit a high-level representation into a UDP datagram, filling the checksum.
    pub fn emit(&self, packet: &mut udp, src_addr: Ipv4Address, dst_addr: Ipv4Address) {
        packet.set_src_port(self.src_port);
        packet.set_dst_port(self.dst_port);
        packet.set_len(self.buffer_len() as u16);
        packet.fill_checksum(src_addr, dst_addr)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SRC_ADDR: Ipv4Address = Ipv4Address([192, 168, 1, 1]);
    const DST_ADDR: Ipv4Address = Ipv4Address([192, 168, 1, 2]);

    static PACKET_BYTES: [u8; 12] =
        [0xbf, 0x00, 0x00, 0x35,
         0x00, 0x0c, 0x12, 0x4d,
         0xaa, 0x00, 0x00, 0xff];

    static PAYLOAD_BYTES: [u8; 4] = [0xaa, 0x00, 0x00, 0xff];

    #[test]
    fn test_deconstruct() {
        let packet = udp::new_checked(&PACKET_BYTES[..]).unwrap();
        assert_eq!(packet.src_port(), 48896);
        assert_eq!(packet.dst_port(), 53);
        assert_eq!(packet.len(), 12);
        assert_eq!(packet.checksum(), 0x124d);
        assert_eq!(packet.payload_slice(), &PAYLOAD_BYTES[..]);
    }

    #[test]
    fn test_construct() {
        let repr = Repr {
            src_port: 48896,
            dst_port: 53,
            payload_len: 4,
        };
        let mut bytes = vec![0; repr.buffer_len()];
        {
            let packet = udp::new_unchecked_mut(&mut bytes);
            packet.set_len(repr.buffer_len() as u16);
            packet.payload_mut_slice().copy_from_slice(&PAYLOAD_BYTES[..]);
            repr.emit(packet, SRC_ADDR, DST_ADDR);
        }
        assert_eq!(&bytes[..], &PACKET_BYTES[..]);
    }

    #[test]
    fn test_zero_dst_port() {
        let mut bytes = PACKET_BYTES;
        bytes[2] = 0;
        bytes[3] = 0;
        let packet = udp::new_checked(&bytes[..]).unwrap();
        assert_eq!(Repr::parse(packet).err(), Some(Error::Malformed));
    }

    #[test]
    fn test_truncated() {
        assert_eq!(udp::new_checked(&PACKET_BYTES[..7]).err(), Some(Error::Truncated));
    }
}
