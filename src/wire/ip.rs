use core::fmt;

use super::ipv4::Address;

enum_with_unknown! {
    /// IP payload protocol type.
    pub enum Protocol(u8) {
        Icmp = 1,
        Tcp = 6,
        Udp = 17,
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Protocol::Icmp => write!(f, "ICMP"),
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Unknown(id) => write!(f, "0x{:02x}", id),
        }
    }
}

/// A classless IPv4 network prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    address: Address,
    prefix: u8,
}

impl Cidr {
    /// Create a network prefix from an address and prefix length.
    ///
    /// # Panics
    /// This function panics if the prefix length is larger than 32.
    pub fn new(address: Address, prefix: u8) -> Cidr {
        assert!(prefix <= 32);
        Cidr { address, prefix }
    }

    /// The base address of the prefix.
    pub fn address(&self) -> Address {
        self.address
    }

    /// The prefix length.
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// The subnet mask as an address.
    pub fn netmask(&self) -> Address {
        Address::BROADCAST.mask(self.prefix)
    }

    /// Query whether `addr` falls into this prefix.
    pub fn contains(&self, addr: Address) -> bool {
        addr.mask(self.prefix) == self.address.mask(self.prefix)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

/// RFC 1071 Internet checksum routines.
pub mod checksum {
    use byteorder::{ByteOrder, NetworkEndian};

    use super::{Address, Protocol};

    fn propagate_carries(word: u32) -> u16 {
        let sum = (word >> 16) + (word & 0xffff);
        ((sum >> 16) as u16) + (sum as u16)
    }

    /// Compute an RFC 1071 compliant checksum (without the final complement).
    pub fn data(mut data: &[u8]) -> u16 {
        let mut accum = 0u32;

        while data.len() >= 2 {
            accum += NetworkEndian::read_u16(data) as u32;
            data = &data[2..];
        }

        // The last remaining odd byte is padded with a zero octet.
        if let Some(&value) = data.first() {
            accum += (value as u32) << 8;
        }

        propagate_carries(accum)
    }

    /// Combine several RFC 1071 compliant checksums.
    pub fn combine(checksums: &[u16]) -> u16 {
        let mut accum: u32 = 0;
        for &word in checksums {
            accum += word as u32;
        }
        propagate_carries(accum)
    }

    /// Compute the IPv4 pseudo header checksum for an upper layer protocol.
    pub fn pseudo_header(src_addr: &Address, dst_addr: &Address,
                         protocol: Protocol, length: u32) -> u16 {
        let mut proto_len = [0u8; 4];
        proto_len[1] = protocol.into();
        NetworkEndian::write_u16(&mut proto_len[2..4], length as u16);

        combine(&[
            data(src_addr.as_bytes()),
            data(dst_addr.as_bytes()),
            data(&proto_len[..]),
        ])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cidr_contains() {
        let net = Cidr::new(Address([10, 0, 2, 0]), 24);
        assert!(net.contains(Address([10, 0, 2, 15])));
        assert!(!net.contains(Address([10, 0, 3, 15])));
        assert_eq!(net.netmask(), Address([255, 255, 255, 0]));
    }

    #[test]
    fn checksum_self_consistent() {
        // Computing the checksum over data that already carries a correct checksum yields
        // all-ones before the final complement, i.e. `!0`.
        let mut packet = [0x45u8, 0x00, 0x00, 0x1c, 0x1c, 0x46, 0x40, 0x00,
                          0x40, 0x11, 0x00, 0x00, 0xac, 0x10, 0x0a, 0x63,
                          0xac, 0x10, 0x0a, 0x0c];
        let sum = !checksum::data(&packet);
        packet[10] = (sum >> 8) as u8;
        packet[11] = sum as u8;
        assert_eq!(checksum::data(&packet), !0);
    }

    #[test]
    fn checksum_odd_length() {
        // One trailing odd byte is padded on the right with zeros.
        assert_eq!(checksum::data(&[0x12, 0x34, 0x56]), 0x6834);
    }
}
