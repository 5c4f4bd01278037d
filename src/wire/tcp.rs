use core::{cmp, fmt, ops};
use byteorder::{ByteOrder, NetworkEndian};

use super::ip::{checksum, Protocol};
use super::ipv4::Address as Ipv4Address;
use super::{Error, Result};

/// A TCP sequence number.
///
/// A sequence number is a monotonically advancing integer modulo 2<sup>32</sup>.
/// Sequence numbers do not have a discontiguity when compared pairwise across a signed overflow.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Hash)]
pub struct SeqNumber(pub i32);

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0 as u32)
    }
}

impl ops::Add<usize> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: usize) -> SeqNumber {
        if rhs > i32::MAX as usize {
            panic!("attempt to add to sequence number with unsigned overflow")
        }
        SeqNumber(self.0.wrapping_add(rhs as i32))
    }
}

impl ops::Sub<usize> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: usize) -> SeqNumber {
        if rhs > i32::MAX as usize {
            panic!("attempt to subtract to sequence number with unsigned overflow")
        }
        SeqNumber(self.0.wrapping_sub(rhs as i32))
    }
}

impl ops::AddAssign<usize> for SeqNumber {
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

impl ops::Sub for SeqNumber {
    type Output = usize;

    fn sub(self, rhs: SeqNumber) -> usize {
        let result = self.0.wrapping_sub(rhs.0);
        if result < 0 {
            panic!("attempt to subtract sequence numbers with underflow")
        }
        result as usize
    }
}

impl cmp::PartialOrd for SeqNumber {
    fn partial_cmp(&self, other: &SeqNumber) -> Option<cmp::Ordering> {
        self.0.wrapping_sub(other.0).partial_cmp(&0)
    }
}

/// A set of tcp flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags(pub u16);

byte_wrapper! {
    /// A byte sequence representing a TCP segment.
    #[derive(Debug, PartialEq, Eq)]
    pub struct tcp([u8]);
}

mod field {
    #![allow(non_snake_case)]

    use crate::wire::field::Field;

    pub(crate) const SRC_PORT: Field = 0..2;
    pub(crate) const DST_PORT: Field = 2..4;
    pub(crate) const SEQ_NUM:  Field = 4..8;
    pub(crate) const ACK_NUM:  Field = 8..12;
    pub(crate) const FLAGS:    Field = 12..14;
    pub(crate) const WIN_SIZE: Field = 14..16;
    pub(crate) const CHECKSUM: Field = 16..18;
    pub(crate) const URGENT:   Field = 18..20;

    pub(crate) fn OPTIONS(length: u8) -> Field {
        URGENT.end..(length as usize)
    }

    pub(crate) const FLG_FIN: u16 = 0x001;
    pub(crate) const FLG_SYN: u16 = 0x002;
    pub(crate) const FLG_RST: u16 = 0x004;
    pub(crate) const FLG_PSH: u16 = 0x008;
    pub(crate) const FLG_ACK: u16 = 0x010;
    pub(crate) const FLG_URG: u16 = 0x020;

    pub(crate) const OPT_END: u8 = 0x00;
    pub(crate) const OPT_NOP: u8 = 0x01;
    pub(crate) const OPT_MSS: u8 = 0x02;
    pub(crate) const OPT_WS:  u8 = 0x03;
    pub(crate) const OPT_SACKPERM: u8 = 0x04;
    pub(crate) const OPT_SACKRNG:  u8 = 0x05;
    pub(crate) const OPT_TIMESTAMP: u8 = 0x08;
}

/// The smallest valid TCP header length, in octets.
pub const HEADER_LEN: usize = 20;

impl tcp {
    /// Imbue a raw octet buffer with TCP segment structure.
    pub fn new_unchecked(buffer: &[u8]) -> &tcp {
        Self::__from_macro_new_unchecked(buffer)
    }

    /// Imbue a mutable octet buffer with TCP segment structure.
    pub fn new_unchecked_mut(buffer: &mut [u8]) -> &mut tcp {
        Self::__from_macro_new_unchecked_mut(buffer)
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(data: &[u8]) -> Result<&tcp> {
        let packet = Self::new_unchecked(data);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no accessor method will panic if called.
    pub fn check_len(&self) -> Result<()> {
        if self.0.len() < HEADER_LEN {
            return Err(Error::Truncated);
        }
        let header_len = self.header_len() as usize;
        if header_len < HEADER_LEN || header_len > self.0.len() {
            return Err(Error::Malformed);
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

    /// Return the sequence number field.
    pub fn seq_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_i32(&self.0[field::SEQ_NUM]))
    }

    /// Return the acknowledgement number field.
    pub fn ack_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_i32(&self.0[field::ACK_NUM]))
    }

    /// Return the complete flags of the packet.
    pub fn flags(&self) -> Flags {
        let raw = NetworkEndian::read_u16(&self.0[field::FLAGS]);
        Flags(raw & 0x3f)
    }

    /// Return the header length, in octets.
    pub fn header_len(&self) -> u8 {
        let raw = NetworkEndian::read_u16(&self.0[field::FLAGS]);
        ((raw >> 12) * 4) as u8
    }

    /// Return the window size field.
    pub fn window_len(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::WIN_SIZE])
    }

    /// Return the checksum field.
    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::CHECKSUM])
    }

    /// Return the urgent pointer field.
    pub fn urgent_at(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::URGENT])
    }

    /// Return a pointer to the options.
    pub fn options(&self) -> &[u8] {
        &self.0[field::OPTIONS(self.header_len())]
    }

    /// Return the payload as a byte slice.
    pub fn payload_slice(&self) -> &[u8] {
        &self.0[self.header_len() as usize..]
    }

    /// Validate the segment checksum against the IPv4 pseudo header.
    pub fn verify_checksum(&self, src_addr: Ipv4Address, dst_addr: Ipv4Address) -> bool {
        checksum::combine(&[
            checksum::pseudo_header(&src_addr, &dst_addr, Protocol::Tcp, self.0.len() as u32),
            checksum::data(&self.0),
        ]) == !0
    }

    /// Set the source port field.
    pub fn set_src_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::SRC_PORT], value)
    }

    /// Set the destination port field.
    pub fn set_dst_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::DST_PORT], value)
    }

    /// Set the sequence number field.
    pub fn set_seq_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_i32(&mut self.0[field::SEQ_NUM], value.0)
    }

    /// Set the acknowledgement number field.
    pub fn set_ack_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_i32(&mut self.0[field::ACK_NUM], value.0)
    }

    /// Set the complete flags of the packet, preserving the header length.
    pub fn set_flags(&mut self, flags: Flags) {
        let raw = NetworkEndian::read_u16(&self.0[field::FLAGS]);
        // Clears the reserved bits 6..11 along the way.
        let raw = (raw & 0xf000) | (flags.0 & 0x3f);
        NetworkEndian::write_u16(&mut self.0[field::FLAGS], raw)
    }

    /// Set the header length, in octets.
    pub fn set_header_len(&mut self, value: u8) {
        let raw = NetworkEndian::read_u16(&self.0[field::FLAGS]);
        let raw = (raw & 0x0fff) | ((value as u16 / 4) << 12);
        NetworkEndian::write_u16(&mut self.0[field::FLAGS], raw)
    }

    /// Set the window size field.
    pub fn set_window_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::WIN_SIZE], value)
    }

    /// Set the checksum field.
    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::CHECKSUM], value)
    }

    /// Set the urgent pointer field.
    pub fn set_urgent_at(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::URGENT], value)
    }

    /// Compute and fill in the checksum, using the IPv4 pseudo header.
    pub fn fill_checksum(&mut self, src_addr: Ipv4Address, dst_addr: Ipv4Address) {
        self.set_checksum(0);
        let sum = {
            !checksum::combine(&[
                checksum::pseudo_header(&src_addr, &dst_addr, Protocol::Tcp,
                                        self.0.len() as u32),
                checksum::data(&self.0),
            ])
        };
        self.set_checksum(sum)
    }

    /// Return a mutable pointer to the options.
    pub fn options_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len();
        &mut self.0[field::OPTIONS(header_len)]
    }

    /// Return the payload as a mutable byte slice.
    pub fn payload_mut_slice(&mut self) -> &mut [u8] {
        let header_len = self.header_len() as usize;
        &mut self.0[header_len..]
    }
}

impl AsRef<[u8]> for tcp {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Flags {
    pub const FIN: Flags = Flags(field::FLG_FIN);
    pub const SYN: Flags = Flags(field::FLG_SYN);
    pub const RST: Flags = Flags(field::FLG_RST);
    pub const PSH: Flags = Flags(field::FLG_PSH);
    pub const ACK: Flags = Flags(field::FLG_ACK);

    /// Return the FIN flag.
    #[inline]
    pub fn fin(&self) -> bool {
        self.0 & field::FLG_FIN != 0
    }

    /// Return the SYN flag.
    #[inline]
    pub fn syn(&self) -> bool {
        self.0 & field::FLG_SYN != 0
    }

    /// Return the RST flag.
    #[inline]
    pub fn rst(&self) -> bool {
        self.0 & field::FLG_RST != 0
    }

    /// Return the PSH flag.
    #[inline]
    pub fn psh(&self) -> bool {
        self.0 & field::FLG_PSH != 0
    }

    /// Return the ACK flag.
    #[inline]
    pub fn ack(&self) -> bool {
        self.0 & field::FLG_ACK != 0
    }

    /// Return the URG flag.
    #[inline]
    pub fn urg(&self) -> bool {
        self.0 & field::FLG_URG != 0
    }

    /// Set the FIN flag.
    #[inline]
    pub fn set_fin(&mut self, value: bool) {
        let flag = if value { field::FLG_FIN } else { 0 };
        self.0 = (self.0 & !field::FLG_FIN) | flag;
    }

    /// Set the SYN flag.
    #[inline]
    pub fn set_syn(&mut self, value: bool) {
        let flag = if value { field::FLG_SYN } else { 0 };
        self.0 = (self.0 & !field::FLG_SYN) | flag;
    }

    /// Set the RST flag.
    #[inline]
    pub fn set_rst(&mut self, value: bool) {
        let flag = if value { field::FLG_RST } else { 0 };
        self.0 = (self.0 & !field::FLG_RST) | flag;
    }

    /// Set the PSH flag.
    #[inline]
    pub fn set_psh(&mut self, value: bool) {
        let flag = if value { field::FLG_PSH } else { 0 };
        self.0 = (self.0 & !field::FLG_PSH) | flag;
    }

    /// Set the ACK flag.
    #[inline]
    pub fn set_ack(&mut self, value: bool) {
        let flag = if value { field::FLG_ACK } else { 0 };
        self.0 = (self.0 & !field::FLG_ACK) | flag;
    }

    /// Return the length of the control flags, in terms of sequence space.
    pub fn sequence_len(self) -> usize {
        (if self.syn() { 1 } else { 0 })
        + (if self.fin() { 1 } else { 0 })
    }
}

impl ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// The maximum number of selective acknowledgement ranges in a single segment.
///
/// RFC 2018: a SACK option that specifies n blocks will have a length of 8*n+2 bytes, so the 40
/// bytes available for TCP options can specify a maximum of 4 blocks.
pub const MAX_SACK_RANGES: usize = 4;

/// A representation of a single TCP option.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TcpOption<'a> {
    EndOfList,
    NoOperation,
    MaxSegmentSize(u16),
    WindowScale(u8),
    SackPermitted,
    SackRange([Option<(u32, u32)>; MAX_SACK_RANGES]),
    TimeStamp { tsval: u32, tsecr: u32 },
    Unknown { kind: u8, data: &'a [u8] },
}

impl<'a> TcpOption<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<(&'a [u8], TcpOption<'a>)> {
        let (length, option);
        match *buffer.get(0).ok_or(Error::Truncated)? {
            field::OPT_END => {
                length = 1;
                option = TcpOption::EndOfList;
            }
            field::OPT_NOP => {
                length = 1;
                option = TcpOption::NoOperation;
            }
            kind => {
                length = *buffer.get(1).ok_or(Error::Truncated)? as usize;
                if length < 2 {
                    return Err(Error::Malformed);
                }
                let data = buffer.get(2..length).ok_or(Error::Truncated)?;
                match (kind, length) {
                    (field::OPT_MSS, 4) =>
                        option = TcpOption::MaxSegmentSize(NetworkEndian::read_u16(data)),
                    (field::OPT_MSS, _) =>
                        return Err(Error::Malformed),
                    (field::OPT_WS, 3) =>
                        option = TcpOption::WindowScale(data[0]),
                    (field::OPT_WS, _) =>
                        return Err(Error::Malformed),
                    (field::OPT_SACKPERM, 2) =>
                        option = TcpOption::SackPermitted,
                    (field::OPT_SACKPERM, _) =>
                        return Err(Error::Malformed),
                    (field::OPT_SACKRNG, n) => {
                        if n < 10 || (n - 2) % 8 != 0 {
                            return Err(Error::Malformed);
                        }
                        let mut sack_ranges = [None; MAX_SACK_RANGES];
                        sack_ranges.iter_mut().enumerate().for_each(|(i, nmut)| {
                            let left = i * 8;
                            *nmut = if left < data.len() {
                                let mid = left + 4;
                                let right = mid + 4;
                                Some((NetworkEndian::read_u32(&data[left..mid]),
                                      NetworkEndian::read_u32(&data[mid..right])))
                            } else {
                                None
                            };
                        });
                        option = TcpOption::SackRange(sack_ranges);
                    }
                    (field::OPT_TIMESTAMP, 10) =>
                        option = TcpOption::TimeStamp {
                            tsval: NetworkEndian::read_u32(&data[0..4]),
                            tsecr: NetworkEndian::read_u32(&data[4..8]),
                        },
                    (field::OPT_TIMESTAMP, _) =>
                        return Err(Error::Malformed),
                    (_, _) =>
                        option = TcpOption::Unknown { kind, data },
                }
            }
        }
        Ok((&buffer[length..], option))
    }

    pub fn buffer_len(&self) -> usize {
        match self {
            TcpOption::EndOfList => 1,
            TcpOption::NoOperation => 1,
            TcpOption::MaxSegmentSize(_) => 4,
            TcpOption::WindowScale(_) => 3,
            TcpOption::SackPermitted => 2,
            TcpOption::SackRange(s) => s.iter().filter(|s| s.is_some()).count() * 8 + 2,
            TcpOption::TimeStamp { .. } => 10,
            TcpOption::Unknown { data, .. } => 2 + data.len(),
        }
    }

    pub fn emit<'b>(&self, buffer: &'b mut [u8]) -> &'b mut [u8] {
        let length;
        match *self {
            TcpOption::EndOfList => {
                length = 1;
                // There may be padding space which also should be initialized.
                for p in buffer.iter_mut() {
                    *p = field::OPT_END;
                }
            }
            TcpOption::NoOperation => {
                length = 1;
                buffer[0] = field::OPT_NOP;
            }
            _ => {
                length = self.buffer_len();
                buffer[1] = length as u8;
                match *self {
                    TcpOption::EndOfList | TcpOption::NoOperation => unreachable!(),
                    TcpOption::MaxSegmentSize(value) => {
                        buffer[0] = field::OPT_MSS;
                        NetworkEndian::write_u16(&mut buffer[2..], value)
                    }
                    TcpOption::WindowScale(value) => {
                        buffer[0] = field::OPT_WS;
                        buffer[2] = value;
                    }
                    TcpOption::SackPermitted => {
                        buffer[0] = field::OPT_SACKPERM;
                    }
                    TcpOption::SackRange(slice) => {
                        buffer[0] = field::OPT_SACKRNG;
                        slice.iter().flatten().enumerate().for_each(|(i, &(first, second))| {
                            let pos = i * 8 + 2;
                            NetworkEndian::write_u32(&mut buffer[pos..], first);
                            NetworkEndian::write_u32(&mut buffer[pos + 4..], second);
                        });
                    }
                    TcpOption::TimeStamp { tsval, tsecr } => {
                        buffer[0] = field::OPT_TIMESTAMP;
                        NetworkEndian::write_u32(&mut buffer[2..6], tsval);
                        NetworkEndian::write_u32(&mut buffer[6..10], tsecr);
                    }
                    TcpOption::Unknown { kind, data: provided } => {
                        buffer[0] = kind;
                        buffer[2..length].copy_from_slice(provided)
                    }
                }
            }
        }
        &mut buffer[length..]
    }
}

/// A high-level representation of a TCP segment header.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr {
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: Flags,
    pub seq_number: SeqNumber,
    pub ack_number: Option<SeqNumber>,
    pub window_len: u16,
    pub window_scale: Option<u8>,
    pub max_seg_size: Option<u16>,
    pub sack_permitted: bool,
    pub sack_ranges: [Option<(u32, u32)>; MAX_SACK_RANGES],
    pub timestamp: Option<(u32, u32)>,
    pub payload_len: u16,
}

impl Repr {
    /// Parse a TCP segment and return a high-level representation.
    ///
    /// The checksum is not validated here, only filled in on emission.
    pub fn parse(packet: &tcp) -> Result<Repr> {
        packet.check_len()?;
        // Source and destination ports must be present.
        if packet.src_port() == 0 {
            return Err(Error::Malformed);
        }
        if packet.dst_port() == 0 {
            return Err(Error::Malformed);
        }

        let flags = packet.flags();
        let ack_number = if flags.ack() {
            Some(packet.ack_number())
        } else {
            None
        };
        // The URG flag and the urgent field are ignored.

        let mut max_seg_size = None;
        let mut window_scale = None;
        let mut sack_permitted = false;
        let mut sack_ranges = [None; MAX_SACK_RANGES];
        let mut timestamp = None;
        let mut options = packet.options();
        while !options.is_empty() {
            let (next_options, option) = TcpOption::parse(options)?;
            match option {
                TcpOption::EndOfList => break,
                TcpOption::NoOperation => (),
                TcpOption::MaxSegmentSize(value) => max_seg_size = Some(value),
                TcpOption::WindowScale(value) => {
                    // RFC 1323: if a Window Scale option is received with a shift.cnt value
                    // exceeding 14, the TCP should log the error but use 14 instead.
                    window_scale = if value > 14 {
                        net_debug!("window scaling factor {} too large, clamping to 14", value);
                        Some(14)
                    } else {
                        Some(value)
                    };
                }
                TcpOption::SackPermitted => sack_permitted = true,
                TcpOption::SackRange(slice) => sack_ranges = slice,
                TcpOption::TimeStamp { tsval, tsecr } => timestamp = Some((tsval, tsecr)),
                TcpOption::Unknown { .. } => (),
            }
            options = next_options;
        }

        Ok(Repr {
            src_port: packet.src_port(),
            dst_port: packet.dst_port(),
            flags,
            seq_number: packet.seq_number(),
            ack_number,
            window_len: packet.window_len(),
            window_scale,
            max_seg_size,
            sack_permitted,
            sack_ranges,
            timestamp,
            payload_len: packet.payload_slice().len() as u16,
        })
    }

    /// Return the length of a header that will be emitted from this high-level representation.
    ///
    /// The TCP header length is a multiple of 4.
    pub fn header_len(&self) -> usize {
        let mut length = field::URGENT.end;
        if self.max_seg_size.is_some() {
            length += 4
        }
        if self.window_scale.is_some() {
            length += 3
        }
        if self.sack_permitted {
            length += 2;
        }
        if self.timestamp.is_some() {
            length += 10;
        }
        let sack_range_len: usize =
            self.sack_ranges.iter().filter(|o| o.is_some()).count() * 8;
        if sack_range_len > 0 {
            length += sack_range_len + 2;
        }
        if length % 4 != 0 {
            length += 4 - length % 4;
        }
        length
    }

    /// Return the length of a segment that will be emitted from this high-level representation.
    pub fn buffer_len(&self) -> usize {
        self.header_len() + usize::from(self.payload_len)
    }

    /// Emit a high-level representation into a TCP segment, filling the checksum.
    pub fn emit(&self, packet: &mut tcp, src_addr: Ipv4Address, dst_addr: Ipv4Address) {
        packet.set_src_port(self.src_port);
        packet.set_dst_port(self.dst_port);
        packet.set_seq_number(self.seq_number);
        packet.set_ack_number(self.ack_number.unwrap_or(SeqNumber(0)));
        packet.set_header_len(self.header_len() as u8);
        let mut flags = self.flags;
        flags.set_ack(self.ack_number.is_some());
        packet.set_flags(flags);
        packet.set_window_len(self.window_len);
        {
            let mut options = packet.options_mut();
            if let Some(value) = self.window_scale {
                let tmp = options; options = TcpOption::WindowScale(value).emit(tmp);
            }
            if let Some(value) = self.max_seg_size {
                let tmp = options; options = TcpOption::MaxSegmentSize(value).emit(tmp);
            }
            if self.sack_permitted {
                let tmp = options; options = TcpOption::SackPermitted.emit(tmp);
            }
            if let Some((tsval, tsecr)) = self.timestamp {
                let tmp = options; options = TcpOption::TimeStamp { tsval, tsecr }.emit(tmp);
            }
            if self.sack_ranges.iter().any(|s| s.is_some()) {
                let tmp = options; options = TcpOption::SackRange(self.sack_ranges).emit(tmp);
            }
            if !options.is_empty() {
                TcpOption::EndOfList.emit(options);
            }
        }
        packet.set_urgent_at(0);
        packet.fill_checksum(src_addr, dst_addr)
    }

    /// Return the length of the segment, in terms of sequence space.
    pub fn sequence_len(&self) -> usize {
        usize::from(self.payload_len) + self.flags.sequence_len()
    }
}

impl fmt::Display for Repr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TCP src={} dst={}", self.src_port, self.dst_port)?;
        if self.flags.syn() { write!(f, " syn")? }
        if self.flags.fin() { write!(f, " fin")? }
        if self.flags.rst() { write!(f, " rst")? }
        if self.flags.psh() { write!(f, " psh")? }
        write!(f, " seq={}", self.seq_number)?;
        if let Some(ack_number) = self.ack_number {
            write!(f, " ack={}", ack_number)?;
        }
        write!(f, " win={}", self.window_len)?;
        write!(f, " len={}", self.payload_len)?;
        if let Some(max_seg_size) = self.max_seg_size {
            write!(f, " mss={}", max_seg_size)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SRC_ADDR: Ipv4Address = Ipv4Address([192, 168, 1, 1]);
    const DST_ADDR: Ipv4Address = Ipv4Address([192, 168, 1, 2]);

    static SYN_PACKET_BYTES: [u8; 32] =
        [0xbf, 0x00, 0x00, 0x50,
         0x01, 0x23, 0x45, 0x67,
         0x00, 0x00, 0x00, 0x00,
         0x80, 0x02, 0xff, 0xf0,
         0x32, 0xa8, 0x00, 0x00,
         0x03, 0x03, 0x07, 0x02,
         0x04, 0x05, 0xb4, 0x04,
         0x02, 0x00, 0x00, 0x00];

    fn syn_repr() -> Repr {
        Repr {
            src_port: 48896,
            dst_port: 80,
            flags: Flags::SYN,
            seq_number: SeqNumber(0x01234567),
            ack_number: None,
            window_len: 0xfff0,
            window_scale: Some(7),
            max_seg_size: Some(1460),
            sack_permitted: true,
            sack_ranges: [None; MAX_SACK_RANGES],
            timestamp: None,
            payload_len: 0,
        }
    }

    #[test]
    fn test_deconstruct() {
        let packet = tcp::new_checked(&SYN_PACKET_BYTES[..]).unwrap();
        assert_eq!(packet.src_port(), 48896);
        assert_eq!(packet.dst_port(), 80);
        assert_eq!(packet.seq_number(), SeqNumber(0x01234567));
        assert_eq!(packet.flags(), Flags::SYN);
        assert_eq!(packet.header_len(), 32);
        assert_eq!(packet.window_len(), 0xfff0);
        assert_eq!(packet.checksum(), 0x32a8);
        assert_eq!(packet.verify_checksum(SRC_ADDR, DST_ADDR), true);
        assert_eq!(Repr::parse(packet).unwrap(), syn_repr());
    }

    #[test]
    fn test_construct() {
        let repr = syn_repr();
        let mut bytes = vec![0xa5; repr.buffer_len()];
        repr.emit(tcp::new_unchecked_mut(&mut bytes), SRC_ADDR, DST_ADDR);
        assert_eq!(&bytes[..], &SYN_PACKET_BYTES[..]);
    }

    #[test]
    fn test_timestamp_option() {
        let repr = Repr {
            timestamp: Some((0x11223344, 0x55667788)),
            window_scale: None,
            max_seg_size: None,
            sack_permitted: false,
            flags: Flags::ACK,
            ack_number: Some(SeqNumber(0x100)),
            ..syn_repr()
        };
        let mut bytes = vec![0; repr.buffer_len()];
        repr.emit(tcp::new_unchecked_mut(&mut bytes), SRC_ADDR, DST_ADDR);
        let parsed = Repr::parse(tcp::new_checked(&bytes).unwrap()).unwrap();
        assert_eq!(parsed.timestamp, Some((0x11223344, 0x55667788)));
        assert_eq!(parsed.ack_number, Some(SeqNumber(0x100)));
    }

    #[test]
    fn test_sack_ranges() {
        let mut sack_ranges = [None; MAX_SACK_RANGES];
        sack_ranges[0] = Some((1000, 2000));
        sack_ranges[1] = Some((3000, 4000));
        let repr = Repr {
            flags: Flags::ACK,
            ack_number: Some(SeqNumber(500)),
            window_scale: None,
            max_seg_size: None,
            sack_permitted: false,
            sack_ranges,
            ..syn_repr()
        };
        let mut bytes = vec![0; repr.buffer_len()];
        repr.emit(tcp::new_unchecked_mut(&mut bytes), SRC_ADDR, DST_ADDR);
        let parsed = Repr::parse(tcp::new_checked(&bytes).unwrap()).unwrap();
        assert_eq!(parsed.sack_ranges, sack_ranges);
    }

    #[test]
    fn test_window_scale_clamped() {
        let repr = Repr { window_scale: Some(15), ..syn_repr() };
        let mut bytes = vec![0; repr.buffer_len()];
        repr.emit(tcp::new_unchecked_mut(&mut bytes), SRC_ADDR, DST_ADDR);
        let parsed = Repr::parse(tcp::new_checked(&bytes).unwrap()).unwrap();
        assert_eq!(parsed.window_scale, Some(14));
    }

    #[test]
    fn test_seq_number_wraparound() {
        let a = SeqNumber(i32::MAX);
        let b = a + 10;
        assert!(a < b);
        assert_eq!(b - a, 10);
    }

    #[test]
    fn test_truncated() {
        assert_eq!(tcp::new_checked(&SYN_PACKET_BYTES[..19]).err(), Some(Error::Truncated));
    }
}
