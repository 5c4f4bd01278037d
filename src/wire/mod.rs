/*! Low-level packet access and construction.

The `wire` module deals with packet *representation*. It provides two levels of functionality.

 * First, it provides functions to extract fields from sequences of octets, and to insert fields
   into sequences of octets. This happens in the lowercase byte-wrapper structures, e.g.
   [`ethernet`] or [`udp_packet`]. These never copy and never allocate.
 * Second, it provides a compact, high-level representation of header data that can be created by
   parsing and emitted into a sequence of octets. This happens through the `Repr` family of
   structs, e.g. [`ArpRepr`] or [`Ipv4Repr`].

[`ethernet`]: struct.ethernet.html
[`udp_packet`]: struct.udp_packet.html
[`ArpRepr`]: enum.ArpRepr.html
[`Ipv4Repr`]: struct.Ipv4Repr.html

The byte-wrapper family guarantees that if `check_len()` returned `Ok(())` then no field accessor
or setter will panic. `Repr::parse()` rejects malformed input with a typed [`Error`] and
`Repr::emit()` never panics as long as the target buffer is at least `buffer_len()` octets long.

Checksums are computed on emission for every buildable unit. On parse, the IPv4 header checksum
and ICMP checksum are verified; TCP and UDP checksums are not re-verified, preserving the
documented behavior of the system this stack reproduces.
*/
// Copyright (C) 2016 whitequark@whitequark.org
// in parts following wire structures originally from `smoltcp`

mod field {
    pub(crate) type Field = ::core::ops::Range<usize>;
    pub(crate) type Rest = ::core::ops::RangeFrom<usize>;
}

pub(crate) mod arp;
mod error;
mod ethernet;
mod icmpv4;
pub(crate) mod ip;
mod ipv4;
mod tcp;
mod udp;

pub use self::error::{Error, Result};

pub use self::ethernet::{
    ethernet as ethernet_frame,
    Address as EthernetAddress,
    EtherType as EthernetProtocol,
    Repr as EthernetRepr,
    VLAN_HEADER_LEN,
};

pub use self::arp::{
    arp as arp_packet,
    Hardware as ArpHardware,
    Operation as ArpOperation,
    Repr as ArpRepr,
};

pub use self::ip::{checksum, Cidr as Ipv4Cidr, Protocol as IpProtocol};

pub use self::ipv4::{
    ipv4 as ipv4_packet,
    Address as Ipv4Address,
    Ipv4Option,
    Repr as Ipv4Repr,
    MIN_MTU as IPV4_MIN_MTU,
};

pub use self::icmpv4::{
    icmpv4 as icmpv4_packet,
    DstUnreachable as Icmpv4DstUnreachable,
    Message as Icmpv4Message,
    Repr as Icmpv4Repr,
    TimeExceeded as Icmpv4TimeExceeded,
};

pub use self::udp::{udp as udp_packet, Repr as UdpRepr};

pub use self::tcp::{
    tcp as tcp_packet,
    Flags as TcpFlags,
    Repr as TcpRepr,
    SeqNumber as TcpSeqNumber,
    TcpOption,
    MAX_SACK_RANGES,
};
