use core::fmt;

/// The error type for packet parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// An incoming packet was shorter than its headers claim.
    ///
    /// Either the buffer is below the fixed minimum length of the protocol, or a variable-length
    /// field points past the end of the received data.
    Truncated,

    /// An incoming packet had an incorrect checksum.
    ///
    /// Only raised by the layers that verify on parse (IPv4 header, ICMP).
    WrongChecksum,

    /// An incoming packet was recognized but self-contradictory.
    ///
    /// Examples: a TCP option with an impossible length byte, an IPv4 header length below 20.
    Malformed,

    /// An incoming packet used an identifier this stack does not handle.
    ///
    /// E.g. an ARP packet for a hardware type other than Ethernet. Usually not fatal; the packet
    /// is simply dropped and counted.
    Unrecognized,
}

/// The result type for packet parsing.
pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Truncated => write!(f, "truncated packet"),
            Error::WrongChecksum => write!(f, "checksum error"),
            Error::Malformed => write!(f, "malformed packet"),
            Error::Unrecognized => write!(f, "unrecognized packet"),
        }
    }
}
