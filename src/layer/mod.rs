//! The process logic of protocol layers.
//!
//! Each protocol layer is split into two parts; the packet logic contained in [`wire`] and the
//! processing part in this module. The state kept here is open to modifications as part of a user
//! program while processing does not take place, similar to reconfiguration on the OS level with
//! utilities such as `arp`, `ifconfig`, etc.
//!
//! [`wire`]: ../wire/index.html

use core::fmt;

use crate::wire;

pub mod arp;
pub mod ip;
pub mod tcp;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Error {
    /// The operation was not permitted.
    ///
    /// Returned when the endpoint, receiver or sender does not allow or implement an operation in
    /// its current state.
    Illegal,

    /// Not enough space for the requested packet.
    BadSize,

    /// Unable to find a route towards the destination address.
    Unreachable,

    /// The action could not be completed because there were not enough resources.
    ///
    /// In contrast to `Illegal` this implies that the operation would have been legal with more
    /// resources, so waiting and retrying may succeed.
    Exhausted,

    /// An incoming packet could not be interpreted.
    Parse(wire::Error),
}

impl From<wire::Error> for Error {
    fn from(err: wire::Error) -> Error {
        Error::Parse(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Illegal => write!(f, "operation not permitted"),
            Error::BadSize => write!(f, "not enough space"),
            Error::Unreachable => write!(f, "no route to destination"),
            Error::Exhausted => write!(f, "resources exhausted"),
            Error::Parse(err) => write!(f, "unable to parse packet: {}", err),
        }
    }
}
