//! Encapsulates a network interface card.
//!
//! Also permits software emulation of one, of course. The interface drives a [`Device`] purely
//! by polling: each tick it drains received frames through [`poll`] and pushes outgoing frames
//! through [`transmit`]. No callbacks, no interrupts.
//!
//! [`Device`]: trait.Device.html
//! [`poll`]: trait.Device.html#tymethod.poll
//! [`transmit`]: trait.Device.html#tymethod.transmit

pub mod loopback;

use alloc::vec::Vec;
use core::fmt;

pub use self::loopback::Loopback;

/// Errors a device can report on transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The transmit queue is full; retry on a later tick.
    Exhausted,
    /// The frame does not fit the device's maximum transmission unit.
    TooLong,
}

pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Exhausted => write!(f, "transmit queue exhausted"),
            Error::TooLong => write!(f, "frame exceeds device mtu"),
        }
    }
}

/// A network device moving whole Ethernet frames.
///
/// Frames handed to `transmit` are complete, addresses and all. Implementations own their queue
/// discipline; a full queue is reported as [`Error::Exhausted`] and the caller retries later.
///
/// [`Error::Exhausted`]: enum.Error.html#variant.Exhausted
pub trait Device {
    /// The IP-layer maximum transmission unit, in bytes.
    ///
    /// Link headers come on top; a frame may exceed this by the Ethernet and 802.1Q overhead.
    fn mtu(&self) -> usize;

    /// Queue one frame for transmission.
    fn transmit(&mut self, frame: &[u8]) -> Result<()>;

    /// Take the next received frame, if one is pending.
    fn poll(&mut self) -> Option<Vec<u8>>;
}
