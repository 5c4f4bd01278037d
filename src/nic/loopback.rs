//! A software device that hands every transmitted frame straight back.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use super::{Device, Error, Result};
use crate::wire::ethernet_frame;

/// A loopback device with a bounded frame queue.
///
/// Everything transmitted becomes receivable in order. Useful for tests and for stitching two
/// interfaces together in a single process.
#[derive(Debug)]
pub struct Loopback {
    queue: VecDeque<Vec<u8>>,
    capacity: usize,
    mtu: usize,
}

impl Loopback {
    /// Queue depth when none is given.
    pub const DEFAULT_CAPACITY: usize = 64;

    pub fn new(mtu: usize) -> Loopback {
        Loopback::with_capacity(mtu, Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(mtu: usize, capacity: usize) -> Loopback {
        Loopback {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            mtu,
        }
    }

    /// Number of frames waiting to be polled.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl Device for Loopback {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn transmit(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() > self.mtu + ethernet_frame::header_len() {
            return Err(Error::TooLong);
        }
        if self.queue.len() >= self.capacity {
            return Err(Error::Exhausted);
        }
        self.queue.push_back(frame.to_vec());
        Ok(())
    }

    fn poll(&mut self) -> Option<Vec<u8>> {
        self.queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_come_back_in_order() {
        let mut device = Loopback::new(1500);
        device.transmit(&[1; 60]).unwrap();
        device.transmit(&[2; 60]).unwrap();
        assert_eq!(device.pending(), 2);
        assert_eq!(device.poll().unwrap()[0], 1);
        assert_eq!(device.poll().unwrap()[0], 2);
        assert_eq!(device.poll(), None);
    }

    #[test]
    fn queue_depth_is_bounded() {
        let mut device = Loopback::with_capacity(1500, 1);
        device.transmit(&[0; 60]).unwrap();
        assert_eq!(device.transmit(&[0; 60]), Err(Error::Exhausted));
        device.poll().unwrap();
        device.transmit(&[0; 60]).unwrap();
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut device = Loopback::new(1500);
        assert_eq!(device.transmit(&[0; 2000]), Err(Error::TooLong));
    }
}
