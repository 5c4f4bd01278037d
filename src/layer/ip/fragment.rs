use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::time::{Duration, Instant};
use crate::wire::{IpProtocol, Ipv4Address, Ipv4Repr};

/// The fixed IPv4 header length used for egress fragments.
const HEADER_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    src: Ipv4Address,
    ident: u16,
    protocol: IpProtocol,
}

#[derive(Debug)]
struct Entry {
    /// Received payloads by byte offset.
    fragments: BTreeMap<u16, Vec<u8>>,
    /// Known once the fragment without more-fragments arrives.
    total_len: Option<usize>,
    expires_at: Instant,
}

impl Entry {
    /// Whether the received ranges cover `[0, total)`.
    fn is_complete(&self) -> Option<usize> {
        let total = self.total_len?;
        let mut covered = 0usize;
        for (&offset, payload) in &self.fragments {
            if usize::from(offset) > covered {
                return None;
            }
            covered = covered.max(usize::from(offset) + payload.len());
        }
        if covered >= total {
            Some(total)
        } else {
            None
        }
    }

    fn assemble(&self, total: usize) -> Vec<u8> {
        let mut datagram = alloc::vec![0; total];
        for (&offset, payload) in &self.fragments {
            let start = usize::from(offset).min(total);
            let end = (start + payload.len()).min(total);
            datagram[start..end].copy_from_slice(&payload[..end - start]);
        }
        datagram
    }
}

/// Reassembly buffers for fragmented datagrams, keyed by (source, identification, protocol).
///
/// An entry lives until it completes or its timer runs out; there is no partial delivery.
#[derive(Debug, Default)]
pub struct Reassembly {
    entries: BTreeMap<Key, Entry>,
}

impl Reassembly {
    /// How long a partially reassembled datagram is kept, in ticks.
    pub(crate) const ENTRY_LIFETIME: Duration = Duration { ticks: 300 };

    pub fn new() -> Reassembly {
        Reassembly::default()
    }

    /// Feed one datagram, returning the full payload once available.
    ///
    /// Unfragmented datagrams pass through untouched. Fragments are buffered at their byte offset
    /// and the whole payload comes back with the fragment that completes coverage of
    /// `[0, total)`.
    pub fn process(&mut self, repr: &Ipv4Repr, payload: &[u8], now: Instant) -> Option<Vec<u8>> {
        if !repr.is_fragment() {
            return Some(payload.to_vec());
        }

        let key = Key {
            src: repr.src_addr,
            ident: repr.ident,
            protocol: repr.protocol,
        };
        let entry = self.entries.entry(key).or_insert_with(|| Entry {
            fragments: BTreeMap::new(),
            total_len: None,
            expires_at: now + Self::ENTRY_LIFETIME,
        });

        if !repr.more_frags {
            entry.total_len = Some(usize::from(repr.frag_offset) + payload.len());
        }
        entry.fragments.insert(repr.frag_offset, payload.to_vec());

        if let Some(total) = entry.is_complete() {
            net_trace!("reassembled {} bytes from {} (ident {})",
                       total, repr.src_addr, repr.ident);
            let datagram = entry.assemble(total);
            self.entries.remove(&key);
            Some(datagram)
        } else {
            None
        }
    }

    /// Drop entries whose reassembly timed out.
    pub fn expire(&mut self, now: Instant) {
        self.entries.retain(|key, entry| {
            let keep = now < entry.expires_at;
            if !keep {
                net_debug!("reassembly of ident {} from {} timed out", key.ident, key.src);
            }
            keep
        });
    }
}

/// One egress fragment of an oversize datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment<'a> {
    pub offset: u16,
    pub more_frags: bool,
    pub payload: &'a [u8],
}

/// Split `payload` into fragments that fit `mtu`, on eight-octet boundaries.
///
/// A payload that fits yields a single unfragmented chunk.
pub fn fragments(payload: &[u8], mtu: usize) -> impl Iterator<Item = Fragment<'_>> {
    // All fragments but the last must carry a multiple of eight octets.
    let chunk = (mtu - HEADER_LEN) & !7;
    let total = payload.len();
    let mut offset = 0usize;
    let mut done = false;
    core::iter::from_fn(move || {
        if done {
            return None;
        }
        let end = (offset + chunk).min(total);
        let fragment = Fragment {
            offset: offset as u16,
            more_frags: end < total,
            payload: &payload[offset..end],
        };
        offset = end;
        done = offset >= total;
        Some(fragment)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Ipv4Address = Ipv4Address([10, 0, 2, 2]);
    const DST: Ipv4Address = Ipv4Address([10, 0, 2, 15]);

    fn repr(ident: u16, offset: u16, more: bool, len: usize) -> Ipv4Repr {
        Ipv4Repr {
            src_addr: SRC,
            dst_addr: DST,
            protocol: IpProtocol::Udp,
            payload_len: len,
            hop_limit: 64,
            ident,
            dont_frag: false,
            more_frags: more,
            frag_offset: offset,
        }
    }

    #[test]
    fn pass_through_unfragmented() {
        let mut reassembly = Reassembly::new();
        let now = Instant::from_ticks(0);
        let payload = [1u8, 2, 3, 4];
        let out = reassembly.process(&repr(7, 0, false, 4), &payload, now);
        assert_eq!(out.as_deref(), Some(&payload[..]));
    }

    #[test]
    fn out_of_order_reassembly() {
        let mut reassembly = Reassembly::new();
        let now = Instant::from_ticks(0);
        // A 2500-byte datagram split at a 1500-byte MTU: 1480 + 1020.
        let original: Vec<u8> = (0..2500u32).map(|i| i as u8).collect();
        let (first, second) = original.split_at(1480);

        // Tail arrives first.
        let out = reassembly.process(&repr(42, 1480, false, second.len()), second, now);
        assert_eq!(out, None);
        let out = reassembly.process(&repr(42, 0, true, first.len()), first, now);
        let datagram = out.unwrap();
        assert_eq!(datagram.len(), 2500);
        assert_eq!(datagram, original);
    }

    #[test]
    fn incomplete_stays_buffered() {
        let mut reassembly = Reassembly::new();
        let now = Instant::from_ticks(0);
        let out = reassembly.process(&repr(3, 0, true, 8), &[0; 8], now);
        assert_eq!(out, None);
        // Final fragment leaves a gap at 8..16.
        let out = reassembly.process(&repr(3, 16, false, 8), &[1; 8], now);
        assert_eq!(out, None);
    }

    #[test]
    fn timed_out_entries_dropped() {
        let mut reassembly = Reassembly::new();
        let now = Instant::from_ticks(0);
        reassembly.process(&repr(9, 0, true, 8), &[0; 8], now);
        reassembly.expire(now + Reassembly::ENTRY_LIFETIME);
        assert!(reassembly.entries.is_empty());
    }

    #[test]
    fn egress_fragmentation() {
        let payload = alloc::vec![0xab; 2500];
        let chunks: Vec<_> = fragments(&payload, 1500).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].offset, 0);
        assert_eq!(chunks[0].more_frags, true);
        assert_eq!(chunks[0].payload.len(), 1480);
        assert_eq!(chunks[1].offset, 1480);
        assert_eq!(chunks[1].more_frags, false);
        assert_eq!(chunks[1].payload.len(), 1020);
    }

    #[test]
    fn egress_single_chunk() {
        let payload = [0u8; 100];
        let chunks: Vec<_> = fragments(&payload, 1500).collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].more_frags, false);
    }
}
