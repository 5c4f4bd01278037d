//! Address resolution for IPv4 over Ethernet.
//!
//! The cache translates protocol addresses into hardware addresses and holds datagrams that are
//! waiting for a translation to arrive. Incoming ARP packets both answer our own requests and
//! refresh mappings we already hold, so an actively communicating neighbor never expires.

use alloc::collections::BTreeMap;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::time::{Duration, Expiration, Instant};
use crate::wire::{ArpOperation, ArpRepr, EthernetAddress, Ipv4Address};

/// A cached neighbor mapping.
///
/// Contains the timestamp past which the mapping should be discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Neighbor {
    hardware_addr: EthernetAddress,
    expires_at: Expiration,
}

/// An answer to a neighbor cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    /// The neighbor address is in the cache and not expired.
    Found(EthernetAddress),
    /// The neighbor address is not in the cache, or has expired.
    NotFound,
    /// The neighbor address is not in the cache, or has expired, and a discovery request has been
    /// sent recently so another one should not yet go out.
    RateLimited,
}

/// A datagram held back until its destination resolves.
#[derive(Debug)]
struct Pending {
    payloads: VecDeque<Vec<u8>>,
    last_request: Instant,
    expires_at: Instant,
}

/// A neighbor cache with queues for datagrams awaiting resolution.
#[derive(Debug, Default)]
pub struct Cache {
    entries: BTreeMap<Ipv4Address, Neighbor>,
    pending: BTreeMap<Ipv4Address, Pending>,
}

impl Cache {
    /// Minimum delay between discovery requests for the same address, in ticks.
    pub(crate) const SILENT_TIME: Duration = Duration { ticks: 10 };

    /// Neighbor entry lifetime, in ticks.
    pub(crate) const ENTRY_LIFETIME: Duration = Duration { ticks: 600 };

    /// How long queued datagrams wait for a resolution before being dropped, in ticks.
    pub(crate) const PENDING_LIFETIME: Duration = Duration { ticks: 50 };

    /// The most datagrams queued for a single unresolved address.
    pub(crate) const PENDING_DEPTH: usize = 4;

    pub fn new() -> Cache {
        Cache::default()
    }

    /// Add a mapping that never expires.
    ///
    /// Used for the interface's own address and for loopback.
    pub fn fill_permanent(&mut self, protocol_addr: Ipv4Address, hardware_addr: EthernetAddress) {
        self.entries.insert(protocol_addr, Neighbor {
            hardware_addr,
            expires_at: Expiration::Never,
        });
    }

    /// Add or refresh a mapping learned from the network.
    ///
    /// Returns the datagrams that were waiting for this resolution, in arrival order.
    pub fn fill(
        &mut self,
        protocol_addr: Ipv4Address,
        hardware_addr: EthernetAddress,
        now: Instant,
    ) -> VecDeque<Vec<u8>> {
        // Permanent entries are never overwritten by network traffic.
        if let Some(Neighbor { expires_at: Expiration::Never, .. }) =
            self.entries.get(&protocol_addr)
        {
            return VecDeque::new();
        }
        net_trace!("filled {} (was {:?})", protocol_addr, self.entries.get(&protocol_addr));
        self.entries.insert(protocol_addr, Neighbor {
            hardware_addr,
            expires_at: Expiration::When(now + Self::ENTRY_LIFETIME),
        });
        self.pending.remove(&protocol_addr)
            .map(|pending| pending.payloads)
            .unwrap_or_default()
    }

    /// Look up a mapping without side effects.
    pub fn lookup_pure(&self, protocol_addr: Ipv4Address, now: Instant) -> Option<EthernetAddress> {
        if protocol_addr.is_broadcast() {
            return Some(EthernetAddress::BROADCAST);
        }
        match self.entries.get(&protocol_addr) {
            Some(neighbor) if !neighbor.expires_at.is_due(now) => Some(neighbor.hardware_addr),
            _ => None,
        }
    }

    /// Look up a mapping, tracking whether a discovery request should be sent.
    ///
    /// When the address is unresolved, `Answer::NotFound` grants permission to send one request;
    /// repeated lookups within [`SILENT_TIME`] answer `RateLimited` instead.
    ///
    /// [`SILENT_TIME`]: #associatedconstant.SILENT_TIME
    pub fn lookup(&mut self, protocol_addr: Ipv4Address, now: Instant) -> Answer {
        if let Some(hardware_addr) = self.lookup_pure(protocol_addr, now) {
            return Answer::Found(hardware_addr);
        }
        match self.pending.get_mut(&protocol_addr) {
            Some(pending) if now < pending.last_request + Self::SILENT_TIME => {
                Answer::RateLimited
            }
            Some(pending) => {
                pending.last_request = now;
                Answer::NotFound
            }
            None => {
                self.pending.insert(protocol_addr, Pending {
                    payloads: VecDeque::new(),
                    last_request: now,
                    expires_at: now + Self::PENDING_LIFETIME,
                });
                Answer::NotFound
            }
        }
    }

    /// Hold back a datagram until `protocol_addr` resolves.
    ///
    /// At most [`PENDING_DEPTH`] datagrams are held per address; beyond that the oldest queued
    /// datagram is dropped.
    ///
    /// [`PENDING_DEPTH`]: #associatedconstant.PENDING_DEPTH
    pub fn defer(&mut self, protocol_addr: Ipv4Address, payload: Vec<u8>, now: Instant) {
        let pending = self.pending.entry(protocol_addr).or_insert_with(|| Pending {
            payloads: VecDeque::new(),
            // Backdated so that the first lookup is free to send a request.
            last_request: now - Self::SILENT_TIME,
            expires_at: now + Self::PENDING_LIFETIME,
        });
        if pending.payloads.len() >= Self::PENDING_DEPTH {
            net_debug!("pending queue for {} full, dropping oldest datagram", protocol_addr);
            pending.payloads.pop_front();
        }
        pending.payloads.push_back(payload);
    }

    /// Drop expired cache entries and stale pending queues.
    pub fn expire(&mut self, now: Instant) {
        self.entries.retain(|protocol_addr, neighbor| {
            let keep = !neighbor.expires_at.is_due(now);
            if !keep {
                net_trace!("expired neighbor {}", protocol_addr);
            }
            keep
        });
        self.pending.retain(|protocol_addr, pending| {
            let keep = now < pending.expires_at;
            if !keep && !pending.payloads.is_empty() {
                net_debug!("resolution of {} timed out, dropping {} datagrams",
                           protocol_addr, pending.payloads.len());
            }
            keep
        });
    }
}

/// Handle an incoming ARP packet on behalf of one interface address.
///
/// Any valid request refreshes the sender mapping, gratuitous announcements included; replies
/// are only trusted when addressed to us. Returns the reply to send, if any, together with the
/// datagrams unblocked by the new mapping.
pub fn process(
    cache: &mut Cache,
    own_hardware_addr: EthernetAddress,
    own_protocol_addr: Ipv4Address,
    repr: &ArpRepr,
    now: Instant,
) -> (Option<ArpRepr>, VecDeque<Vec<u8>>) {
    if !repr.source_protocol_addr.is_unicast() || !repr.source_hardware_addr.is_unicast() {
        return (None, VecDeque::new());
    }
    let addressed_to_us = repr.target_protocol_addr == own_protocol_addr;
    if repr.operation != ArpOperation::Request && !addressed_to_us {
        return (None, VecDeque::new());
    }

    let unblocked = cache.fill(repr.source_protocol_addr, repr.source_hardware_addr, now);

    let reply = match repr.operation {
        ArpOperation::Request if addressed_to_us => Some(ArpRepr {
            operation: ArpOperation::Reply,
            source_hardware_addr: own_hardware_addr,
            source_protocol_addr: own_protocol_addr,
            target_hardware_addr: repr.source_hardware_addr,
            target_protocol_addr: repr.source_protocol_addr,
        }),
        _ => None,
    };

    (reply, unblocked)
}

/// Build a discovery request for `target_protocol_addr`.
pub fn request(
    own_hardware_addr: EthernetAddress,
    own_protocol_addr: Ipv4Address,
    target_protocol_addr: Ipv4Address,
) -> ArpRepr {
    ArpRepr {
        operation: ArpOperation::Request,
        source_hardware_addr: own_hardware_addr,
        source_protocol_addr: own_protocol_addr,
        target_hardware_addr: EthernetAddress([0; 6]),
        target_protocol_addr,
    }
}
