use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::wire::{IpProtocol, Ipv4Address, Ipv4Cidr};

/// An address translation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    /// Rewrite the source of egress traffic originating in `from` to `to`.
    Snat { from: Ipv4Cidr, to: Ipv4Address },
    /// Rewrite the destination of ingress traffic addressed to `from:port` to `to`.
    Dnat { from: Ipv4Address, port: u16, to: (Ipv4Address, u16) },
}

/// A tracked source translation.
///
/// Keyed by the flow's original endpoints so repeated segments of one flow keep their allocated
/// port. The source port is part of the key on top of the (origSrc, dst, protocol) identity, as
/// two flows from one host to one destination must not share a translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct FlowKey {
    orig_src: Ipv4Address,
    orig_src_port: u16,
    dst: Ipv4Address,
    protocol: IpProtocol,
}

/// Source and destination translation with connection tracking.
#[derive(Debug)]
pub struct Nat {
    rules: Vec<Rule>,
    flows: BTreeMap<FlowKey, u16>,
    by_port: BTreeMap<(u16, IpProtocol), (Ipv4Address, u16)>,
    next_port: u16,
}

impl Default for Nat {
    fn default() -> Nat {
        Nat {
            rules: Vec::new(),
            flows: BTreeMap::new(),
            by_port: BTreeMap::new(),
            next_port: Self::PORT_RANGE.0,
        }
    }
}

impl Nat {
    /// Translated source ports are allocated from this range, cycling.
    const PORT_RANGE: (u16, u16) = (60000, 65000);

    pub fn new() -> Nat {
        Nat::default()
    }

    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Translate an egress flow, if a source rule matches.
    ///
    /// Returns the rewritten source endpoint and records a conntrack entry so the returning
    /// traffic can be restored by [`translate_inbound`].
    ///
    /// [`translate_inbound`]: #method.translate_inbound
    pub fn translate_outbound(
        &mut self,
        src: Ipv4Address,
        src_port: u16,
        dst: Ipv4Address,
        protocol: IpProtocol,
    ) -> Option<(Ipv4Address, u16)> {
        let to = self.rules.iter().find_map(|rule| match rule {
            Rule::Snat { from, to } if from.contains(src) => Some(*to),
            _ => None,
        })?;

        let key = FlowKey { orig_src: src, orig_src_port: src_port, dst, protocol };
        if let Some(&port) = self.flows.get(&key) {
            return Some((to, port));
        }

        let port = self.allocate_port(protocol);
        net_trace!("snat {}:{} -> {}:{} for {}", src, src_port, to, port, dst);
        self.flows.insert(key, port);
        self.by_port.insert((port, protocol), (src, src_port));
        Some((to, port))
    }

    /// Translate an ingress flow.
    ///
    /// Destination rules are consulted first; failing that, the conntrack table restores the
    /// original source endpoint of a tracked egress flow.
    pub fn translate_inbound(
        &mut self,
        dst: Ipv4Address,
        dst_port: u16,
        protocol: IpProtocol,
    ) -> Option<(Ipv4Address, u16)> {
        let dnat = self.rules.iter().find_map(|rule| match rule {
            Rule::Dnat { from, port, to } if *from == dst && *port == dst_port => Some(*to),
            _ => None,
        });
        if dnat.is_some() {
            return dnat;
        }
        self.by_port.get(&(dst_port, protocol)).copied()
    }

    fn allocate_port(&mut self, protocol: IpProtocol) -> u16 {
        let (lo, hi) = Self::PORT_RANGE;
        loop {
            let candidate = self.next_port;
            self.next_port = if candidate >= hi { lo } else { candidate + 1 };
            if !self.by_port.contains_key(&(candidate, protocol)) {
                return candidate;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAN: Ipv4Address = Ipv4Address([192, 168, 0, 5]);
    const WAN: Ipv4Address = Ipv4Address([10, 0, 2, 15]);
    const REMOTE: Ipv4Address = Ipv4Address([8, 8, 8, 8]);

    fn masquerading() -> Nat {
        let mut nat = Nat::new();
        nat.add_rule(Rule::Snat {
            from: Ipv4Cidr::new(Ipv4Address([192, 168, 0, 0]), 24),
            to: WAN,
        });
        nat
    }

    #[test]
    fn snat_and_reverse() {
        let mut nat = masquerading();
        let (addr, port) = nat.translate_outbound(LAN, 40000, REMOTE, IpProtocol::Tcp).unwrap();
        assert_eq!(addr, WAN);
        // Returning traffic restores the original source.
        assert_eq!(nat.translate_inbound(WAN, port, IpProtocol::Tcp), Some((LAN, 40000)));
    }

    #[test]
    fn flow_keeps_its_port() {
        let mut nat = masquerading();
        let first = nat.translate_outbound(LAN, 40000, REMOTE, IpProtocol::Tcp);
        let second = nat.translate_outbound(LAN, 40000, REMOTE, IpProtocol::Tcp);
        assert_eq!(first, second);
    }

    #[test]
    fn distinct_flows_get_distinct_ports() {
        let mut nat = masquerading();
        let (_, a) = nat.translate_outbound(LAN, 40000, REMOTE, IpProtocol::Tcp).unwrap();
        let (_, b) = nat.translate_outbound(LAN, 40001, REMOTE, IpProtocol::Tcp).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn non_matching_source_untouched() {
        let mut nat = masquerading();
        assert_eq!(nat.translate_outbound(WAN, 40000, REMOTE, IpProtocol::Tcp), None);
    }

    #[test]
    fn dnat_rule() {
        let mut nat = Nat::new();
        nat.add_rule(Rule::Dnat { from: WAN, port: 80, to: (LAN, 8080) });
        assert_eq!(nat.translate_inbound(WAN, 80, IpProtocol::Tcp), Some((LAN, 8080)));
        assert_eq!(nat.translate_inbound(WAN, 81, IpProtocol::Tcp), None);
    }
}
