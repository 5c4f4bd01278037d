use alloc::vec::Vec;

use crate::wire::{Ipv4Address, Ipv4Cidr};

/// A route entry.
///
/// A route without a gateway is on-link: the destination itself is the next hop. A default route
/// is simply an entry for `0.0.0.0/0` with a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub net: Ipv4Cidr,
    pub gateway: Option<Ipv4Address>,
    pub metric: u32,
}

/// A routing table with longest-prefix-match lookup.
#[derive(Debug, Default)]
pub struct Routes {
    routes: Vec<Route>,
}

impl Routes {
    pub fn new() -> Routes {
        Routes::default()
    }

    /// Add a route.
    pub fn add(&mut self, route: Route) {
        self.routes.push(route);
    }

    /// Remove all routes covering exactly `net`.
    pub fn remove(&mut self, net: Ipv4Cidr) {
        self.routes.retain(|route| route.net != net);
    }

    /// Find the next hop for `dst`.
    ///
    /// Of all entries whose network contains `dst`, the longest prefix wins; among equal prefixes
    /// the lowest metric wins.
    pub fn lookup(&self, dst: Ipv4Address) -> Option<Ipv4Address> {
        self.routes.iter()
            .filter(|route| route.net.contains(dst))
            .max_by_key(|route| (route.net.prefix(), core::cmp::Reverse(route.metric)))
            .map(|route| route.gateway.unwrap_or(dst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GW_LAN: Ipv4Address = Ipv4Address([10, 0, 2, 1]);
    const GW_DEFAULT: Ipv4Address = Ipv4Address([10, 0, 2, 2]);

    fn table() -> Routes {
        let mut routes = Routes::new();
        routes.add(Route {
            net: Ipv4Cidr::new(Ipv4Address([10, 0, 2, 0]), 24),
            gateway: None,
            metric: 0,
        });
        routes.add(Route {
            net: Ipv4Cidr::new(Ipv4Address([0, 0, 0, 0]), 0),
            gateway: Some(GW_DEFAULT),
            metric: 10,
        });
        routes
    }

    #[test]
    fn on_link_wins_over_default() {
        let routes = table();
        let dst = Ipv4Address([10, 0, 2, 15]);
        assert_eq!(routes.lookup(dst), Some(dst));
    }

    #[test]
    fn default_route_fallback() {
        let routes = table();
        assert_eq!(routes.lookup(Ipv4Address([8, 8, 8, 8])), Some(GW_DEFAULT));
    }

    #[test]
    fn metric_breaks_prefix_ties() {
        let mut routes = table();
        let net = Ipv4Cidr::new(Ipv4Address([192, 168, 0, 0]), 16);
        routes.add(Route { net, gateway: Some(Ipv4Address([10, 0, 2, 3])), metric: 20 });
        routes.add(Route { net, gateway: Some(GW_LAN), metric: 5 });
        assert_eq!(routes.lookup(Ipv4Address([192, 168, 7, 7])), Some(GW_LAN));
    }

    #[test]
    fn no_match_without_default() {
        let mut routes = table();
        routes.remove(Ipv4Cidr::new(Ipv4Address([0, 0, 0, 0]), 0));
        assert_eq!(routes.lookup(Ipv4Address([8, 8, 8, 8])), None);
    }
}
