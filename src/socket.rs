//! User-facing socket handles and their demultiplexing tables.
//!
//! A socket is distinct from a TCP connection: the socket carries addressing, a queue of
//! already-delivered payload and, for listeners, the accept backlog. Connections live in the
//! interface's flow table and are matched to sockets by their local/remote tuple. The tables
//! here never touch the wire; the interface moves data in and out.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use crate::layer::{Error, Result};
use crate::wire::Ipv4Address;

/// An opaque reference to a socket in a [`SocketSet`].
///
/// [`SocketSet`]: struct.SocketSet.html
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Handle(usize);

/// The local/remote tuple identifying one TCP flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FlowId {
    pub local: (Ipv4Address, u16),
    pub remote: (Ipv4Address, u16),
}

/// Accept backlog of a listening socket.
#[derive(Debug)]
pub struct Listener {
    pub backlog: usize,
    /// Handshakes still in flight, counted against the backlog.
    pub syn_received: Vec<FlowId>,
    /// Fully established flows waiting for `accept`.
    pub ready: VecDeque<FlowId>,
}

impl Listener {
    /// Whether another SYN may claim a backlog slot. Overflowing SYNs are silently dropped.
    pub fn has_room(&self) -> bool {
        self.syn_received.len() + self.ready.len() < self.backlog
    }
}

/// A stream socket. Unconnected until `connect` or `accept` fills in the flow.
#[derive(Debug)]
pub struct TcpSocket {
    pub local: Option<(Ipv4Address, u16)>,
    pub reuse: bool,
    pub listener: Option<Listener>,
    pub flow: Option<FlowId>,
    /// In-order payload delivered by the connection, not yet read.
    pub recv_queue: VecDeque<u8>,
}

/// A datagram socket.
#[derive(Debug)]
pub struct UdpSocket {
    pub local: Option<(Ipv4Address, u16)>,
    pub reuse: bool,
    /// Whole datagrams with their origin.
    pub recv_queue: VecDeque<(Ipv4Address, u16, Vec<u8>)>,
}

#[derive(Debug)]
pub enum Socket {
    Tcp(TcpSocket),
    Udp(UdpSocket),
}

impl Socket {
    fn local(&self) -> Option<(Ipv4Address, u16)> {
        match self {
            Socket::Tcp(tcp) => tcp.local,
            Socket::Udp(udp) => udp.local,
        }
    }

    fn reuse(&self) -> bool {
        match self {
            Socket::Tcp(tcp) => tcp.reuse,
            Socket::Udp(udp) => udp.reuse,
        }
    }

    fn is_tcp(&self) -> bool {
        matches!(self, Socket::Tcp(_))
    }
}

/// All sockets of one interface, plus the raw UDP inboxes.
///
/// Inboxes are the lightweight alternative to a full UDP socket: a per-port datagram queue for
/// protocols such as DNS or DHCP that want raw bytes and no socket semantics.
#[derive(Debug, Default)]
pub struct SocketSet {
    sockets: BTreeMap<usize, Socket>,
    inboxes: BTreeMap<u16, VecDeque<(Ipv4Address, u16, Vec<u8>)>>,
    next_handle: usize,
    next_port: u16,
}

impl SocketSet {
    const EPHEMERAL_FIRST: u16 = 49152;
    const EPHEMERAL_LAST: u16 = 65535;

    pub fn new() -> SocketSet {
        SocketSet {
            sockets: BTreeMap::new(),
            inboxes: BTreeMap::new(),
            next_handle: 0,
            next_port: Self::EPHEMERAL_FIRST,
        }
    }

    pub fn create_tcp(&mut self) -> Handle {
        self.insert(Socket::Tcp(TcpSocket {
            local: None,
            reuse: false,
            listener: None,
            flow: None,
            recv_queue: VecDeque::new(),
        }))
    }

    pub fn create_udp(&mut self) -> Handle {
        self.insert(Socket::Udp(UdpSocket {
            local: None,
            reuse: false,
            recv_queue: VecDeque::new(),
        }))
    }

    fn insert(&mut self, socket: Socket) -> Handle {
        let handle = Handle(self.next_handle);
        self.next_handle += 1;
        self.sockets.insert(handle.0, socket);
        handle
    }

    pub fn get(&self, handle: Handle) -> Option<&Socket> {
        self.sockets.get(&handle.0)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut Socket> {
        self.sockets.get_mut(&handle.0)
    }

    pub fn tcp(&self, handle: Handle) -> Result<&TcpSocket> {
        match self.sockets.get(&handle.0) {
            Some(Socket::Tcp(tcp)) => Ok(tcp),
            _ => Err(Error::Illegal),
        }
    }

    pub fn tcp_mut(&mut self, handle: Handle) -> Result<&mut TcpSocket> {
        match self.sockets.get_mut(&handle.0) {
            Some(Socket::Tcp(tcp)) => Ok(tcp),
            _ => Err(Error::Illegal),
        }
    }

    pub fn udp_mut(&mut self, handle: Handle) -> Result<&mut UdpSocket> {
        match self.sockets.get_mut(&handle.0) {
            Some(Socket::Udp(udp)) => Ok(udp),
            _ => Err(Error::Illegal),
        }
    }

    pub fn remove(&mut self, handle: Handle) -> Option<Socket> {
        self.sockets.remove(&handle.0)
    }

    /// Claim a local port for a socket.
    ///
    /// A port already claimed by another socket of the same protocol is rejected unless both
    /// sides opted into reuse.
    pub fn bind(
        &mut self,
        handle: Handle,
        addr: Ipv4Address,
        port: u16,
        reuse: bool,
    ) -> Result<()> {
        let want_tcp = match self.sockets.get(&handle.0) {
            Some(socket) => socket.is_tcp(),
            None => return Err(Error::Illegal),
        };
        let taken = self.sockets.iter().any(|(&id, socket)| {
            id != handle.0
                && socket.is_tcp() == want_tcp
                && socket.local().map(|(_, p)| p) == Some(port)
                && !(reuse && socket.reuse())
        });
        if taken {
            return Err(Error::Illegal);
        }
        match self.sockets.get_mut(&handle.0) {
            Some(Socket::Tcp(tcp)) => {
                tcp.local = Some((addr, port));
                tcp.reuse = reuse;
            }
            Some(Socket::Udp(udp)) => {
                udp.local = Some((addr, port));
                udp.reuse = reuse;
            }
            None => return Err(Error::Illegal),
        }
        Ok(())
    }

    /// Turn a bound stream socket into the accept target for its port.
    pub fn listen(&mut self, handle: Handle, backlog: usize) -> Result<()> {
        let tcp = self.tcp_mut(handle)?;
        if tcp.local.is_none() || tcp.flow.is_some() {
            return Err(Error::Illegal);
        }
        tcp.listener = Some(Listener {
            backlog: backlog.max(1),
            syn_received: Vec::new(),
            ready: VecDeque::new(),
        });
        Ok(())
    }

    /// The listener claiming `port`, if any.
    pub fn listener_on(&self, port: u16) -> Option<Handle> {
        self.sockets
            .iter()
            .find(|(_, socket)| match socket {
                Socket::Tcp(tcp) => {
                    tcp.listener.is_some() && tcp.local.map(|(_, p)| p) == Some(port)
                }
                _ => false,
            })
            .map(|(&id, _)| Handle(id))
    }

    /// The connected stream socket owning `flow`, if any.
    pub fn stream_for(&self, flow: FlowId) -> Option<Handle> {
        self.sockets
            .iter()
            .find(|(_, socket)| match socket {
                Socket::Tcp(tcp) => tcp.flow == Some(flow),
                _ => false,
            })
            .map(|(&id, _)| Handle(id))
    }

    /// The datagram socket bound to `port`, if any.
    pub fn udp_on(&self, port: u16) -> Option<Handle> {
        self.sockets
            .iter()
            .find(|(_, socket)| match socket {
                Socket::Udp(udp) => udp.local.map(|(_, p)| p) == Some(port),
                _ => false,
            })
            .map(|(&id, _)| Handle(id))
    }

    /// Allocate a local port not claimed by any socket.
    pub fn ephemeral_port(&mut self) -> Result<u16> {
        for _ in Self::EPHEMERAL_FIRST..=Self::EPHEMERAL_LAST {
            let port = self.next_port;
            self.next_port = if port == Self::EPHEMERAL_LAST {
                Self::EPHEMERAL_FIRST
            } else {
                port + 1
            };
            let free = !self
                .sockets
                .values()
                .any(|socket| socket.local().map(|(_, p)| p) == Some(port))
                && !self.inboxes.contains_key(&port);
            if free {
                return Ok(port);
            }
        }
        Err(Error::Exhausted)
    }

    /// Open a raw datagram inbox on `port`.
    pub fn open_inbox(&mut self, port: u16) -> Result<()> {
        if self.inboxes.contains_key(&port) {
            return Err(Error::Illegal);
        }
        self.inboxes.insert(port, VecDeque::new());
        Ok(())
    }

    pub fn close_inbox(&mut self, port: u16) {
        self.inboxes.remove(&port);
    }

    /// Take the oldest datagram from the inbox on `port`.
    pub fn recv_inbox(&mut self, port: u16) -> Option<(Ipv4Address, u16, Vec<u8>)> {
        self.inboxes.get_mut(&port)?.pop_front()
    }

    /// Deliver an inbound datagram to its inbox, if one is open.
    pub fn deliver_inbox(&mut self, port: u16, from: (Ipv4Address, u16), payload: &[u8]) -> bool {
        match self.inboxes.get_mut(&port) {
            Some(queue) => {
                queue.push_back((from.0, from.1, payload.to_vec()));
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: Ipv4Address = Ipv4Address([10, 0, 0, 1]);

    #[test]
    fn bind_rejects_duplicate_port() {
        let mut set = SocketSet::new();
        let first = set.create_tcp();
        let second = set.create_tcp();
        set.bind(first, ADDR, 80, false).unwrap();
        assert_eq!(set.bind(second, ADDR, 80, false), Err(Error::Illegal));
    }

    #[test]
    fn bind_reuse_requires_both_sides() {
        let mut set = SocketSet::new();
        let first = set.create_tcp();
        let second = set.create_tcp();
        let third = set.create_tcp();
        set.bind(first, ADDR, 53, true).unwrap();
        set.bind(second, ADDR, 53, true).unwrap();
        assert_eq!(set.bind(third, ADDR, 53, false), Err(Error::Illegal));
    }

    #[test]
    fn udp_and_tcp_ports_are_separate() {
        let mut set = SocketSet::new();
        let tcp = set.create_tcp();
        let udp = set.create_udp();
        set.bind(tcp, ADDR, 53, false).unwrap();
        set.bind(udp, ADDR, 53, false).unwrap();
    }

    #[test]
    fn listener_found_by_port() {
        let mut set = SocketSet::new();
        let socket = set.create_tcp();
        set.bind(socket, ADDR, 80, false).unwrap();
        set.listen(socket, 4).unwrap();
        assert_eq!(set.listener_on(80), Some(socket));
        assert_eq!(set.listener_on(81), None);
    }

    #[test]
    fn listen_requires_bound_socket() {
        let mut set = SocketSet::new();
        let socket = set.create_tcp();
        assert_eq!(set.listen(socket, 4), Err(Error::Illegal));
    }

    #[test]
    fn ephemeral_ports_skip_bound_ones() {
        let mut set = SocketSet::new();
        let socket = set.create_udp();
        set.bind(socket, ADDR, 49152, false).unwrap();
        let port = set.ephemeral_port().unwrap();
        assert_ne!(port, 49152);
    }

    #[test]
    fn inbox_receives_and_closes() {
        let mut set = SocketSet::new();
        set.open_inbox(67).unwrap();
        assert_eq!(set.open_inbox(67), Err(Error::Illegal));
        assert!(set.deliver_inbox(67, (ADDR, 68), b"offer"));
        let (from, port, payload) = set.recv_inbox(67).unwrap();
        assert_eq!((from, port), (ADDR, 68));
        assert_eq!(&payload[..], b"offer");
        set.close_inbox(67);
        assert!(!set.deliver_inbox(67, (ADDR, 68), b"late"));
    }
}
