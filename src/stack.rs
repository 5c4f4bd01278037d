//! The interface: one device, one address, and everything running on top.
//!
//! [`Interface`] is the context object callers own. It is single-threaded and cooperative:
//! [`poll`] drains the device's ingress queue synchronously and [`tick`] advances the clock by
//! one tick and fires every timer. Blocking operations such as [`connect`] are poll-drain loops
//! bounded by a tick deadline; nothing ever waits on the OS.
//!
//! [`Interface`]: struct.Interface.html
//! [`poll`]: struct.Interface.html#method.poll
//! [`tick`]: struct.Interface.html#method.tick
//! [`connect`]: struct.Interface.html#method.connect

use alloc::vec;
use alloc::vec::Vec;

use crate::layer::ip::{fragments, Nat, Reassembly, Route, Routes, Rule};
use crate::layer::tcp::{
    rst_reply, Config as TcpConfig, Connection, Segment, State,
};
use crate::layer::{arp, Error, Result};
use crate::nic;
use crate::nic::Device;
use crate::socket::{FlowId, Handle, Socket, SocketSet};
use crate::time::{Duration, Instant};
use crate::wire::{
    arp_packet, ethernet_frame, icmpv4_packet, ipv4_packet, tcp_packet, udp_packet, ArpRepr,
    EthernetAddress, EthernetProtocol, EthernetRepr, Icmpv4DstUnreachable, Icmpv4Repr,
    Icmpv4TimeExceeded, IpProtocol, Ipv4Address, Ipv4Cidr, Ipv4Repr, TcpRepr, TcpSeqNumber,
    UdpRepr,
};

use alloc::collections::BTreeMap;

/// Static configuration of one interface.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub hardware_addr: EthernetAddress,
    /// Own address and on-link prefix.
    pub cidr: Ipv4Cidr,
    pub gateway: Option<Ipv4Address>,
    /// Defaults applied to every new connection.
    pub tcp: TcpConfig,
}

/// Packet counters, maintained across the interface's lifetime.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub rx_frames: u64,
    pub tx_frames: u64,
    /// Frames dropped for truncation, bad checksums or other parse failures.
    pub rx_malformed: u64,
    /// Valid frames with no local consumer.
    pub rx_unhandled: u64,
    /// TCP resets sent, both demultiplexer replies and connection aborts.
    pub tx_rsts: u64,
}

/// A network interface and the stack state attached to it.
pub struct Interface<D> {
    device: D,
    config: Config,
    now: Instant,
    neighbors: arp::Cache,
    routes: Routes,
    reassembly: Reassembly,
    nat: Nat,
    connections: BTreeMap<FlowId, Connection>,
    sockets: SocketSet,
    stats: Stats,
    next_ident: u16,
    next_iss: i32,
}

impl<D: Device> Interface<D> {
    const LOOPBACK: Ipv4Address = Ipv4Address([127, 0, 0, 1]);
    /// TTL of every datagram we originate.
    const HOP_LIMIT: u8 = 64;

    pub fn new(device: D, config: Config) -> Interface<D> {
        let mut neighbors = arp::Cache::new();
        // Our own address and loopback never expire and never need resolution.
        neighbors.fill_permanent(config.cidr.address(), config.hardware_addr);
        neighbors.fill_permanent(Self::LOOPBACK, config.hardware_addr);

        let mut routes = Routes::new();
        routes.add(Route { net: config.cidr, gateway: None, metric: 0 });
        if let Some(gateway) = config.gateway {
            routes.add(Route {
                net: Ipv4Cidr::new(Ipv4Address::UNSPECIFIED, 0),
                gateway: Some(gateway),
                metric: 100,
            });
        }

        Interface {
            device,
            config,
            now: Instant::from_ticks(0),
            neighbors,
            routes,
            reassembly: Reassembly::new(),
            nat: Nat::new(),
            connections: BTreeMap::new(),
            sockets: SocketSet::new(),
            stats: Stats::default(),
            next_ident: 1,
            next_iss: 0x0001_0000,
        }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn address(&self) -> Ipv4Address {
        self.config.cidr.address()
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn routes_mut(&mut self) -> &mut Routes {
        &mut self.routes
    }

    /// Number of live entries in the connection table.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn add_nat_rule(&mut self, rule: Rule) {
        self.nat.add_rule(rule);
    }

    /// Drain every frame the device has received so far.
    pub fn poll(&mut self) {
        while let Some(frame) = self.device.poll() {
            self.receive(&frame);
        }
    }

    /// Ingest one raw frame, as a device driver or test harness would.
    pub fn receive(&mut self, frame: &[u8]) {
        self.stats.rx_frames += 1;
        if let Err(err) = self.ingress(frame) {
            self.stats.rx_malformed += 1;
            net_debug!("dropping frame: {}", err);
        }
    }

    /// Advance the clock by one tick and fire all timers.
    ///
    /// Callers must invoke this at a fixed cadence for the timeout arithmetic to hold.
    pub fn tick(&mut self) {
        self.now += Duration::from_ticks(1);
        self.neighbors.expire(self.now);
        self.reassembly.expire(self.now);

        let mut outgoing = Vec::new();
        let mut closed = Vec::new();
        for (&flow, connection) in self.connections.iter_mut() {
            connection.on_tick(self.now);
            while let Some(segment) = connection.poll_transmit() {
                outgoing.push((flow, segment));
            }
            if connection.is_closed() {
                closed.push(flow);
            }
        }
        for (flow, segment) in outgoing {
            let _ = self.send_segment(flow, segment);
        }
        for flow in closed {
            self.remove_connection(flow);
        }
    }

    fn remove_connection(&mut self, flow: FlowId) {
        self.connections.remove(&flow);
        if let Some(handle) = self.sockets.listener_on(flow.local.1) {
            if let Ok(tcp) = self.sockets.tcp_mut(handle) {
                if let Some(listener) = &mut tcp.listener {
                    listener.syn_received.retain(|&id| id != flow);
                    listener.ready.retain(|&id| id != flow);
                }
            }
        }
    }

    // === Ingress ===

    fn ingress(&mut self, frame: &[u8]) -> Result<()> {
        let frame = ethernet_frame::new_checked(frame)?;
        let eth = EthernetRepr::parse(frame)?;
        if eth.dst_addr != self.config.hardware_addr && eth.dst_addr != EthernetAddress::BROADCAST
        {
            return Ok(());
        }
        match eth.ethertype {
            EthernetProtocol::Arp => self.ingress_arp(frame.payload_slice()),
            EthernetProtocol::Ipv4 => self.ingress_ip(frame.payload_slice()),
            _ => {
                self.stats.rx_unhandled += 1;
                Ok(())
            }
        }
    }

    fn ingress_arp(&mut self, payload: &[u8]) -> Result<()> {
        let packet = arp_packet::new_checked(payload)?;
        let repr = ArpRepr::parse(packet)?;
        let (reply, unblocked) = arp::process(
            &mut self.neighbors,
            self.config.hardware_addr,
            self.config.cidr.address(),
            &repr,
            self.now,
        );
        if let Some(reply) = reply {
            self.send_arp(&reply)?;
        }
        for datagram in unblocked {
            self.transmit_frame(
                repr.source_hardware_addr,
                EthernetProtocol::Ipv4,
                &datagram,
            )?;
        }
        Ok(())
    }

    fn ingress_ip(&mut self, ip_bytes: &[u8]) -> Result<()> {
        let packet = ipv4_packet::new_checked(ip_bytes)?;
        let repr = Ipv4Repr::parse(packet)?;

        let local = repr.dst_addr == self.config.cidr.address()
            || repr.dst_addr.is_broadcast()
            || repr.dst_addr.is_loopback();
        if !local {
            if repr.hop_limit <= 1 {
                let cite = Self::citation(ip_bytes, packet.header_len() as usize);
                let reply = Icmpv4Repr::TimeExceeded {
                    reason: Icmpv4TimeExceeded::TtlExpired,
                    data: cite,
                };
                let buffer = Self::icmp_bytes(&reply);
                return self.send_ip(repr.src_addr, IpProtocol::Icmp, buffer);
            }
            // Not a router; anything else bound elsewhere is dropped.
            self.stats.rx_unhandled += 1;
            return Ok(());
        }

        let payload = match self.reassembly.process(&repr, packet.payload_slice(), self.now) {
            Some(payload) => payload,
            None => return Ok(()),
        };

        match repr.protocol {
            IpProtocol::Icmp => self.ingress_icmp(&repr, &payload),
            IpProtocol::Udp => self.ingress_udp(&repr, ip_bytes, &payload),
            IpProtocol::Tcp => self.ingress_tcp(&repr, &payload),
            _ => {
                self.stats.rx_unhandled += 1;
                Ok(())
            }
        }
    }

    /// The cited prefix of an offending datagram: IP header plus eight payload octets.
    fn citation(ip_bytes: &[u8], header_len: usize) -> &[u8] {
        &ip_bytes[..(header_len + 8).min(ip_bytes.len())]
    }

    fn ingress_icmp(&mut self, ip_repr: &Ipv4Repr, payload: &[u8]) -> Result<()> {
        let packet = icmpv4_packet::new_checked(payload)?;
        match Icmpv4Repr::parse(packet)? {
            Icmpv4Repr::EchoRequest { ident, seq_no, data } => {
                let reply = Icmpv4Repr::EchoReply { ident, seq_no, data };
                let buffer = Self::icmp_bytes(&reply);
                self.send_ip(ip_repr.src_addr, IpProtocol::Icmp, buffer)
            }
            // Replies and errors are counted but not dispatched anywhere yet.
            _ => {
                self.stats.rx_unhandled += 1;
                Ok(())
            }
        }
    }

    fn ingress_udp(&mut self, ip_repr: &Ipv4Repr, ip_bytes: &[u8], payload: &[u8]) -> Result<()> {
        let packet = udp_packet::new_checked(payload)?;
        let repr = UdpRepr::parse(packet)?;
        let mut dst_port = repr.dst_port;
        if !self.nat.is_empty() {
            if let Some((_, port)) =
                self.nat.translate_inbound(ip_repr.dst_addr, dst_port, IpProtocol::Udp)
            {
                dst_port = port;
            }
        }
        let from = (ip_repr.src_addr, repr.src_port);
        let data = packet.payload_slice();

        if let Some(handle) = self.sockets.udp_on(dst_port) {
            if let Ok(socket) = self.sockets.udp_mut(handle) {
                socket.recv_queue.push_back((from.0, from.1, data.to_vec()));
                return Ok(());
            }
        }
        if self.sockets.deliver_inbox(dst_port, from, data) {
            return Ok(());
        }
        if ip_repr.dst_addr.is_broadcast() {
            // Nobody listening on a broadcast is not an error.
            return Ok(());
        }

        let cite = Self::citation(ip_bytes, ipv4_packet::new_unchecked(ip_bytes).header_len() as usize);
        let reply = Icmpv4Repr::DstUnreachable {
            reason: Icmpv4DstUnreachable::PortUnreachable,
            data: cite,
        };
        let buffer = Self::icmp_bytes(&reply);
        self.send_ip(ip_repr.src_addr, IpProtocol::Icmp, buffer)
    }

    fn ingress_tcp(&mut self, ip_repr: &Ipv4Repr, payload: &[u8]) -> Result<()> {
        let packet = tcp_packet::new_checked(payload)?;
        let repr = TcpRepr::parse(packet)?;
        let data = packet.payload_slice();

        let mut local = (ip_repr.dst_addr, repr.dst_port);
        if !self.nat.is_empty() {
            if let Some(translated) =
                self.nat.translate_inbound(local.0, local.1, IpProtocol::Tcp)
            {
                local = translated;
            }
        }
        let flow = FlowId { local, remote: (ip_repr.src_addr, repr.src_port) };

        if let Some(connection) = self.connections.get_mut(&flow) {
            let was_handshaking = connection.state() == State::SynReceived;
            let delivered = connection.process(&repr, data, self.now);
            let established = was_handshaking && connection.state() == State::Established;
            let mut outgoing = Vec::new();
            while let Some(segment) = connection.poll_transmit() {
                outgoing.push(segment);
            }
            let closed = connection.is_closed();

            if let Some(bytes) = delivered {
                match self.sockets.stream_for(flow) {
                    Some(handle) => {
                        if let Ok(socket) = self.sockets.tcp_mut(handle) {
                            socket.recv_queue.extend(bytes);
                        }
                    }
                    // No socket owns the flow yet; the bytes are already acknowledged and
                    // will never be retransmitted, so the connection holds them for accept.
                    None => {
                        if let Some(connection) = self.connections.get_mut(&flow) {
                            connection.stash_received(&bytes);
                        }
                    }
                }
            }
            if established {
                self.promote_to_accept_queue(flow);
            }
            for segment in outgoing {
                self.send_segment(flow, segment)?;
            }
            if closed {
                self.remove_connection(flow);
            }
            return Ok(());
        }

        // No connection. An RST answers nothing; a fresh SYN may match a listener; everything
        // else provokes an RST.
        if repr.flags.rst() {
            return Ok(());
        }
        if repr.flags.syn() && !repr.flags.ack() {
            if let Some(handle) = self.sockets.listener_on(flow.local.1) {
                let has_room = self
                    .sockets
                    .tcp(handle)?
                    .listener
                    .as_ref()
                    .map(|listener| listener.has_room())
                    .unwrap_or(false);
                if !has_room {
                    // Backlog full: drop silently, the client will retry.
                    net_debug!("backlog full on port {}, dropping syn", flow.local.1);
                    return Ok(());
                }
                let iss = self.next_iss();
                let mut connection = Connection::server(
                    flow.local.1,
                    flow.remote.1,
                    &repr,
                    iss,
                    self.config.tcp,
                    self.now,
                );
                let mut outgoing = Vec::new();
                while let Some(segment) = connection.poll_transmit() {
                    outgoing.push(segment);
                }
                self.connections.insert(flow, connection);
                if let Some(listener) = self.sockets.tcp_mut(handle)?.listener.as_mut() {
                    listener.syn_received.push(flow);
                }
                for segment in outgoing {
                    self.send_segment(flow, segment)?;
                }
                return Ok(());
            }
        }
        let rst = rst_reply(&repr);
        self.send_tcp_bytes(flow.local.0, flow.remote.0, &rst, &[])
    }

    fn promote_to_accept_queue(&mut self, flow: FlowId) {
        if let Some(handle) = self.sockets.listener_on(flow.local.1) {
            if let Ok(tcp) = self.sockets.tcp_mut(handle) {
                if let Some(listener) = &mut tcp.listener {
                    listener.syn_received.retain(|&id| id != flow);
                    listener.ready.push_back(flow);
                }
            }
        }
    }

    // === Egress ===

    fn next_iss(&mut self) -> TcpSeqNumber {
        let iss = self.next_iss;
        self.next_iss = self.next_iss.wrapping_add(0x0002_7100);
        TcpSeqNumber(iss)
    }

    fn send_segment(&mut self, flow: FlowId, segment: Segment) -> Result<()> {
        let mut src = flow.local;
        if !self.nat.is_empty() {
            if let Some(translated) =
                self.nat.translate_outbound(src.0, src.1, flow.remote.0, IpProtocol::Tcp)
            {
                src = translated;
            }
        }
        let repr = TcpRepr { src_port: src.1, ..segment.repr };
        self.send_tcp_bytes(src.0, flow.remote.0, &repr, &segment.payload)
    }

    fn send_tcp_bytes(
        &mut self,
        src_addr: Ipv4Address,
        dst_addr: Ipv4Address,
        repr: &TcpRepr,
        payload: &[u8],
    ) -> Result<()> {
        if repr.flags.rst() {
            self.stats.tx_rsts += 1;
        }
        let mut buffer = vec![0; repr.buffer_len()];
        buffer[repr.header_len()..].copy_from_slice(payload);
        let packet = tcp_packet::new_unchecked_mut(&mut buffer);
        repr.emit(packet, src_addr, dst_addr);
        self.send_ip_from(src_addr, dst_addr, IpProtocol::Tcp, buffer)
    }

    fn icmp_bytes(repr: &Icmpv4Repr) -> Vec<u8> {
        let mut buffer = vec![0; repr.buffer_len()];
        repr.emit(icmpv4_packet::new_unchecked_mut(&mut buffer));
        buffer
    }

    /// Send one transport payload in as many IPv4 packets as the device MTU requires.
    fn send_ip(&mut self, dst: Ipv4Address, protocol: IpProtocol, payload: Vec<u8>) -> Result<()> {
        self.send_ip_from(self.config.cidr.address(), dst, protocol, payload)
    }

    fn send_ip_from(
        &mut self,
        src: Ipv4Address,
        dst: Ipv4Address,
        protocol: IpProtocol,
        payload: Vec<u8>,
    ) -> Result<()> {
        let ident = self.next_ident;
        self.next_ident = self.next_ident.wrapping_add(1);

        let mtu = self.device.mtu();
        let mut packets = Vec::new();
        for fragment in fragments(&payload, mtu) {
            let repr = Ipv4Repr {
                src_addr: src,
                dst_addr: dst,
                protocol,
                payload_len: fragment.payload.len(),
                hop_limit: Self::HOP_LIMIT,
                ident,
                dont_frag: false,
                more_frags: fragment.more_frags,
                frag_offset: fragment.offset,
            };
            let mut buffer = vec![0; repr.buffer_len()];
            buffer[repr.header_len()..].copy_from_slice(fragment.payload);
            repr.emit(ipv4_packet::new_unchecked_mut(&mut buffer));
            packets.push(buffer);
        }
        for packet in packets {
            self.dispatch_ip(dst, packet)?;
        }
        Ok(())
    }

    /// Resolve the next hop and hand the packet to the device, deferring on an ARP miss.
    fn dispatch_ip(&mut self, dst: Ipv4Address, packet: Vec<u8>) -> Result<()> {
        let next_hop = if dst.is_broadcast() {
            dst
        } else {
            self.routes.lookup(dst).ok_or(Error::Unreachable)?
        };
        match self.neighbors.lookup(next_hop, self.now) {
            arp::Answer::Found(hw) => {
                self.transmit_frame(hw, EthernetProtocol::Ipv4, &packet)
            }
            arp::Answer::NotFound => {
                self.neighbors.defer(next_hop, packet, self.now);
                let request = arp::request(
                    self.config.hardware_addr,
                    self.config.cidr.address(),
                    next_hop,
                );
                self.send_arp(&request)
            }
            arp::Answer::RateLimited => {
                self.neighbors.defer(next_hop, packet, self.now);
                Ok(())
            }
        }
    }

    fn send_arp(&mut self, repr: &ArpRepr) -> Result<()> {
        let mut buffer = vec![0; repr.buffer_len()];
        repr.emit(arp_packet::new_unchecked_mut(&mut buffer));
        let dst_hw = if repr.target_hardware_addr == EthernetAddress([0; 6]) {
            EthernetAddress::BROADCAST
        } else {
            repr.target_hardware_addr
        };
        self.transmit_frame(dst_hw, EthernetProtocol::Arp, &buffer)
    }

    fn transmit_frame(
        &mut self,
        dst_addr: EthernetAddress,
        ethertype: EthernetProtocol,
        payload: &[u8],
    ) -> Result<()> {
        let mut frame = vec![0; ethernet_frame::buffer_len(payload.len())];
        {
            let frame = ethernet_frame::new_unchecked_mut(&mut frame);
            EthernetRepr {
                src_addr: self.config.hardware_addr,
                dst_addr,
                ethertype,
            }
            .emit(frame);
            frame.payload_mut_slice().copy_from_slice(payload);
        }
        self.device.transmit(&frame).map_err(|err| match err {
            nic::Error::Exhausted => Error::Exhausted,
            nic::Error::TooLong => Error::BadSize,
        })?;
        self.stats.tx_frames += 1;
        Ok(())
    }

    // === Socket API ===

    pub fn tcp_socket(&mut self) -> Handle {
        self.sockets.create_tcp()
    }

    pub fn udp_socket(&mut self) -> Handle {
        self.sockets.create_udp()
    }

    /// Claim a local port. `reuse` permits sharing with other reuse-enabled sockets.
    pub fn bind(&mut self, handle: Handle, port: u16, reuse: bool) -> Result<()> {
        self.sockets.bind(handle, self.config.cidr.address(), port, reuse)
    }

    pub fn listen(&mut self, handle: Handle, backlog: usize) -> Result<()> {
        self.sockets.listen(handle, backlog)
    }

    /// Take one fully established connection off a listener's accept queue.
    pub fn accept(&mut self, handle: Handle) -> Option<Handle> {
        let flow = {
            let tcp = self.sockets.tcp_mut(handle).ok()?;
            tcp.listener.as_mut()?.ready.pop_front()?
        };
        let pending = self
            .connections
            .get_mut(&flow)
            .map(Connection::take_received)
            .unwrap_or_default();
        let stream = self.sockets.create_tcp();
        if let Ok(tcp) = self.sockets.tcp_mut(stream) {
            tcp.local = Some(flow.local);
            tcp.flow = Some(flow);
            tcp.recv_queue.extend(pending);
        }
        Some(stream)
    }

    /// Start a connection attempt and return immediately.
    ///
    /// Progress is made by [`poll`]/[`tick`]; completion is reported by [`connect_poll`].
    ///
    /// [`poll`]: #method.poll
    /// [`tick`]: #method.tick
    /// [`connect_poll`]: #method.connect_poll
    pub fn connect_start(
        &mut self,
        handle: Handle,
        addr: Ipv4Address,
        port: u16,
    ) -> Result<()> {
        let local_port = match self.sockets.tcp(handle)?.local {
            Some((_, port)) => port,
            None => {
                let port = self.sockets.ephemeral_port()?;
                self.bind(handle, port, false)?;
                port
            }
        };
        let flow = FlowId {
            local: (self.config.cidr.address(), local_port),
            remote: (addr, port),
        };
        if self.connections.contains_key(&flow) {
            return Err(Error::Illegal);
        }
        let iss = self.next_iss();
        let mut connection =
            Connection::client(local_port, port, iss, self.config.tcp, self.now);
        let mut outgoing = Vec::new();
        while let Some(segment) = connection.poll_transmit() {
            outgoing.push(segment);
        }
        self.connections.insert(flow, connection);
        self.sockets.tcp_mut(handle)?.flow = Some(flow);
        for segment in outgoing {
            self.send_segment(flow, segment)?;
        }
        Ok(())
    }

    /// Whether a started connection attempt has completed. `Ok(false)` means still pending.
    pub fn connect_poll(&mut self, handle: Handle) -> Result<bool> {
        let flow = self.sockets.tcp(handle)?.flow.ok_or(Error::Illegal)?;
        match self.connections.get(&flow) {
            Some(connection) => Ok(connection.state() == State::Established),
            // The connection died, by RST or otherwise.
            None => Err(Error::Unreachable),
        }
    }

    /// Connect, driving the poll loop until established or `timeout` ticks have passed.
    pub fn connect(
        &mut self,
        handle: Handle,
        addr: Ipv4Address,
        port: u16,
        timeout: u64,
    ) -> Result<()> {
        self.connect_start(handle, addr, port)?;
        for _ in 0..timeout {
            self.poll();
            if self.connect_poll(handle)? {
                return Ok(());
            }
            self.tick();
        }
        Err(Error::Exhausted)
    }

    /// Hand bytes to an established stream.
    pub fn send(&mut self, handle: Handle, data: &[u8]) -> Result<()> {
        let flow = self.sockets.tcp(handle)?.flow.ok_or(Error::Illegal)?;
        let connection = self.connections.get_mut(&flow).ok_or(Error::Illegal)?;
        if !connection.send(data, self.now) {
            return Err(Error::Illegal);
        }
        let mut outgoing = Vec::new();
        while let Some(segment) = connection.poll_transmit() {
            outgoing.push(segment);
        }
        for segment in outgoing {
            self.send_segment(flow, segment)?;
        }
        Ok(())
    }

    /// Take up to `max` already-delivered bytes without waiting.
    pub fn recv(&mut self, handle: Handle, max: usize) -> Result<Vec<u8>> {
        let socket = self.sockets.tcp_mut(handle)?;
        let take = socket.recv_queue.len().min(max);
        Ok(socket.recv_queue.drain(..take).collect())
    }

    /// Take up to `max` bytes, polling until data arrives or `timeout` ticks pass.
    ///
    /// Returns `None` on timeout, so an empty read is never mistaken for one.
    pub fn recv_timeout(
        &mut self,
        handle: Handle,
        max: usize,
        timeout: u64,
    ) -> Result<Option<Vec<u8>>> {
        for _ in 0..timeout {
            self.poll();
            let data = self.recv(handle, max)?;
            if !data.is_empty() {
                return Ok(Some(data));
            }
            self.tick();
        }
        Ok(None)
    }

    /// Close the socket: FIN for an established stream, dropped registration for everything
    /// else. The connection itself finishes its teardown in the background.
    pub fn close(&mut self, handle: Handle) -> Result<()> {
        let flow = match self.sockets.get(handle) {
            Some(Socket::Tcp(tcp)) => tcp.flow,
            Some(Socket::Udp(_)) => None,
            None => return Err(Error::Illegal),
        };
        if let Some(flow) = flow {
            if let Some(connection) = self.connections.get_mut(&flow) {
                connection.close(self.now);
                let mut outgoing = Vec::new();
                while let Some(segment) = connection.poll_transmit() {
                    outgoing.push(segment);
                }
                for segment in outgoing {
                    self.send_segment(flow, segment)?;
                }
            }
        }
        self.sockets.remove(handle);
        Ok(())
    }

    /// The TCP state behind a socket handle.
    pub fn tcp_state(&self, handle: Handle) -> State {
        match self.sockets.get(handle) {
            Some(Socket::Tcp(tcp)) => {
                if tcp.listener.is_some() {
                    return State::Listen;
                }
                match tcp.flow.and_then(|flow| self.connections.get(&flow)) {
                    Some(connection) => connection.state(),
                    None => State::Closed,
                }
            }
            _ => State::Closed,
        }
    }

    pub fn set_nodelay(&mut self, handle: Handle, nodelay: bool) -> Result<()> {
        let flow = self.sockets.tcp(handle)?.flow.ok_or(Error::Illegal)?;
        let connection = self.connections.get_mut(&flow).ok_or(Error::Illegal)?;
        connection.set_nodelay(nodelay);
        Ok(())
    }

    /// Send one datagram from a bound (or implicitly bound) datagram socket.
    pub fn send_udp(
        &mut self,
        handle: Handle,
        to: (Ipv4Address, u16),
        data: &[u8],
    ) -> Result<()> {
        let src_port = match self.sockets.udp_mut(handle)?.local {
            Some((_, port)) => port,
            None => {
                let port = self.sockets.ephemeral_port()?;
                self.bind(handle, port, false)?;
                port
            }
        };
        self.send_udp_raw(src_port, to, data)
    }

    /// Take one received datagram, if any.
    pub fn recv_udp(&mut self, handle: Handle) -> Result<Option<(Ipv4Address, u16, Vec<u8>)>> {
        Ok(self.sockets.udp_mut(handle)?.recv_queue.pop_front())
    }

    /// Send a datagram with no socket at all.
    pub fn send_udp_raw(
        &mut self,
        src_port: u16,
        to: (Ipv4Address, u16),
        data: &[u8],
    ) -> Result<()> {
        let mut src = (self.config.cidr.address(), src_port);
        if !self.nat.is_empty() {
            if let Some(translated) =
                self.nat.translate_outbound(src.0, src.1, to.0, IpProtocol::Udp)
            {
                src = translated;
            }
        }
        let repr = UdpRepr { src_port: src.1, dst_port: to.1, payload_len: data.len() };
        let mut buffer = vec![0; repr.buffer_len()];
        let header_len = repr.buffer_len() - data.len();
        buffer[header_len..].copy_from_slice(data);
        repr.emit(udp_packet::new_unchecked_mut(&mut buffer), src.0, to.0);
        self.send_ip_from(src.0, to.0, IpProtocol::Udp, buffer)
    }

    pub fn open_inbox(&mut self, port: u16) -> Result<()> {
        self.sockets.open_inbox(port)
    }

    pub fn close_inbox(&mut self, port: u16) {
        self.sockets.close_inbox(port)
    }

    pub fn recv_inbox(&mut self, port: u16) -> Option<(Ipv4Address, u16, Vec<u8>)> {
        self.sockets.recv_inbox(port)
    }

    /// Send an echo request, mostly useful over loopback.
    pub fn ping(&mut self, dst: Ipv4Address, ident: u16, seq_no: u16, data: &[u8]) -> Result<()> {
        let request = Icmpv4Repr::EchoRequest { ident, seq_no, data };
        let buffer = Self::icmp_bytes(&request);
        self.send_ip(dst, IpProtocol::Icmp, buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nic::Loopback;

    const ADDR: Ipv4Address = Ipv4Address([10, 0, 2, 15]);

    fn interface() -> Interface<Loopback> {
        Interface::new(Loopback::new(1500), Config {
            hardware_addr: EthernetAddress([0x02, 0, 0, 0, 0, 0x01]),
            cidr: Ipv4Cidr::new(ADDR, 24),
            gateway: Some(Ipv4Address([10, 0, 2, 2])),
            tcp: TcpConfig::default(),
        })
    }

    #[test]
    fn connect_to_own_listener_over_loopback() {
        let mut iface = interface();
        let listener = iface.tcp_socket();
        iface.bind(listener, 80, false).unwrap();
        iface.listen(listener, 4).unwrap();

        let client = iface.tcp_socket();
        iface.connect(client, ADDR, 80, 50).unwrap();
        assert_eq!(iface.tcp_state(client), State::Established);

        // The server half lags one poll behind the client's handshake ACK.
        iface.poll();
        let stream = iface.accept(listener).unwrap();
        assert_eq!(iface.tcp_state(stream), State::Established);
    }

    #[test]
    fn stream_roundtrip_over_loopback() {
        let mut iface = interface();
        let listener = iface.tcp_socket();
        iface.bind(listener, 80, false).unwrap();
        iface.listen(listener, 4).unwrap();

        let client = iface.tcp_socket();
        iface.connect(client, ADDR, 80, 50).unwrap();
        iface.poll();
        let stream = iface.accept(listener).unwrap();

        iface.send(client, b"GET / HTTP/1.0\r\n\r\n").unwrap();
        let request = iface.recv_timeout(stream, 1024, 50).unwrap();
        assert_eq!(request.as_deref(), Some(&b"GET / HTTP/1.0\r\n\r\n"[..]));

        iface.send(stream, b"HTTP/1.0 200 OK\r\n\r\n").unwrap();
        let response = iface.recv_timeout(client, 1024, 50).unwrap();
        assert_eq!(response.as_deref(), Some(&b"HTTP/1.0 200 OK\r\n\r\n"[..]));
    }

    #[test]
    fn syn_to_unbound_port_answered_with_rst() {
        let mut iface = interface();
        let client = iface.tcp_socket();
        iface.connect_start(client, ADDR, 81).unwrap();
        // SYN comes back over loopback, meets no listener, provokes an RST which in turn
        // aborts the connection attempt.
        iface.poll();
        iface.poll();
        assert_eq!(iface.connect_poll(client), Err(Error::Unreachable));
    }

    #[test]
    fn udp_inbox_roundtrip_over_loopback() {
        let mut iface = interface();
        iface.open_inbox(53).unwrap();
        iface.send_udp_raw(49000, (ADDR, 53), b"query").unwrap();
        iface.poll();
        let (from, port, payload) = iface.recv_inbox(53).unwrap();
        assert_eq!(from, ADDR);
        assert_eq!(port, 49000);
        assert_eq!(&payload[..], b"query");
    }

    #[test]
    fn udp_socket_roundtrip_over_loopback() {
        let mut iface = interface();
        let receiver = iface.udp_socket();
        iface.bind(receiver, 9000, false).unwrap();
        let sender = iface.udp_socket();
        iface.send_udp(sender, (ADDR, 9000), b"datagram").unwrap();
        iface.poll();
        let (_, _, payload) = iface.recv_udp(receiver).unwrap().unwrap();
        assert_eq!(&payload[..], b"datagram");
    }

    #[test]
    fn echo_request_produces_reply() {
        let mut iface = interface();
        iface.ping(ADDR, 0x1234, 1, b"abcd").unwrap();
        let tx_before = iface.stats().tx_frames;
        iface.poll();
        // The request came back to us and the reply went out.
        assert_eq!(iface.stats().tx_frames, tx_before + 1);
    }

    #[test]
    fn off_link_traffic_resolves_the_gateway() {
        let mut iface = interface();
        iface.send_udp_raw(49000, (Ipv4Address([8, 8, 8, 8]), 53), b"query").unwrap();
        // The datagram is deferred; what actually left is an ARP request for the gateway.
        assert_eq!(iface.stats().tx_frames, 1);
        let frame = iface.device_mut().poll().unwrap();
        let eth = ethernet_frame::new_checked(&frame[..]).unwrap();
        assert_eq!(eth.ethertype(), EthernetProtocol::Arp);
        let request = ArpRepr::parse(arp_packet::new_checked(eth.payload_slice()).unwrap()).unwrap();
        assert_eq!(request.target_protocol_addr, Ipv4Address([10, 0, 2, 2]));
    }
}
