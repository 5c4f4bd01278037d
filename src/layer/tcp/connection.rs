//! The TCP connection state machine.
//!
//! A [`Connection`] tracks one flow from handshake to teardown. It never touches the network
//! itself: incoming segments are fed to [`process`], outgoing segments accumulate in an outbox
//! drained through [`poll_transmit`], and all timers fire from [`on_tick`]. The interface owns
//! the table of connections and moves bytes between them and the device.
//!
//! [`Connection`]: struct.Connection.html
//! [`process`]: struct.Connection.html#method.process
//! [`poll_transmit`]: struct.Connection.html#method.poll_transmit
//! [`on_tick`]: struct.Connection.html#method.on_tick

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::time::{Duration, Instant};
use crate::wire::{TcpFlags, TcpRepr, TcpSeqNumber, MAX_SACK_RANGES};

use super::congestion::{Bbr, Cubic, Governor, DEFAULT_MSS};

/// The connection states of RFC 793.
///
/// `Listen` is never held by a connection in the table; it is the state reported by a listening
/// socket, which spawns a `SynReceived` connection per acceptable SYN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

/// Which governor a new connection attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorKind {
    Bbr,
    Cubic,
}

/// Keepalive probing configuration, all times in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    pub idle: u64,
    pub interval: u64,
    pub max_probes: u32,
}

/// Per-connection tunables.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub governor: GovernorKind,
    /// Nagle coalescing; `false` is `TCP_NODELAY`.
    pub nagle: bool,
    pub keepalive: Option<Keepalive>,
    /// Our offered window-scale shift.
    pub window_shift: u8,
    pub mss: usize,
    /// Receive window we advertise, in bytes.
    pub recv_window: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            governor: GovernorKind::Cubic,
            nagle: true,
            keepalive: None,
            window_shift: 0,
            mss: DEFAULT_MSS,
            recv_window: 65535,
        }
    }
}

/// One outgoing segment, ready for the wire except for addresses and checksum.
#[derive(Debug, Clone)]
pub struct Segment {
    pub repr: TcpRepr,
    pub payload: Vec<u8>,
}

/// The saved copy of the oldest unacknowledged segment.
///
/// Keeps the full representation so a resent SYN still carries its options.
#[derive(Debug, Clone)]
struct Retransmit {
    repr: TcpRepr,
    payload: Vec<u8>,
    deadline: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Persist {
    deadline: Instant,
    interval: u64,
}

/// A single TCP connection.
#[derive(Debug)]
pub struct Connection {
    pub local_port: u16,
    pub remote_port: u16,
    state: State,
    config: Config,

    /// Next sequence number to send.
    send_seq: TcpSeqNumber,
    /// Oldest unacknowledged sequence number.
    snd_una: TcpSeqNumber,
    /// Next sequence number expected from the peer.
    recv_seq: TcpSeqNumber,

    /// Bytes accepted from the application but not yet turned into segments.
    send_buffer: VecDeque<u8>,
    /// Bytes received and acknowledged but not yet claimed by a socket.
    ///
    /// Holds data that lands between the handshake and `accept`.
    recv_buffer: VecDeque<u8>,
    outbox: VecDeque<Segment>,

    /// Peer's usable window, already scaled.
    remote_window: usize,
    remote_shift: u8,
    mss: usize,

    retransmit: Option<Retransmit>,
    /// Smoothed RTT and variance, in ticks (Jacobson/Karels).
    srtt: Option<i64>,
    rttvar: i64,
    rto: u64,
    /// Expected ACK and send time of the segment being timed.
    rtt_sample: Option<(TcpSeqNumber, Instant)>,
    dup_acks: u8,

    persist: Option<Persist>,
    time_wait_until: Option<Instant>,
    last_activity: Instant,
    keepalive_probes: u32,

    sack_enabled: bool,
    /// Blocks most recently announced by the peer, echoed in our ACKs.
    sack_ranges: [Option<(u32, u32)>; MAX_SACK_RANGES],
    timestamps: bool,
    /// Peer's newest timestamp value, echoed back.
    ts_recent: u32,

    governor: Governor,
}

impl Connection {
    /// Lower RTO clamp, in ticks.
    const RTO_MIN: u64 = 10;
    /// Upper clamp for the RTO, the persist interval and their backoff, in ticks.
    const RTO_MAX: u64 = 6000;
    /// RTO before the first RTT measurement, in ticks.
    const RTO_INITIAL: u64 = 30;
    /// Added to the RTO when a fast retransmit signals congestion, in ticks.
    const RTO_INFLATION: u64 = 10;
    /// How long a TIME_WAIT connection lingers, in ticks.
    const TIME_WAIT_TICKS: u64 = 20;
    /// First persist probe delay, in ticks; doubles up to [`RTO_MAX`].
    ///
    /// [`RTO_MAX`]: #associatedconstant.RTO_MAX
    const PERSIST_INITIAL: u64 = 50;

    fn new(local_port: u16, remote_port: u16, iss: TcpSeqNumber, config: Config, now: Instant)
        -> Connection
    {
        let governor = match config.governor {
            GovernorKind::Bbr => Governor::Bbr(Bbr::new(config.mss, now)),
            GovernorKind::Cubic => Governor::Cubic(Cubic::new(config.mss, now)),
        };
        Connection {
            local_port,
            remote_port,
            state: State::Closed,
            config,
            send_seq: iss,
            snd_una: iss,
            recv_seq: TcpSeqNumber(0),
            send_buffer: VecDeque::new(),
            recv_buffer: VecDeque::new(),
            outbox: VecDeque::new(),
            remote_window: 0,
            remote_shift: 0,
            mss: config.mss,
            retransmit: None,
            srtt: None,
            rttvar: 0,
            rto: Self::RTO_INITIAL,
            rtt_sample: None,
            dup_acks: 0,
            persist: None,
            time_wait_until: None,
            last_activity: now,
            keepalive_probes: 0,
            sack_enabled: false,
            sack_ranges: [None; MAX_SACK_RANGES],
            timestamps: false,
            ts_recent: 0,
            governor,
        }
    }

    /// Open a connection actively. Queues the SYN and enters `SynSent`.
    pub fn client(
        local_port: u16,
        remote_port: u16,
        iss: TcpSeqNumber,
        config: Config,
        now: Instant,
    ) -> Connection {
        let mut conn = Connection::new(local_port, remote_port, iss, config, now);
        conn.state = State::SynSent;
        let repr = TcpRepr {
            src_port: local_port,
            dst_port: remote_port,
            flags: TcpFlags::SYN,
            seq_number: iss,
            ack_number: None,
            window_len: conn.advertised_window(),
            window_scale: Some(config.window_shift),
            max_seg_size: Some(config.mss as u16),
            sack_permitted: true,
            sack_ranges: [None; MAX_SACK_RANGES],
            timestamp: Some((now.total_ticks() as u32, 0)),
            payload_len: 0,
        };
        conn.send_segment(repr, Vec::new(), now);
        conn
    }

    /// Open a connection passively from a received SYN. Queues the SYN+ACK and enters
    /// `SynReceived`.
    pub fn server(
        local_port: u16,
        remote_port: u16,
        syn: &TcpRepr,
        iss: TcpSeqNumber,
        config: Config,
        now: Instant,
    ) -> Connection {
        let mut conn = Connection::new(local_port, remote_port, iss, config, now);
        conn.state = State::SynReceived;
        conn.recv_seq = syn.seq_number + 1;
        conn.negotiate(syn, now);

        let repr = TcpRepr {
            src_port: local_port,
            dst_port: remote_port,
            flags: TcpFlags::SYN,
            seq_number: iss,
            ack_number: Some(conn.recv_seq),
            window_len: conn.advertised_window(),
            window_scale: syn.window_scale.map(|_| config.window_shift),
            max_seg_size: Some(conn.mss as u16),
            sack_permitted: conn.sack_enabled,
            sack_ranges: [None; MAX_SACK_RANGES],
            timestamp: syn.timestamp.map(|(tsval, _)| (now.total_ticks() as u32, tsval)),
            payload_len: 0,
        };
        conn.send_segment(repr, Vec::new(), now);
        conn
    }

    /// Adopt the peer's options from its SYN or SYN+ACK.
    fn negotiate(&mut self, syn: &TcpRepr, _now: Instant) {
        if let Some(peer_mss) = syn.max_seg_size {
            self.mss = self.mss.min(usize::from(peer_mss));
        }
        self.remote_shift = syn.window_scale.unwrap_or(0);
        self.sack_enabled = syn.sack_permitted;
        if let Some((tsval, _)) = syn.timestamp {
            self.timestamps = true;
            self.ts_recent = tsval;
        }
        self.remote_window = usize::from(syn.window_len) << self.remote_shift;
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Oldest unacknowledged sequence number.
    pub fn send_unacked(&self) -> TcpSeqNumber {
        self.snd_una
    }

    /// Next sequence number to send.
    pub fn send_next(&self) -> TcpSeqNumber {
        self.send_seq
    }

    /// Next sequence number expected from the peer.
    pub fn recv_next(&self) -> TcpSeqNumber {
        self.recv_seq
    }

    /// Whether all sent data has been acknowledged and nothing waits for retransmission.
    pub fn all_acked(&self) -> bool {
        self.snd_una == self.send_seq && self.retransmit.is_none()
    }

    /// Whether the connection record can be dropped from the table.
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Disable or enable Nagle coalescing at runtime (`TCP_NODELAY`).
    pub fn set_nodelay(&mut self, nodelay: bool) {
        self.config.nagle = !nodelay;
    }

    /// Take the next segment destined for the wire.
    pub fn poll_transmit(&mut self) -> Option<Segment> {
        self.outbox.pop_front()
    }

    /// Park delivered bytes until a socket claims the flow.
    pub fn stash_received(&mut self, bytes: &[u8]) {
        self.recv_buffer.extend(bytes);
    }

    /// Drain everything parked by [`stash_received`].
    ///
    /// [`stash_received`]: #method.stash_received
    pub fn take_received(&mut self) -> Vec<u8> {
        self.recv_buffer.drain(..).collect()
    }

    fn advertised_window(&self) -> u16 {
        let scaled = self.config.recv_window >> self.config.window_shift;
        scaled.min(usize::from(u16::MAX)) as u16
    }

    /// Feed one incoming segment. Returns payload delivered to the application, if any.
    pub fn process(&mut self, repr: &TcpRepr, payload: &[u8], now: Instant) -> Option<Vec<u8>> {
        self.last_activity = now;
        self.keepalive_probes = 0;

        // An RST aborts unconditionally and discards all state.
        if repr.flags.rst() {
            net_debug!("connection {}:{} reset by peer", self.local_port, self.remote_port);
            self.enter_closed();
            return None;
        }

        if self.timestamps {
            if let Some((tsval, _)) = repr.timestamp {
                self.ts_recent = tsval;
            }
        }
        if self.sack_enabled && repr.sack_ranges.iter().any(|r| r.is_some()) {
            self.sack_ranges = repr.sack_ranges;
        }

        match self.state {
            State::SynSent => self.process_syn_sent(repr, now),
            State::SynReceived => self.process_syn_received(repr, payload, now),
            State::TimeWait => {
                // No transitions out of TIME_WAIT except deletion; a retransmitted FIN still
                // deserves its ACK.
                if repr.flags.fin() {
                    self.send_ack(now);
                }
                None
            }
            State::Closed | State::Listen => None,
            _ => self.process_stream(repr, payload, now),
        }
    }

    fn process_syn_sent(&mut self, repr: &TcpRepr, now: Instant) -> Option<Vec<u8>> {
        if !(repr.flags.syn() && repr.flags.ack()) {
            return None;
        }
        match repr.ack_number {
            Some(ack) if ack == self.snd_una + 1 => {}
            _ => return None,
        }
        self.negotiate(repr, now);
        self.recv_seq = repr.seq_number + 1;
        self.snd_una = self.snd_una + 1;
        self.retransmit = None;
        self.take_rtt_sample(self.snd_una, now);
        self.state = State::Established;
        net_trace!("connection {}:{} established (active)", self.local_port, self.remote_port);
        self.send_ack(now);
        self.flush_send(now);
        None
    }

    fn process_syn_received(&mut self, repr: &TcpRepr, payload: &[u8], now: Instant)
        -> Option<Vec<u8>>
    {
        if repr.flags.syn() {
            return None;
        }
        match repr.ack_number {
            Some(ack) if ack == self.snd_una + 1 => {
                self.snd_una = self.snd_una + 1;
                self.retransmit = None;
                self.take_rtt_sample(self.snd_una, now);
                self.state = State::Established;
                net_trace!("connection {}:{} established (passive)",
                           self.local_port, self.remote_port);
                // The handshake ACK may already carry data.
                if !payload.is_empty() {
                    return self.process_stream(repr, payload, now);
                }
                None
            }
            _ => None,
        }
    }

    /// Segment processing shared by all synchronized states.
    fn process_stream(&mut self, repr: &TcpRepr, payload: &[u8], now: Instant) -> Option<Vec<u8>> {
        // 1. Track the peer's window; zero arms the persist timer, reopening disarms it and
        //    releases coalesced data.
        let window = usize::from(repr.window_len) << self.remote_shift;
        let was_zero = self.remote_window == 0;
        self.remote_window = window;
        if window == 0 && !was_zero {
            self.persist = Some(Persist {
                deadline: now + Duration::from_ticks(Self::PERSIST_INITIAL),
                interval: Self::PERSIST_INITIAL,
            });
        } else if window > 0 && was_zero {
            self.persist = None;
            self.flush_send(now);
        }

        // 2. / 3. Acknowledgement bookkeeping.
        if let Some(ack) = repr.ack_number {
            if ack > self.snd_una && ack <= self.send_seq {
                self.on_new_ack(ack, now);
            } else if ack == self.snd_una && self.send_seq > self.snd_una {
                self.on_duplicate_ack(now);
            }
        }

        // 4. In-order payload is delivered and acknowledged.
        let mut delivered = None;
        if !payload.is_empty() && self.accepts_data() {
            delivered = self.receive_payload(repr.seq_number, payload, now);
        }

        // 5. A FIN consumes one sequence number and moves the close along.
        if repr.flags.fin() && repr.seq_number + payload.len() == self.recv_seq {
            self.recv_seq = self.recv_seq + 1;
            self.on_fin_received(now);
        }

        // Teardown ACK transitions that do not depend on payload.
        if let Some(ack) = repr.ack_number {
            self.on_teardown_ack(ack, now);
        }

        delivered
    }

    fn accepts_data(&self) -> bool {
        matches!(self.state, State::Established | State::FinWait1 | State::FinWait2)
    }

    fn receive_payload(&mut self, seq: TcpSeqNumber, payload: &[u8], now: Instant)
        -> Option<Vec<u8>>
    {
        if seq == self.recv_seq {
            self.recv_seq += payload.len();
            self.send_ack(now);
            return Some(payload.to_vec());
        }
        if seq < self.recv_seq && seq + payload.len() > self.recv_seq {
            // Partial overlap with already-received data; deliver the new tail.
            let skip = self.recv_seq - seq;
            let tail = payload[skip..].to_vec();
            self.recv_seq += tail.len();
            self.send_ack(now);
            return Some(tail);
        }
        // Stale retransmission or a hole ahead of us; re-assert our position.
        self.send_ack(now);
        None
    }

    fn on_new_ack(&mut self, ack: TcpSeqNumber, now: Instant) {
        let bytes_acked = ack - self.snd_una;
        self.snd_una = ack;
        self.dup_acks = 0;

        let rtt = match self.rtt_sample {
            Some((expected, sent_at)) if ack >= expected => {
                self.rtt_sample = None;
                let sample = now - sent_at;
                self.update_rtt(sample.as_ticks() as i64);
                Some(sample)
            }
            _ => None,
        };

        if self.snd_una == self.send_seq {
            self.retransmit = None;
        } else if let Some(retransmit) = &mut self.retransmit {
            let covered = retransmit.repr.seq_number
                + (retransmit.payload.len() + retransmit.repr.flags.sequence_len());
            if ack >= covered {
                self.retransmit = None;
            } else {
                // Partially acknowledged; give the remainder a fresh timeout.
                retransmit.deadline = now + Duration::from_ticks(self.rto);
            }
        }

        self.governor.on_ack(bytes_acked, rtt, now);
        self.flush_send(now);
    }

    /// Jacobson/Karels estimators, all in ticks.
    fn update_rtt(&mut self, sample: i64) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                let err = sample - srtt;
                self.srtt = Some(srtt + err / 8);
                self.rttvar += (err.abs() - self.rttvar) / 4;
            }
        }
        let srtt = self.srtt.unwrap_or(sample);
        let rto = srtt + (4 * self.rttvar).max(1);
        self.rto = (rto.max(0) as u64).clamp(Self::RTO_MIN, Self::RTO_MAX);
    }

    fn on_duplicate_ack(&mut self, now: Instant) {
        self.dup_acks += 1;
        if self.dup_acks != 3 {
            return;
        }
        self.dup_acks = 0;
        if let Some(retransmit) = self.retransmit.clone() {
            net_debug!("fast retransmit of seq {} on port {}",
                       retransmit.repr.seq_number, self.local_port);
            self.rto = (self.rto + Self::RTO_INFLATION).min(Self::RTO_MAX);
            self.resend(retransmit, now);
            self.governor.on_loss(now);
        }
    }

    fn on_fin_received(&mut self, now: Instant) {
        match self.state {
            State::Established => {
                self.state = State::CloseWait;
                self.send_ack(now);
            }
            State::FinWait1 => {
                // Simultaneous close; our FIN is not yet acknowledged.
                self.state = State::Closing;
                self.send_ack(now);
            }
            State::FinWait2 => {
                self.send_ack(now);
                self.enter_time_wait(now);
            }
            _ => {
                self.send_ack(now);
            }
        }
    }

    fn on_teardown_ack(&mut self, _ack: TcpSeqNumber, now: Instant) {
        // Our FIN is acknowledged once nothing remains outstanding.
        if self.snd_una != self.send_seq {
            return;
        }
        match self.state {
            State::FinWait1 => self.state = State::FinWait2,
            State::Closing => self.enter_time_wait(now),
            State::LastAck => self.enter_closed(),
            _ => (),
        }
    }

    fn enter_time_wait(&mut self, now: Instant) {
        self.state = State::TimeWait;
        self.time_wait_until = Some(now + Duration::from_ticks(Self::TIME_WAIT_TICKS));
        self.retransmit = None;
        self.persist = None;
    }

    fn enter_closed(&mut self) {
        self.state = State::Closed;
        self.retransmit = None;
        self.persist = None;
        self.send_buffer.clear();
        self.outbox.clear();
    }

    /// Accept bytes from the application.
    ///
    /// Data lands in the coalescing buffer and leaves as segments subject to Nagle's rule, the
    /// peer's window and the congestion window.
    pub fn send(&mut self, data: &[u8], now: Instant) -> bool {
        if !matches!(self.state, State::Established | State::CloseWait) {
            return false;
        }
        self.send_buffer.extend(data);
        self.flush_send(now);
        true
    }

    fn in_flight(&self) -> usize {
        self.send_seq - self.snd_una
    }

    fn flush_send(&mut self, now: Instant) {
        if !matches!(self.state, State::Established | State::CloseWait) {
            return;
        }
        while !self.send_buffer.is_empty() {
            if self.remote_window == 0 {
                break;
            }
            let in_flight = self.in_flight();
            // Nagle: hold small data back while anything is outstanding.
            if self.config.nagle && in_flight > 0 && self.send_buffer.len() < self.mss {
                break;
            }
            let window = self.remote_window.min(self.governor.window());
            let budget = window.saturating_sub(in_flight);
            let len = self.mss.min(budget).min(self.send_buffer.len());
            if len == 0 {
                break;
            }
            let payload: Vec<u8> = self.send_buffer.drain(..len).collect();
            self.send_data_segment(TcpFlags::PSH | TcpFlags::ACK, payload, now);
        }
    }

    /// Queue a retransmittable segment carrying `payload` and/or control flags.
    fn send_data_segment(&mut self, flags: TcpFlags, payload: Vec<u8>, now: Instant) {
        let repr = self.stream_repr(flags, self.send_seq, now);
        self.send_segment(repr, payload, now);
    }

    /// Queue an explicit segment, advance `send_seq` and arm the retransmit slot.
    ///
    /// The ACK flag follows `ack_number`; options in `repr` go out as given, which is what
    /// lets a SYN or SYN+ACK carry its negotiation options through a retransmission.
    fn send_segment(&mut self, repr: TcpRepr, payload: Vec<u8>, now: Instant) {
        let mut flags = repr.flags;
        flags.set_ack(repr.ack_number.is_some());
        let repr = TcpRepr {
            flags,
            payload_len: payload.len() as u16,
            ..repr
        };
        let seq_len = payload.len() + flags.sequence_len();
        self.send_seq = repr.seq_number + seq_len;
        if seq_len > 0 {
            if self.rtt_sample.is_none() {
                self.rtt_sample = Some((self.send_seq, now));
            }
            // The slot holds the oldest unacknowledged segment; younger in-flight segments
            // are recovered through it once it is resent and acknowledged.
            if self.retransmit.is_none() {
                self.retransmit = Some(Retransmit {
                    repr,
                    payload: payload.clone(),
                    deadline: now + Duration::from_ticks(self.rto),
                });
            }
        }
        self.outbox.push_back(Segment { repr, payload });
    }

    fn stream_repr(&self, flags: TcpFlags, seq: TcpSeqNumber, now: Instant) -> TcpRepr {
        TcpRepr {
            src_port: self.local_port,
            dst_port: self.remote_port,
            flags,
            seq_number: seq,
            ack_number: Some(self.recv_seq),
            window_len: self.advertised_window(),
            window_scale: None,
            max_seg_size: None,
            sack_permitted: false,
            sack_ranges: if self.sack_enabled {
                self.sack_ranges
            } else {
                [None; MAX_SACK_RANGES]
            },
            timestamp: if self.timestamps {
                Some((now.total_ticks() as u32, self.ts_recent))
            } else {
                None
            },
            payload_len: 0,
        }
    }

    fn send_ack(&mut self, now: Instant) {
        let repr = self.stream_repr(TcpFlags::ACK, self.send_seq, now);
        self.outbox.push_back(Segment { repr, payload: Vec::new() });
    }

    fn resend(&mut self, retransmit: Retransmit, now: Instant) {
        // Karn: never time a retransmitted segment.
        self.rtt_sample = None;
        let mut repr = retransmit.repr;
        // Cumulative state may have moved since the first transmission; the options stay as
        // they were, and a segment sent without an ack (the initial SYN) stays without one.
        if repr.ack_number.is_some() {
            repr.ack_number = Some(self.recv_seq);
            repr.window_len = self.advertised_window();
        }
        if let Some((_, tsecr)) = repr.timestamp {
            repr.timestamp = Some((now.total_ticks() as u32, tsecr));
        }
        self.outbox.push_back(Segment { repr, payload: retransmit.payload.clone() });
        self.retransmit = Some(Retransmit {
            deadline: now + Duration::from_ticks(self.rto),
            ..retransmit
        });
    }

    /// Close the sending direction.
    ///
    /// Coalesced data is flushed first so the FIN takes the last sequence number.
    pub fn close(&mut self, now: Instant) {
        match self.state {
            State::Established => {
                self.flush_send(now);
                self.send_fin(now);
                self.state = State::FinWait1;
            }
            State::CloseWait => {
                self.flush_send(now);
                self.send_fin(now);
                self.state = State::LastAck;
            }
            State::SynSent | State::SynReceived => self.enter_closed(),
            _ => (),
        }
    }

    fn send_fin(&mut self, now: Instant) {
        // Any pending data still rides along ahead of the FIN.
        let payload: Vec<u8> = self.send_buffer.drain(..).collect();
        self.send_data_segment(TcpFlags::FIN | TcpFlags::ACK, payload, now);
    }

    /// Abort: send an RST and discard the connection.
    pub fn abort(&mut self, now: Instant) {
        if matches!(self.state, State::Closed | State::Listen) {
            return;
        }
        let repr = TcpRepr {
            ack_number: Some(self.recv_seq),
            ..self.stream_repr(TcpFlags::RST, self.send_seq, now)
        };
        self.outbox.clear();
        self.outbox.push_back(Segment { repr, payload: Vec::new() });
        self.state = State::Closed;
        self.retransmit = None;
        self.persist = None;
        self.send_buffer.clear();
    }

    /// Drive every timer. Must be called at the tick cadence.
    pub fn on_tick(&mut self, now: Instant) {
        // Retransmission timeout with exponential backoff.
        if let Some(retransmit) = self.retransmit.clone() {
            if now >= retransmit.deadline {
                net_debug!("rto fired for seq {} on port {}, backoff to {}",
                           retransmit.repr.seq_number, self.local_port, self.rto * 2);
                self.rto = (self.rto * 2).min(Self::RTO_MAX);
                self.resend(retransmit, now);
                self.governor.on_loss(now);
            }
        }

        // Zero-window persist probe.
        if let Some(persist) = self.persist {
            if now >= persist.deadline && self.remote_window == 0 {
                self.send_persist_probe(now);
                let interval = (persist.interval * 2).min(Self::RTO_MAX);
                self.persist = Some(Persist {
                    deadline: now + Duration::from_ticks(interval),
                    interval,
                });
            }
        }

        // Keepalive on an idle established connection.
        if let Some(keepalive) = self.config.keepalive {
            if self.state == State::Established
                && (now - self.last_activity).as_ticks() >= keepalive.idle
            {
                if self.keepalive_probes >= keepalive.max_probes {
                    net_debug!("keepalive exhausted on port {}, aborting", self.local_port);
                    self.abort(now);
                } else {
                    self.keepalive_probes += 1;
                    self.send_ack(now);
                    // Probe again after the interval, not the full idle period.
                    self.last_activity = now
                        - Duration::from_ticks(keepalive.idle.saturating_sub(keepalive.interval));
                }
            }
        }

        // TIME_WAIT expiry deletes the record.
        if let Some(deadline) = self.time_wait_until {
            if now >= deadline {
                self.enter_closed();
            }
        }
    }

    /// One byte beyond the closed window provokes a fresh window update.
    fn send_persist_probe(&mut self, now: Instant) {
        if let Some(&byte) = self.send_buffer.front() {
            let repr = self.stream_repr(TcpFlags::ACK, self.send_seq, now);
            self.outbox.push_back(Segment {
                repr: TcpRepr { payload_len: 1, ..repr },
                payload: alloc::vec![byte],
            });
        } else {
            self.send_ack(now);
        }
    }

    fn take_rtt_sample(&mut self, _expected: TcpSeqNumber, _now: Instant) {
        // The handshake RTT is not measured; the first data segment starts the first sample.
        self.rtt_sample = None;
    }

    #[cfg(test)]
    pub(crate) fn retransmit_timeout(&self) -> u64 {
        self.rto
    }
}

/// The RST answering a segment that matches no connection or listener.
///
/// Acknowledges everything the offending segment occupied, so a SYN gets `ack = seq + 1`.
pub fn rst_reply(repr: &TcpRepr) -> TcpRepr {
    let (seq_number, ack_number) = match repr.ack_number {
        // The peer told us where it stands; answer in its own sequence space.
        Some(ack) => (ack, None),
        None => (TcpSeqNumber(0), Some(repr.seq_number + repr.sequence_len())),
    };
    TcpRepr {
        src_port: repr.dst_port,
        dst_port: repr.src_port,
        flags: TcpFlags::RST,
        seq_number,
        ack_number,
        window_len: 0,
        window_scale: None,
        max_seg_size: None,
        sack_permitted: false,
        sack_ranges: [None; MAX_SACK_RANGES],
        timestamp: None,
        payload_len: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(ticks: i64) -> Instant {
        Instant::from_ticks(ticks)
    }

    fn handshake(now: Instant) -> (Connection, Connection) {
        let config = Config::default();
        let mut client = Connection::client(40000, 80, TcpSeqNumber(100), config, now);
        let syn = client.poll_transmit().unwrap();
        assert!(syn.repr.flags.syn());

        let mut server = Connection::server(80, 40000, &syn.repr, TcpSeqNumber(7000), config, now);
        let syn_ack = server.poll_transmit().unwrap();
        assert!(syn_ack.repr.flags.syn() && syn_ack.repr.flags.ack());

        client.process(&syn_ack.repr, &[], now);
        assert_eq!(client.state(), State::Established);

        let ack = client.poll_transmit().unwrap();
        server.process(&ack.repr, &[], now);
        assert_eq!(server.state(), State::Established);

        (client, server)
    }

    /// Deliver every queued segment from `from` into `to`, returning the delivered payloads.
    fn exchange(from: &mut Connection, to: &mut Connection, now: Instant) -> Vec<u8> {
        let mut delivered = Vec::new();
        while let Some(segment) = from.poll_transmit() {
            if let Some(data) = to.process(&segment.repr, &segment.payload, now) {
                delivered.extend(data);
            }
        }
        delivered
    }

    #[test]
    fn three_way_handshake() {
        let now = t(0);
        let (client, server) = handshake(now);
        // Each side's counters agree with what the other sent.
        assert_eq!(client.send_next(), TcpSeqNumber(101));
        assert_eq!(client.send_unacked(), TcpSeqNumber(101));
        assert_eq!(client.recv_next(), TcpSeqNumber(7001));
        assert_eq!(server.recv_next(), TcpSeqNumber(101));
        assert_eq!(server.send_unacked(), TcpSeqNumber(7001));
    }

    #[test]
    fn data_transfer_and_full_ack() {
        let now = t(0);
        let (mut client, mut server) = handshake(now);
        assert!(client.send(b"GET / HTTP/1.0\r\n\r\n", now));

        let delivered = exchange(&mut client, &mut server, now);
        assert_eq!(&delivered[..], b"GET / HTTP/1.0\r\n\r\n");

        // The server's ACK empties the client's retransmit state.
        exchange(&mut server, &mut client, now);
        assert!(client.all_acked());
        assert_eq!(client.send_unacked(), client.send_next());
    }

    #[test]
    fn fast_retransmit_on_third_duplicate_ack() {
        let now = t(0);
        let (mut client, mut server) = handshake(now);
        client.send(b"hello", now);
        let data = client.poll_transmit().unwrap();

        // Build a duplicate ACK at the server's current position.
        server.process(&data.repr, &[], now); // segment lost: headers only, no payload delivery
        let dup = Segment {
            repr: server.stream_repr(TcpFlags::ACK, server.send_seq, now),
            payload: Vec::new(),
        };

        for _ in 0..2 {
            client.process(&dup.repr, &[], now);
            assert!(client.poll_transmit().is_none());
        }
        client.process(&dup.repr, &[], now);
        let resent = client.poll_transmit().unwrap();
        assert_eq!(resent.repr.seq_number, data.repr.seq_number);
        assert_eq!(&resent.payload[..], b"hello");
        // Exactly one retransmission.
        assert!(client.poll_transmit().is_none());
    }

    #[test]
    fn rto_backoff_doubles_and_caps() {
        let mut now = t(0);
        let (mut client, _server) = handshake(now);
        client.send(b"data", now);
        client.poll_transmit().unwrap();

        let mut rto = client.retransmit_timeout();
        for _ in 0..12 {
            now = now + Duration::from_ticks(rto);
            client.on_tick(now);
            let resent = client.poll_transmit().unwrap();
            assert_eq!(&resent.payload[..], b"data");
            let next = client.retransmit_timeout();
            assert_eq!(next, (rto * 2).min(6000));
            rto = next;
        }
        assert_eq!(rto, 6000);
    }

    #[test]
    fn retransmitted_syn_keeps_its_options() {
        let now = t(0);
        let config = Config::default();
        let mut client = Connection::client(40000, 80, TcpSeqNumber(100), config, now);
        let syn = client.poll_transmit().unwrap();
        assert_eq!(syn.repr.max_seg_size, Some(config.mss as u16));
        assert_eq!(syn.repr.ack_number, None);

        // The SYN is lost; its resend must be byte-for-byte renegotiable.
        let later = t(Connection::RTO_INITIAL as i64);
        client.on_tick(later);
        let resent = client.poll_transmit().unwrap();
        assert!(resent.repr.flags.syn() && !resent.repr.flags.ack());
        assert_eq!(resent.repr.ack_number, None);
        assert_eq!(resent.repr.seq_number, syn.repr.seq_number);
        assert_eq!(resent.repr.max_seg_size, syn.repr.max_seg_size);
        assert_eq!(resent.repr.window_scale, syn.repr.window_scale);
        assert!(resent.repr.sack_permitted);

        // A server answering the resend completes the handshake as usual.
        let mut server =
            Connection::server(80, 40000, &resent.repr, TcpSeqNumber(7000), config, later);
        let syn_ack = server.poll_transmit().unwrap();
        client.process(&syn_ack.repr, &[], later);
        assert_eq!(client.state(), State::Established);
        assert!(client.all_acked());
        let ack = client.poll_transmit().unwrap();
        server.process(&ack.repr, &[], later);
        assert_eq!(server.state(), State::Established);
    }

    #[test]
    fn data_before_claim_parked_on_the_connection() {
        let now = t(0);
        let (mut client, mut server) = handshake(now);
        client.send(b"EARLY", now);

        // Nobody owns the flow yet; the delivered bytes wait on the record.
        let delivered = exchange(&mut client, &mut server, now);
        server.stash_received(&delivered);
        assert_eq!(&server.take_received()[..], b"EARLY");
        assert!(server.take_received().is_empty());
    }

    #[test]
    fn graceful_close_through_time_wait() {
        let now = t(0);
        let (mut client, mut server) = handshake(now);

        client.close(now);
        assert_eq!(client.state(), State::FinWait1);
        exchange(&mut client, &mut server, now);
        assert_eq!(server.state(), State::CloseWait);
        exchange(&mut server, &mut client, now);
        assert_eq!(client.state(), State::FinWait2);

        server.close(now);
        assert_eq!(server.state(), State::LastAck);
        exchange(&mut server, &mut client, now);
        assert_eq!(client.state(), State::TimeWait);
        exchange(&mut client, &mut server, now);
        assert_eq!(server.state(), State::Closed);

        // The TIME_WAIT record disappears after its fixed hold.
        client.on_tick(now + Duration::from_ticks(Connection::TIME_WAIT_TICKS));
        assert!(client.is_closed());
    }

    #[test]
    fn rst_aborts_any_state() {
        let now = t(0);
        let (mut client, mut server) = handshake(now);
        server.abort(now);
        exchange(&mut server, &mut client, now);
        assert!(client.is_closed());
    }

    #[test]
    fn rst_reply_to_stray_syn() {
        let syn = TcpRepr {
            src_port: 40000,
            dst_port: 81,
            flags: TcpFlags::SYN,
            seq_number: TcpSeqNumber(555),
            ack_number: None,
            window_len: 4096,
            window_scale: None,
            max_seg_size: None,
            sack_permitted: false,
            sack_ranges: [None; MAX_SACK_RANGES],
            timestamp: None,
            payload_len: 0,
        };
        let rst = rst_reply(&syn);
        assert!(rst.flags.rst());
        assert_eq!(rst.ack_number, Some(TcpSeqNumber(556)));
        assert_eq!(rst.src_port, 81);
        assert_eq!(rst.dst_port, 40000);
    }

    #[test]
    fn nagle_holds_second_small_write() {
        let now = t(0);
        let (mut client, mut _server) = handshake(now);
        client.send(b"first", now);
        assert!(client.poll_transmit().is_some());
        // Outstanding data and a sub-MSS buffer: held back.
        client.send(b"second", now);
        assert!(client.poll_transmit().is_none());
    }

    #[test]
    fn nodelay_sends_immediately() {
        let now = t(0);
        let (mut client, mut _server) = handshake(now);
        client.set_nodelay(true);
        client.send(b"first", now);
        client.poll_transmit().unwrap();
        client.send(b"second", now);
        let second = client.poll_transmit().unwrap();
        assert_eq!(&second.payload[..], b"second");
    }

    #[test]
    fn zero_window_arms_persist() {
        let mut now = t(0);
        let (mut client, mut server) = handshake(now);
        client.send(b"payload", now);
        exchange(&mut client, &mut server, now);
        exchange(&mut server, &mut client, now);

        // The peer closes its window.
        let closed = TcpRepr {
            window_len: 0,
            ack_number: Some(client.send_next()),
            ..server.stream_repr(TcpFlags::ACK, server.send_seq, now)
        };
        client.process(&closed, &[], now);
        client.send(b"stuck", now);
        assert!(client.poll_transmit().is_none());

        // First probe after the initial persist interval, carrying one byte.
        now = now + Duration::from_ticks(Connection::PERSIST_INITIAL);
        client.on_tick(now);
        let probe = client.poll_transmit().unwrap();
        assert_eq!(probe.payload.len(), 1);
        assert_eq!(probe.payload[0], b's');
    }

    #[test]
    fn keepalive_aborts_after_probe_budget() {
        let mut now = t(0);
        let config = Config {
            keepalive: Some(Keepalive { idle: 100, interval: 20, max_probes: 2 }),
            ..Config::default()
        };
        let mut client = Connection::client(40000, 80, TcpSeqNumber(100), config, now);
        let syn = client.poll_transmit().unwrap();
        let mut server =
            Connection::server(80, 40000, &syn.repr, TcpSeqNumber(1), Config::default(), now);
        let syn_ack = server.poll_transmit().unwrap();
        client.process(&syn_ack.repr, &[], now);
        client.poll_transmit();

        // Idle long enough for two probes and then the abort.
        for _ in 0..3 {
            now = now + Duration::from_ticks(100);
            client.on_tick(now);
        }
        assert!(client.is_closed());
        // The final segment out is the RST.
        let mut last = None;
        while let Some(segment) = client.poll_transmit() {
            last = Some(segment);
        }
        assert!(last.unwrap().repr.flags.rst());
    }

    #[test]
    fn window_scale_applies_to_peer_window() {
        let now = t(0);
        let config = Config { window_shift: 2, ..Config::default() };
        let mut client = Connection::client(40000, 80, TcpSeqNumber(100), config, now);
        let syn = client.poll_transmit().unwrap();
        assert_eq!(syn.repr.window_scale, Some(2));

        let mut server = Connection::server(80, 40000, &syn.repr, TcpSeqNumber(1), config, now);
        let syn_ack = server.poll_transmit().unwrap();
        client.process(&syn_ack.repr, &[], now);
        // The server advertised with shift 2, so the client sees it scaled up.
        assert_eq!(client.remote_window, usize::from(syn_ack.repr.window_len) << 2);
    }

    #[test]
    fn timestamps_echoed_once_negotiated() {
        let now = t(5);
        let (mut client, mut server) = handshake(now);
        client.send(b"x", now);
        let data = client.poll_transmit().unwrap();
        assert!(data.repr.timestamp.is_some());
        server.process(&data.repr, &data.payload, now);
        let ack = server.poll_transmit().unwrap();
        // The peer's value comes back in the echo field.
        assert_eq!(ack.repr.timestamp.unwrap().1, data.repr.timestamp.unwrap().0);
    }

    #[test]
    fn sack_blocks_echoed() {
        let now = t(0);
        let (mut client, mut server) = handshake(now);
        let mut ranges = [None; MAX_SACK_RANGES];
        ranges[0] = Some((200, 300));
        let with_sack = TcpRepr {
            sack_ranges: ranges,
            ack_number: Some(client.send_next()),
            ..server.stream_repr(TcpFlags::ACK, server.send_seq, now)
        };
        client.process(&with_sack, &[], now);
        client.send(b"data", now);
        let out = client.poll_transmit().unwrap();
        assert_eq!(out.repr.sack_ranges[0], Some((200, 300)));
    }

    #[test]
    fn out_of_order_segment_not_delivered() {
        let now = t(0);
        let (mut client, mut server) = handshake(now);
        // A segment 10 bytes ahead of what the server expects.
        let ahead = TcpRepr {
            seq_number: client.send_next() + 10,
            payload_len: 3,
            ..client.stream_repr(TcpFlags::ACK, client.send_next(), now)
        };
        let delivered = server.process(&ahead, b"abc", now);
        assert_eq!(delivered, None);
        // It still answers with a corrective ACK at the expected position.
        let ack = server.poll_transmit().unwrap();
        assert_eq!(ack.repr.ack_number, Some(TcpSeqNumber(101)));
    }
}
