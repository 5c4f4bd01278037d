//! Pluggable congestion window governors.
//!
//! Exactly one governor is attached per connection. Both are deliberately simplified renditions
//! driven by the coarse kernel tick rather than high-resolution pacing: the bandwidth-probe and
//! RTT-probe cadence below uses fixed tick thresholds, and that cadence is the contract.
//!
//! All arithmetic is integer-only. Fractional gains are carried as (numerator, denominator)
//! pairs.

use crate::time::{Duration, Instant, TICK_HZ};

/// The default maximum segment size, matching an Ethernet MTU of 1500.
pub const DEFAULT_MSS: usize = 1460;

/// A congestion window governor, one per connection.
#[derive(Debug)]
pub enum Governor {
    Bbr(Bbr),
    Cubic(Cubic),
}

impl Governor {
    /// The usable congestion window, in bytes.
    pub fn window(&self) -> usize {
        match self {
            Governor::Bbr(bbr) => bbr.window(),
            Governor::Cubic(cubic) => cubic.window(),
        }
    }

    /// Account for newly acknowledged bytes, with the RTT sample that acknowledged them.
    pub fn on_ack(&mut self, bytes_acked: usize, rtt: Option<Duration>, now: Instant) {
        match self {
            Governor::Bbr(bbr) => bbr.on_ack(bytes_acked, rtt, now),
            Governor::Cubic(cubic) => cubic.on_ack(bytes_acked, now),
        }
    }

    /// Account for a loss signal (retransmission or third duplicate ACK).
    pub fn on_loss(&mut self, now: Instant) {
        match self {
            // Loss is not a primary signal for the bandwidth/RTT model.
            Governor::Bbr(_) => (),
            Governor::Cubic(cubic) => cubic.on_loss(now),
        }
    }
}

/// The operating mode of the bandwidth/RTT governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BbrMode {
    Startup,
    Drain,
    ProbeBw,
    ProbeRtt,
}

/// A BBR-flavored governor.
///
/// STARTUP grows the bandwidth estimate until it stops improving by at least a quarter round over
/// round, DRAIN empties the queue that built up, then PROBE_BW cycles its gain over the fixed
/// sequence `[5/4, 3/4, 1, 1, 1, 1, 1, 1]`. When the minimum-RTT estimate goes stale the governor
/// dips into PROBE_RTT with a floor window to take a fresh sample.
#[derive(Debug)]
pub struct Bbr {
    mode: BbrMode,
    mss: usize,
    /// Estimated bottleneck bandwidth, in bytes per tick.
    btl_bw: u64,
    /// Minimum observed round trip, in ticks.
    rt_prop: Option<u64>,
    rt_prop_seen: Instant,
    /// Bandwidth at the last full-pipe check and how often it failed to grow.
    full_bw: u64,
    full_bw_rounds: u8,
    cycle_index: usize,
    cycle_advanced: Instant,
    probe_rtt_until: Instant,
    /// Bytes delivered since the last bandwidth sample.
    delivered: u64,
    delivered_since: Instant,
}

impl Bbr {
    /// The PROBE_BW gain cycle, in (numerator, denominator) pairs.
    const GAIN_CYCLE: [(u64, u64); 8] =
        [(5, 4), (3, 4), (1, 1), (1, 1), (1, 1), (1, 1), (1, 1), (1, 1)];

    /// STARTUP window gain of roughly 2/ln(2).
    const STARTUP_GAIN: (u64, u64) = (2885, 1000);

    /// DRAIN inverts the STARTUP gain.
    const DRAIN_GAIN: (u64, u64) = (1000, 2885);

    /// Ticks between gain-cycle steps in PROBE_BW.
    const CYCLE_TICKS: u64 = TICK_HZ;

    /// How long the minimum-RTT estimate stays fresh, in ticks.
    const RT_PROP_LIFETIME: u64 = 10 * TICK_HZ;

    /// How long PROBE_RTT holds the floor window, in ticks.
    const PROBE_RTT_TICKS: u64 = 2;

    pub fn new(mss: usize, now: Instant) -> Bbr {
        Bbr {
            mode: BbrMode::Startup,
            mss,
            btl_bw: 0,
            rt_prop: None,
            rt_prop_seen: now,
            full_bw: 0,
            full_bw_rounds: 0,
            cycle_index: 0,
            cycle_advanced: now,
            probe_rtt_until: now,
            delivered: 0,
            delivered_since: now,
        }
    }

    fn gain(&self) -> (u64, u64) {
        match self.mode {
            BbrMode::Startup => Self::STARTUP_GAIN,
            BbrMode::Drain => Self::DRAIN_GAIN,
            BbrMode::ProbeBw => Self::GAIN_CYCLE[self.cycle_index],
            BbrMode::ProbeRtt => (1, 1),
        }
    }

    /// The usable congestion window, in bytes.
    ///
    /// `max(4 * mss, btl_bw * rt_prop * gain)` once both estimates exist, else a conservative
    /// ten segments.
    pub fn window(&self) -> usize {
        if self.mode == BbrMode::ProbeRtt {
            return 4 * self.mss;
        }
        match (self.btl_bw, self.rt_prop) {
            (bw, Some(rtt)) if bw > 0 => {
                let (num, den) = self.gain();
                let bdp = bw * rtt * num / den;
                (bdp as usize).max(4 * self.mss)
            }
            _ => 10 * self.mss,
        }
    }

    pub fn on_ack(&mut self, bytes_acked: usize, rtt: Option<Duration>, now: Instant) {
        if let Some(rtt) = rtt {
            let ticks = rtt.as_ticks().max(1);
            if self.rt_prop.map_or(true, |min| ticks <= min) {
                self.rt_prop = Some(ticks);
                self.rt_prop_seen = now;
            }
        }

        self.delivered += bytes_acked as u64;
        let elapsed = (now - self.delivered_since).as_ticks();
        if elapsed >= 1 {
            let rate = self.delivered / elapsed;
            self.btl_bw = self.btl_bw.max(rate);
            self.delivered = 0;
            self.delivered_since = now;
            self.advance(now);
        }
    }

    fn advance(&mut self, now: Instant) {
        match self.mode {
            BbrMode::Startup => {
                // Full pipe: bandwidth failed to grow by >= 25% for three rounds.
                if self.btl_bw * 4 >= self.full_bw * 5 {
                    self.full_bw = self.btl_bw;
                    self.full_bw_rounds = 0;
                } else {
                    self.full_bw_rounds += 1;
                    if self.full_bw_rounds >= 3 {
                        net_trace!("bbr: pipe full at {} bytes/tick, draining", self.btl_bw);
                        self.mode = BbrMode::Drain;
                    }
                }
            }
            BbrMode::Drain => {
                self.mode = BbrMode::ProbeBw;
                self.cycle_index = 0;
                self.cycle_advanced = now;
            }
            BbrMode::ProbeBw => {
                if (now - self.cycle_advanced).as_ticks() >= Self::CYCLE_TICKS {
                    self.cycle_index = (self.cycle_index + 1) % Self::GAIN_CYCLE.len();
                    self.cycle_advanced = now;
                }
                if (now - self.rt_prop_seen).as_ticks() >= Self::RT_PROP_LIFETIME {
                    net_trace!("bbr: min-rtt stale, probing");
                    self.mode = BbrMode::ProbeRtt;
                    self.probe_rtt_until = now + Duration::from_ticks(Self::PROBE_RTT_TICKS);
                    self.rt_prop = None;
                }
            }
            BbrMode::ProbeRtt => {
                if now >= self.probe_rtt_until && self.rt_prop.is_some() {
                    self.rt_prop_seen = now;
                    self.mode = BbrMode::ProbeBw;
                    self.cycle_index = 0;
                    self.cycle_advanced = now;
                }
            }
        }
    }
}

/// A CUBIC-flavored governor.
///
/// Time is measured in ticks since the last loss and the window in whole segments; the growth
/// curve is `w_max + 0.4 * (t - K)^3` with `K = cbrt(0.75 * w_max)` seconds, evaluated in integer
/// arithmetic. Past the slow-start threshold the window never shrinks on an ACK.
#[derive(Debug)]
pub struct Cubic {
    mss: usize,
    /// Current window, in bytes.
    cwnd: usize,
    /// Slow-start threshold, in bytes.
    ssthresh: usize,
    /// Window in segments at the last loss.
    w_max: u64,
    /// Ticks from the loss to the curve's origin.
    k_ticks: u64,
    epoch: Option<Instant>,
    /// Reno-friendly companion estimate, in bytes.
    reno: usize,
}

impl Cubic {
    pub fn new(mss: usize, _now: Instant) -> Cubic {
        Cubic {
            mss,
            cwnd: 10 * mss,
            ssthresh: usize::MAX,
            w_max: 0,
            k_ticks: 0,
            epoch: None,
            reno: 10 * mss,
        }
    }

    /// The usable congestion window, in bytes.
    pub fn window(&self) -> usize {
        self.cwnd
    }

    pub fn on_ack(&mut self, bytes_acked: usize, now: Instant) {
        if self.cwnd < self.ssthresh {
            // Slow start.
            self.cwnd += bytes_acked.min(self.mss);
            self.reno = self.cwnd;
            return;
        }

        let epoch = match self.epoch {
            Some(epoch) => epoch,
            None => {
                // Congestion avoidance reached without a prior loss.
                self.w_max = (self.cwnd / self.mss) as u64;
                self.k_ticks = 0;
                self.epoch = Some(now);
                now
            }
        };

        // W(t) = w_max + 0.4 * ((t - K) / TICK_HZ)^3, in segments. With TICK_HZ = 10 the cubic
        // term reduces to d^3 / 2500 for d in ticks.
        let d = (now - epoch).as_ticks() as i64 - self.k_ticks as i64;
        let target_segments = self.w_max as i64 + d.pow(3) / 2500;
        let target = (target_segments.max(1) as usize) * self.mss;

        self.reno += self.mss * bytes_acked / self.cwnd.max(1);

        self.cwnd = target.max(self.reno).max(self.cwnd);
    }

    pub fn on_loss(&mut self, now: Instant) {
        self.w_max = (self.cwnd / self.mss) as u64;
        // Threshold drops to 0.7 of the window, K = cbrt(0.3 / 0.4 * w_max) seconds.
        self.ssthresh = (self.cwnd * 7 / 10).max(2 * self.mss);
        self.cwnd = self.ssthresh;
        self.reno = self.ssthresh;
        self.k_ticks = TICK_HZ * cbrt(self.w_max * 3 / 4);
        self.epoch = Some(now);
        net_trace!("cubic: loss, w_max={} segments, K={} ticks", self.w_max, self.k_ticks);
    }
}

/// Integer cube root, rounding down.
fn cbrt(x: u64) -> u64 {
    let mut r = 0u64;
    while (r + 1).pow(3) <= x {
        r += 1;
    }
    r
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbrt_small_values() {
        assert_eq!(cbrt(0), 0);
        assert_eq!(cbrt(1), 1);
        assert_eq!(cbrt(26), 2);
        assert_eq!(cbrt(27), 3);
        assert_eq!(cbrt(1000), 10);
    }

    #[test]
    fn cubic_monotone_past_threshold() {
        let mut now = Instant::from_ticks(0);
        let mut cubic = Cubic::new(DEFAULT_MSS, now);
        cubic.on_loss(now);
        let mut last = cubic.window();
        for _ in 0..200 {
            now = now + Duration::from_ticks(1);
            cubic.on_ack(DEFAULT_MSS, now);
            assert!(cubic.window() >= last);
            last = cubic.window();
        }
        // Well past K the curve is over w_max again.
        assert!(cubic.window() > cubic.w_max as usize * DEFAULT_MSS);
    }

    #[test]
    fn cubic_loss_drops_to_seven_tenths() {
        let now = Instant::from_ticks(0);
        let mut cubic = Cubic::new(DEFAULT_MSS, now);
        let before = cubic.window();
        cubic.on_loss(now);
        assert_eq!(cubic.window(), before * 7 / 10);
    }

    #[test]
    fn cubic_slow_start_grows_per_ack() {
        let now = Instant::from_ticks(0);
        let mut cubic = Cubic::new(DEFAULT_MSS, now);
        let before = cubic.window();
        cubic.on_ack(DEFAULT_MSS, now);
        assert_eq!(cubic.window(), before + DEFAULT_MSS);
    }

    #[test]
    fn bbr_default_window_before_estimates() {
        let now = Instant::from_ticks(0);
        let bbr = Bbr::new(DEFAULT_MSS, now);
        assert_eq!(bbr.window(), 10 * DEFAULT_MSS);
    }

    #[test]
    fn bbr_window_from_bandwidth_delay_product() {
        let mut now = Instant::from_ticks(0);
        let mut bbr = Bbr::new(DEFAULT_MSS, now);
        // A steady 29200 bytes per tick with a 5-tick RTT fills the pipe, so after a few rounds
        // the governor has drained into PROBE_BW at the probing gain of 5/4.
        for _ in 0..10 {
            now = now + Duration::from_ticks(1);
            bbr.on_ack(29_200, Some(Duration::from_ticks(5)), now);
        }
        let bdp = 29_200u64 * 5;
        assert_eq!(bbr.window(), (bdp * 5 / 4) as usize);
    }

    #[test]
    fn bbr_keeps_min_rtt() {
        let mut now = Instant::from_ticks(0);
        let mut bbr = Bbr::new(DEFAULT_MSS, now);
        bbr.on_ack(1000, Some(Duration::from_ticks(8)), now);
        now = now + Duration::from_ticks(1);
        bbr.on_ack(1000, Some(Duration::from_ticks(3)), now);
        now = now + Duration::from_ticks(1);
        bbr.on_ack(1000, Some(Duration::from_ticks(9)), now);
        assert_eq!(bbr.rt_prop, Some(3));
    }

    #[test]
    fn bbr_gain_cycle_sequence() {
        assert_eq!(Bbr::GAIN_CYCLE[0], (5, 4));
        assert_eq!(Bbr::GAIN_CYCLE[1], (3, 4));
        assert!(Bbr::GAIN_CYCLE[2..].iter().all(|&g| g == (1, 1)));
    }
}
