//! Retransmission-timeout and congestion-window bookkeeping.
//!
//! Retransmission follows the RFC 6298 recurrence; congestion control is
//! TCP Reno (slow start, congestion avoidance, fast retreat on inferred
//! loss).

/// Smoothing factor for the round-trip estimate.
const RTT_ALPHA: f64 = 0.125;
/// Smoothing factor for the round-trip variance.
const RTT_BETA: f64 = 0.25;
/// Floor for the retransmission timeout, in seconds.
const MIN_RTO: f64 = 1.0;

/// Smoothed round-trip time, variance, and retransmission timeout, all in
/// seconds.
#[derive(Debug)]
pub struct RtoEstimator {
    srtt: f64,
    rtt_var: f64,
    rto: f64,
}

impl Default for RtoEstimator {
    fn default() -> Self {
        // Negative srtt marks "no sample yet".
        Self {
            srtt: -1.0,
            rtt_var: -1.0,
            rto: 1.0,
        }
    }
}

impl RtoEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rto(&self) -> f64 {
        self.rto
    }

    pub fn update(&mut self, rtt: f64) {
        if self.srtt < 0.0 {
            self.srtt = rtt;
            self.rtt_var = rtt / 2.0;
        } else {
            self.rtt_var = (1.0 - RTT_BETA) * self.rtt_var + RTT_BETA * (self.srtt - rtt).abs();
            self.srtt = (1.0 - RTT_ALPHA) * self.srtt + RTT_ALPHA * rtt;
        }
        self.rto = (self.srtt + 4.0 * self.rtt_var).max(MIN_RTO);
    }
}

/// TCP-Reno-style congestion window, counted in packets.
#[derive(Debug)]
pub struct CongestionWindow {
    cwnd: f64,
    ssthresh: f64,
}

impl Default for CongestionWindow {
    fn default() -> Self {
        Self {
            cwnd: 1.0,
            ssthresh: f64::INFINITY,
        }
    }
}

impl CongestionWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cwnd(&self) -> f64 {
        self.cwnd
    }

    /// Opens the window so tests can push several packets at once.
    #[cfg(test)]
    pub(crate) fn force_cwnd(&mut self, cwnd: f64) {
        self.cwnd = cwnd;
    }

    /// Reacts to one ACK datagram. `packets_sent` counts transmissions since
    /// the previous ACK, `num_acks` the newly acknowledged message numbers,
    /// and `num_holes` the holes in the ACK ranges that still correspond to
    /// outstanding resends. The caller resets its packet counter afterwards.
    pub fn update(&mut self, packets_sent: u32, num_acks: usize, num_holes: usize) {
        if num_holes > 0 {
            self.ssthresh = self.cwnd / 2.0;
            self.cwnd = self.ssthresh;
        } else if packets_sent as f64 >= self.cwnd {
            // The window was fully used, not idling.
            if num_acks as f64 > self.ssthresh {
                self.cwnd += num_acks as f64 / self.cwnd;
            } else {
                self.cwnd += num_acks as f64;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rto_first_sample() {
        let mut rto = RtoEstimator::new();
        rto.update(0.2);
        assert_eq!(rto.srtt, 0.2);
        assert_eq!(rto.rtt_var, 0.1);
        // srtt + 4 * rtt_var = 0.6, floored to 1.0
        assert_eq!(rto.rto(), 1.0);
    }

    #[test]
    fn test_rto_smoothing() {
        let mut rto = RtoEstimator::new();
        rto.update(1.0);
        rto.update(2.0);
        // srtt = 7/8 * 1.0 + 1/8 * 2.0, rtt_var = 3/4 * 0.5 + 1/4 * 1.0
        assert!((rto.srtt - 1.125).abs() < 1e-9);
        assert!((rto.rtt_var - 0.625).abs() < 1e-9);
        assert!((rto.rto() - 3.625).abs() < 1e-9);
    }

    #[test]
    fn test_rto_floor() {
        let mut rto = RtoEstimator::new();
        rto.update(0.01);
        assert_eq!(rto.rto(), 1.0);
    }

    #[test]
    fn test_cwnd_slow_start() {
        let mut window = CongestionWindow::new();
        window.cwnd = 4.0;
        window.update(4, 3, 0);
        assert_eq!(window.cwnd(), 7.0);
    }

    #[test]
    fn test_cwnd_holes_halve() {
        let mut window = CongestionWindow::new();
        window.cwnd = 4.0;
        window.update(4, 3, 1);
        assert_eq!(window.cwnd(), 2.0);
        assert_eq!(window.ssthresh, 2.0);
    }

    #[test]
    fn test_cwnd_congestion_avoidance() {
        let mut window = CongestionWindow::new();
        window.cwnd = 8.0;
        window.ssthresh = 2.0;
        window.update(8, 4, 0);
        assert_eq!(window.cwnd(), 8.5);
    }

    #[test]
    fn test_cwnd_idle_window_unchanged() {
        let mut window = CongestionWindow::new();
        window.cwnd = 8.0;
        window.update(2, 2, 0);
        assert_eq!(window.cwnd(), 8.0);
    }
}
