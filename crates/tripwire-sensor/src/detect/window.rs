//! Per-address request counter for burst detection.
//!
//! Counts live in a fixed-size time bucket: every `window` the whole map is
//! cleared. This is a bucket reset, not a sliding window, so a burst that
//! straddles a boundary can go unreported.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Default, Clone, Copy)]
struct Slot {
    count: u64,
    reported: bool,
}

#[derive(Debug)]
struct WindowState {
    started: Instant,
    slots: HashMap<IpAddr, Slot>,
}

/// Bounded map of request counts per client address.
#[derive(Debug)]
pub struct RequestWindow {
    window: Duration,
    capacity: usize,
    state: Mutex<WindowState>,
}

impl RequestWindow {
    pub fn new(window: Duration, capacity: usize, now: Instant) -> Self {
        Self {
            window: window.max(Duration::from_millis(1)),
            capacity,
            state: Mutex::new(WindowState {
                started: now,
                slots: HashMap::new(),
            }),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Count one request from `addr` and return its count in the current
    /// bucket. Returns 0 when the map is full and `addr` is not tracked.
    pub fn observe(&self, addr: IpAddr, now: Instant) -> u64 {
        let mut state = self.state.lock();
        self.roll(&mut state, now);

        if !state.slots.contains_key(&addr) && state.slots.len() >= self.capacity {
            tracing::debug!(
                %addr,
                capacity = self.capacity,
                "request window full, address not tracked"
            );
            return 0;
        }

        let slot = state.slots.entry(addr).or_default();
        slot.count += 1;
        slot.count
    }

    /// Mark `addr` as reported for the current bucket.
    ///
    /// Returns `true` only for the first claim in a bucket.
    pub fn claim_report(&self, addr: IpAddr) -> bool {
        let mut state = self.state.lock();
        match state.slots.get_mut(&addr) {
            Some(slot) if !slot.reported => {
                slot.reported = true;
                true
            }
            _ => false,
        }
    }

    /// Number of addresses counted in the current bucket.
    pub fn tracked(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Clear the map if `now` is past the current bucket, keeping bucket
    /// boundaries on a fixed cadence from the first start.
    fn roll(&self, state: &mut WindowState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.started);
        if elapsed < self.window {
            return;
        }
        let into_bucket = elapsed.as_nanos() % self.window.as_nanos();
        state.started = now - Duration::from_nanos(into_bucket as u64);
        state.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const A: IpAddr = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1));
    const B: IpAddr = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 2));

    #[test]
    fn test_counts_per_address() {
        let t0 = Instant::now();
        let window = RequestWindow::new(Duration::from_secs(60), 10, t0);
        assert_eq!(window.observe(A, t0), 1);
        assert_eq!(window.observe(A, t0), 2);
        assert_eq!(window.observe(B, t0), 1);
        assert_eq!(window.tracked(), 2);
    }

    #[test]
    fn test_bucket_reset() {
        let t0 = Instant::now();
        let window = RequestWindow::new(Duration::from_secs(60), 10, t0);
        for _ in 0..5 {
            window.observe(A, t0);
        }
        assert!(window.claim_report(A));

        // Just before the boundary the count keeps growing.
        assert_eq!(window.observe(A, t0 + Duration::from_secs(59)), 6);

        // After it, counting starts over and the address can be reported again.
        assert_eq!(window.observe(A, t0 + Duration::from_secs(61)), 1);
        assert!(window.claim_report(A));
    }

    #[test]
    fn test_boundaries_stay_on_cadence() {
        let t0 = Instant::now();
        let window = RequestWindow::new(Duration::from_secs(60), 10, t0);
        window.observe(A, t0 + Duration::from_secs(150));
        // Bucket started at t0+120, so t0+179 is still the same bucket.
        assert_eq!(window.observe(A, t0 + Duration::from_secs(179)), 2);
        assert_eq!(window.observe(A, t0 + Duration::from_secs(180)), 1);
    }

    #[test]
    fn test_claim_report_once() {
        let t0 = Instant::now();
        let window = RequestWindow::new(Duration::from_secs(60), 10, t0);
        window.observe(A, t0);
        assert!(window.claim_report(A));
        assert!(!window.claim_report(A));
        assert!(!window.claim_report(B));
    }

    #[test]
    fn test_capacity_bound() {
        let t0 = Instant::now();
        let window = RequestWindow::new(Duration::from_secs(60), 1, t0);
        assert_eq!(window.observe(A, t0), 1);
        assert_eq!(window.observe(B, t0), 0);
        assert_eq!(window.observe(A, t0), 2);
        assert_eq!(window.tracked(), 1);
    }
}
