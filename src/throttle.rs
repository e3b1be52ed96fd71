//! Byte-rate pacing for the receive path
//!
//! Simple token bucket: callers bill the bytes the network actually
//! surfaced (headers and over-reads included) and sleep off any debt.
//! Shared across sibling workers, so the rate bounds the whole session.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

struct Bucket {
    available: f64,
    last_refill: Instant,
}

pub struct Throttler {
    rate_bytes_per_sec: f64,
    burst_bytes: f64,
    bucket: Mutex<Bucket>,
}

impl Throttler {
    /// `rate_bytes_per_sec` must be positive; a session with no limit
    /// simply carries no throttler.
    pub fn new(rate_bytes_per_sec: f64) -> Self {
        assert!(rate_bytes_per_sec > 0.0);
        let burst_bytes = rate_bytes_per_sec / 4.0;
        Throttler {
            rate_bytes_per_sec,
            burst_bytes,
            bucket: Mutex::new(Bucket {
                available: burst_bytes,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Bill `bytes` against the budget, blocking until the bucket is out
    /// of debt. The deduction happens immediately so concurrent callers
    /// see the spent budget even while this one sleeps.
    pub fn limit(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let debt = {
            let mut bucket = self.bucket.lock();
            let now = Instant::now();
            let refill = now.duration_since(bucket.last_refill).as_secs_f64() * self.rate_bytes_per_sec;
            bucket.available = (bucket.available + refill).min(self.burst_bytes);
            bucket.last_refill = now;
            bucket.available -= bytes as f64;
            if bucket.available < 0.0 {
                Duration::from_secs_f64(-bucket.available / self.rate_bytes_per_sec)
            } else {
                Duration::ZERO
            }
        };
        if !debt.is_zero() {
            std::thread::sleep(debt);
        }
    }
}
