//! Bandwidth throttling for connection reads and writes.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket limiting a byte stream to `rate` bytes per second.
///
/// One throttler may be shared by many connections, in which case they
/// split the rate between them.
pub struct BandwidthThrottler {
    rate: u64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl BandwidthThrottler {
    /// Create a throttler. A rate of zero means unlimited.
    pub fn new(rate: u64) -> Self {
        Self {
            rate,
            capacity: rate as f64,
            bucket: Mutex::new(Bucket {
                tokens: rate as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Take up to `wanted` bytes of budget without waiting.
    ///
    /// Returns the number of bytes granted, or how long to wait before any
    /// budget becomes available.
    fn try_take(&self, wanted: usize) -> Result<usize, Duration> {
        if self.rate == 0 {
            return Ok(wanted);
        }

        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate as f64).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            let granted = (wanted as f64).min(bucket.tokens.floor()) as usize;
            bucket.tokens -= granted as f64;
            Ok(granted)
        } else {
            let missing = 1.0 - bucket.tokens;
            Err(Duration::from_secs_f64(missing / self.rate as f64))
        }
    }

    /// Wait until at least one byte of budget is available and take up to
    /// `wanted` bytes of it.
    pub async fn request_bytes(&self, wanted: usize) -> usize {
        if wanted == 0 {
            return 0;
        }
        loop {
            match self.try_take(wanted) {
                Ok(granted) => return granted,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }
}

impl std::fmt::Debug for BandwidthThrottler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandwidthThrottler")
            .field("rate", &self.rate)
            .finish()
    }
}
