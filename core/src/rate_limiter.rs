use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Process-wide token bucket shared by every active download.
///
/// One token is one byte. Waiters are served strictly in arrival order: the
/// `gate` is a fair async mutex held while a waiter sleeps for its refill, so a
/// later small request can never overtake an earlier large one.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Option<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
    gate: tokio::sync::Mutex<()>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Permit for `bytes` of throughput, leased to one download stage for one read.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "unused bytes should be handed back with RateLimiter::settle"]
pub struct RateLimitToken {
    bytes: u64,
}

impl RateLimitToken {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl RateLimiter {
    pub fn unlimited() -> Self {
        Self { bucket: None }
    }

    /// `rate` bytes per second with a burst of at most `capacity` bytes.
    pub fn new(rate: u64, capacity: u64) -> Self {
        if rate == 0 {
            return Self::unlimited();
        }
        let capacity = capacity.max(1) as f64;
        Self {
            bucket: Some(Bucket {
                rate: rate as f64,
                capacity,
                state: Mutex::new(BucketState {
                    tokens: capacity,
                    last_refill: Instant::now(),
                }),
                gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Bucket sized for a download loop reading `chunk_size` bytes at a time:
    /// a tenth of a second of burst, never smaller than one chunk.
    pub fn for_chunks(rate: Option<u64>, chunk_size: usize) -> Self {
        match rate {
            Some(rate) if rate > 0 => Self::new(rate, (rate / 10).max(chunk_size as u64)),
            _ => Self::unlimited(),
        }
    }

    pub fn is_limited(&self) -> bool {
        self.bucket.is_some()
    }

    pub fn rate(&self) -> Option<u64> {
        self.bucket.as_ref().map(|b| b.rate as u64)
    }

    /// Wait until `bytes` tokens are available and take them.
    ///
    /// Requests larger than the bucket are clamped to its capacity so they can
    /// always be satisfied. Dropping the future gives up the place in line.
    pub async fn acquire(&self, bytes: u64) -> RateLimitToken {
        let Some(bucket) = &self.bucket else {
            return RateLimitToken { bytes };
        };

        let wanted = (bytes as f64).min(bucket.capacity);
        let _turn = bucket.gate.lock().await;

        loop {
            let wait = {
                let mut state = bucket.state.lock();
                bucket.refill(&mut state);
                if state.tokens >= wanted {
                    state.tokens -= wanted;
                    return RateLimitToken {
                        bytes: wanted as u64,
                    };
                }
                Duration::from_secs_f64((wanted - state.tokens) / bucket.rate)
            };
            debug!(wanted, wait_ms = wait.as_millis() as u64, "rate limiter waiting for refill");
            tokio::time::sleep(wait).await;
        }
    }

    /// Return the part of a token a short read did not use.
    pub fn settle(&self, token: RateLimitToken, used: u64) {
        let unused = token.bytes.saturating_sub(used);
        if unused > 0 {
            self.refund(unused);
        }
    }

    /// Hand bytes back to the bucket, never filling it above capacity.
    pub fn refund(&self, bytes: u64) {
        if let Some(bucket) = &self.bucket {
            let mut state = bucket.state.lock();
            bucket.refill(&mut state);
            state.tokens = (state.tokens + bytes as f64).min(bucket.capacity);
        }
    }

    /// Tokens available right now. Unlimited limiters report `None`.
    pub fn available(&self) -> Option<u64> {
        self.bucket.as_ref().map(|bucket| {
            let mut state = bucket.state.lock();
            bucket.refill(&mut state);
            state.tokens as u64
        })
    }
}

impl Bucket {
    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.last_refill = now;
    }
}
