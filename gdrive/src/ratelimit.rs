//! Token bucket shared by every remote request.
//!
//! The published API quota is 300 requests per minute; half is taken so
//! the external mount tooling polling the same drive keeps its share.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::ApiError;

pub const REQUESTS_PER_MINUTE: u32 = 300 / 2;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(per_minute: u32, burst: u32) -> Self {
        RateLimiter {
            capacity: burst as f64,
            refill_per_sec: per_minute as f64 / 60.0,
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                refilled: Instant::now(),
            }),
        }
    }

    /// The watcher default: 150 requests/minute with a burst of 75.
    pub fn for_drive() -> Self {
        Self::new(REQUESTS_PER_MINUTE, REQUESTS_PER_MINUTE / 2)
    }

    /// Take one token, waiting for the refill when the bucket is dry.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), ApiError> {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().expect("limiter lock poisoned");
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.refilled).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                bucket.refilled = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.refill_per_sec)
            };
            tokio::select! {
                _ = cancel.cancelled() => return Err(ApiError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
