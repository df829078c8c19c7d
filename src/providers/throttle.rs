//! Per-account throttle for billed upstream calls

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    touched: Instant,
}

/// Token bucket per account: `burst` calls at once, refilled evenly so that
/// `per_minute` calls fit in any minute.
#[derive(Debug)]
pub struct CallThrottle {
    buckets: Mutex<HashMap<String, Bucket>>,
    burst: f64,
    refill_per_sec: f64,
}

impl CallThrottle {
    pub fn new(per_minute: u32, burst: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            burst: f64::from(burst.max(1)),
            refill_per_sec: f64::from(per_minute) / 60.0,
        }
    }

    /// Take one call from the account's bucket; false when it is empty
    pub async fn try_acquire(&self, account_id: &str) -> bool {
        self.try_acquire_at(account_id, Instant::now()).await
    }

    async fn try_acquire_at(&self, account_id: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().await;

        // Full buckets carry no state; drop them so idle accounts don't accumulate
        let (burst, rate) = (self.burst, self.refill_per_sec);
        buckets.retain(|_, b| level(b, now, rate, burst) < burst);

        let bucket = buckets.entry(account_id.to_owned()).or_insert(Bucket {
            tokens: burst,
            touched: now,
        });
        let available = level(bucket, now, rate, burst);
        bucket.touched = now;
        if available >= 1.0 {
            bucket.tokens = available - 1.0;
            true
        } else {
            bucket.tokens = available;
            false
        }
    }

    /// Delay until the account can make another call
    pub async fn retry_after(&self, account_id: &str) -> Duration {
        let buckets = self.buckets.lock().await;
        let Some(bucket) = buckets.get(account_id) else {
            return Duration::ZERO;
        };
        let missing = 1.0 - level(bucket, Instant::now(), self.refill_per_sec, self.burst);
        if missing <= 0.0 || self.refill_per_sec <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(missing / self.refill_per_sec)
    }
}

fn level(bucket: &Bucket, now: Instant, rate: f64, burst: f64) -> f64 {
    let elapsed = now.saturating_duration_since(bucket.touched).as_secs_f64();
    (bucket.tokens + elapsed * rate).min(burst)
}
