use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Request-per-minute token bucket. Refills continuously; callers probe it
/// with `try_acquire` and fall back to another provider instead of waiting.
#[derive(Debug)]
pub struct RateLimiter {
    requests_per_min: u64,
    // token bucket modeled by the time of last refill and the current tokens
    tokens: Mutex<(f64, Instant)>,
}

impl RateLimiter {
    pub fn new(requests_per_min: u64) -> Self {
        Self {
            requests_per_min,
            tokens: Mutex::new((requests_per_min as f64, Instant::now())),
        }
    }

    /// Whether a token is available right now, consuming it when so. Never
    /// waits.
    pub async fn try_acquire(&self) -> bool {
        if self.requests_per_min == 0 {
            return true;
        }
        let capacity = self.requests_per_min as f64;
        let refill_rate = capacity / 60.0; // tokens per second
        let mut guard = self.tokens.lock().await;
        let (ref mut tokens, ref mut last) = *guard;
        let now = Instant::now();
        let elapsed = now.duration_since(*last).as_secs_f64();
        *tokens = (*tokens + elapsed * refill_rate).min(capacity);
        *last = now;
        if *tokens >= 1.0 {
            *tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Lock-free rotation cursor shared by callers that take turns over a fixed
/// set of slots (LLM providers, registry accounts).
#[derive(Debug, Default)]
pub struct RotationCursor {
    next: AtomicUsize,
}

impl RotationCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next slot index for a pool of `len` slots.
    pub fn advance(&self, len: usize) -> usize {
        debug_assert!(len > 0);
        self.next.fetch_add(1, Ordering::Relaxed) % len
    }
}

/// A pool of identities rotated per request, each with its own minimum delay
/// between consecutive uses.
#[derive(Debug)]
pub struct PacedPool {
    slots: Vec<PacedSlot>,
    cursor: RotationCursor,
    min_delay: Duration,
}

#[derive(Debug)]
struct PacedSlot {
    value: String,
    last_used: Mutex<Option<Instant>>,
}

impl PacedPool {
    pub fn new(values: Vec<String>, min_delay: Duration) -> Self {
        Self {
            slots: values
                .into_iter()
                .map(|value| PacedSlot {
                    value,
                    last_used: Mutex::new(None),
                })
                .collect(),
            cursor: RotationCursor::new(),
            min_delay,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Take the next identity, waiting out its per-slot pacing delay first.
    pub async fn checkout(&self) -> &str {
        let slot = &self.slots[self.cursor.advance(self.slots.len())];
        let mut last_used = slot.last_used.lock().await;
        if let Some(last) = *last_used {
            let elapsed = last.elapsed();
            if elapsed < self.min_delay {
                tokio::time::sleep(self.min_delay - elapsed).await;
            }
        }
        *last_used = Some(Instant::now());
        &slot.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_starts_with_full_bucket() {
        let limiter = RateLimiter::new(5);
        for _ in 0..5 {
            assert!(limiter.try_acquire().await);
        }
        assert!(!limiter.try_acquire().await);
    }

    #[tokio::test]
    async fn drained_bucket_refills_over_time() {
        let limiter = RateLimiter::new(600); // 10 tokens per second
        for _ in 0..600 {
            assert!(limiter.try_acquire().await);
        }
        assert!(!limiter.try_acquire().await);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(limiter.try_acquire().await);
    }

    #[tokio::test]
    async fn zero_rpm_means_unlimited() {
        let limiter = RateLimiter::new(0);
        for _ in 0..100 {
            assert!(limiter.try_acquire().await);
        }
    }

    #[test]
    fn rotation_cursor_cycles_through_slots() {
        let cursor = RotationCursor::new();
        let picks: Vec<usize> = (0..6).map(|_| cursor.advance(3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[tokio::test]
    async fn paced_pool_rotates_identities() {
        let pool = PacedPool::new(
            vec!["agent-a".to_string(), "agent-b".to_string()],
            Duration::from_millis(0),
        );
        assert_eq!(pool.checkout().await, "agent-a");
        assert_eq!(pool.checkout().await, "agent-b");
        assert_eq!(pool.checkout().await, "agent-a");
    }

    #[tokio::test]
    async fn paced_pool_enforces_per_slot_delay() {
        let pool = PacedPool::new(vec!["agent-a".to_string()], Duration::from_millis(50));
        let start = Instant::now();
        pool.checkout().await;
        pool.checkout().await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
