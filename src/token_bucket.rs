use std::sync::Mutex;
use std::time::{Duration, Instant};

/// 令牌桶限流器
///
/// 容量等于每分钟允许的请求数，按 `tpm / 60` 个每秒匀速补充。
/// 取令牌从不阻塞：没有可用令牌时立即返回 false。
pub struct TokenBucket {
    capacity: f64,
    /// 每秒补充的令牌数
    rate: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// `tpm`: 每分钟令牌数，同时也是桶容量。桶创建时是满的。
    pub fn new(tpm: u32) -> Self {
        Self::with_rate(tpm, f64::from(tpm) / 60.0)
    }

    /// 自定义补充速率（每秒）
    pub fn with_rate(capacity: u32, per_second: f64) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            rate: per_second.max(0.0),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = now.saturating_duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        state.last_refill = state.last_refill.max(now);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// 当前可用令牌数（向下取整）
    pub fn available(&self) -> u32 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.tokens.floor() as u32
    }

    /// 补满一个令牌大约需要的时间
    pub fn refill_interval(&self) -> Option<Duration> {
        (self.rate > 0.0).then(|| Duration::from_secs_f64(1.0 / self.rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn drains_then_rejects() {
        let bucket = TokenBucket::with_rate(3, 0.0);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        assert_eq!(bucket.available(), 0);
    }

    #[test]
    fn refills_over_time_up_to_capacity() {
        let bucket = TokenBucket::new(60); // 每秒 1 个
        let start = Instant::now();
        for _ in 0..60 {
            assert!(bucket.try_acquire_at(start));
        }
        assert!(!bucket.try_acquire_at(start));

        let later = start + Duration::from_secs(2);
        assert!(bucket.try_acquire_at(later));
        assert!(bucket.try_acquire_at(later));
        assert!(!bucket.try_acquire_at(later));

        // 很久之后也不会超过容量
        let much_later = later + Duration::from_secs(3600);
        let granted = (0..100).filter(|_| bucket.try_acquire_at(much_later)).count();
        assert_eq!(granted, 60);
    }

    #[test]
    fn concurrent_draws_never_overspend() {
        let bucket = Arc::new(TokenBucket::with_rate(50, 0.0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = bucket.clone();
                std::thread::spawn(move || (0..20).filter(|_| b.try_acquire()).count())
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 50);
    }

    #[test]
    fn zero_rate_has_no_interval() {
        assert!(TokenBucket::with_rate(1, 0.0).refill_interval().is_none());
        assert_eq!(
            TokenBucket::new(60).refill_interval(),
            Some(Duration::from_secs(1))
        );
    }
}
