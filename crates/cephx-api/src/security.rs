use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::http::{header, HeaderValue};

use crate::cache::Clock;

const MAX_FAILURES: u32 = 5;
const WINDOW: Duration = Duration::from_secs(60);
const LOCKOUT: Duration = Duration::from_secs(60);
/// Expired entries are swept once the map grows past this size.
const PRUNE_THRESHOLD: usize = 1024;
/// Hard bound on tracked clients; the oldest entry is evicted beyond it.
const MAX_TRACKED_CLIENTS: usize = 4096;

struct RateLimitEntry {
    failures: u32,
    first_failure: Instant,
    locked_until: Option<Instant>,
}

/// Tracks failed API-key attempts per client address.
pub struct AuthRateLimiter {
    inner: Mutex<HashMap<String, RateLimitEntry>>,
    clock: Arc<dyn Clock>,
}

impl AuthRateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Returns true once the client is locked out.
    pub fn record_failure(&self, client: &str) -> bool {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !inner.contains_key(client) {
            if inner.len() >= PRUNE_THRESHOLD {
                retain_live(&mut inner, now);
            }
            if inner.len() >= MAX_TRACKED_CLIENTS {
                evict_oldest(&mut inner);
            }
        }
        let entry = inner.entry(client.to_string()).or_insert(RateLimitEntry {
            failures: 0,
            first_failure: now,
            locked_until: None,
        });
        if entry.first_failure + WINDOW < now {
            entry.failures = 0;
            entry.first_failure = now;
        }
        entry.failures += 1;
        if entry.failures >= MAX_FAILURES {
            entry.locked_until = Some(now + LOCKOUT);
            tracing::warn!(client, failures = entry.failures, "client locked out");
        }
        entry.locked_until.is_some_and(|until| until > now)
    }

    pub fn is_rate_limited(&self, client: &str) -> bool {
        let now = self.clock.now();
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .get(client)
            .and_then(|e| e.locked_until)
            .is_some_and(|until| until > now)
    }

    /// Drops entries whose window and lockout have both passed.
    pub fn prune(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        retain_live(&mut inner, now);
    }

    pub fn tracked_clients(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn retain_live(entries: &mut HashMap<String, RateLimitEntry>, now: Instant) {
    entries.retain(|_, e| {
        e.first_failure + WINDOW > now || e.locked_until.is_some_and(|until| until > now)
    });
}

/// Unlocked clients go first, then the earliest first failure.
fn evict_oldest(entries: &mut HashMap<String, RateLimitEntry>) {
    let oldest = entries
        .iter()
        .min_by_key(|(_, e)| (e.locked_until.is_some(), e.first_failure))
        .map(|(client, _)| client.clone());
    if let Some(client) = oldest {
        entries.remove(&client);
    }
}

pub async fn security_headers_middleware(
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;

    fn limiter() -> (AuthRateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (AuthRateLimiter::new(clock.clone()), clock)
    }

    #[test]
    fn single_failure_not_limited() {
        let (limiter, _) = limiter();
        assert!(!limiter.record_failure("10.0.0.1"));
        assert!(!limiter.is_rate_limited("10.0.0.1"));
    }

    #[test]
    fn five_failures_lock_out() {
        let (limiter, _) = limiter();
        for _ in 0..4 {
            assert!(!limiter.record_failure("10.0.0.1"));
        }
        assert!(limiter.record_failure("10.0.0.1"));
        assert!(limiter.is_rate_limited("10.0.0.1"));
        assert!(!limiter.is_rate_limited("10.0.0.2"));
    }

    #[test]
    fn lockout_expires() {
        let (limiter, clock) = limiter();
        for _ in 0..5 {
            limiter.record_failure("10.0.0.1");
        }
        clock.advance(Duration::from_secs(61));
        assert!(!limiter.is_rate_limited("10.0.0.1"));
        limiter.prune();
        assert!(!limiter.record_failure("10.0.0.1"));
    }

    #[test]
    fn idle_entries_are_evicted_on_later_failures() {
        let (limiter, clock) = limiter();
        for i in 0..10_000 {
            limiter.record_failure(&format!("10.{}.{}.{}", i / 65536, (i / 256) % 256, i % 256));
        }
        assert!(limiter.tracked_clients() <= MAX_TRACKED_CLIENTS);

        clock.advance(Duration::from_secs(3600));
        limiter.record_failure("192.168.1.1");
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[test]
    fn eviction_keeps_locked_clients() {
        let (limiter, _) = limiter();
        for _ in 0..5 {
            limiter.record_failure("10.0.0.1");
        }
        for i in 0..MAX_TRACKED_CLIENTS + 10 {
            limiter.record_failure(&format!("client-{i}"));
        }
        assert_eq!(limiter.tracked_clients(), MAX_TRACKED_CLIENTS);
        assert!(limiter.is_rate_limited("10.0.0.1"));
    }

    #[test]
    fn failures_outside_window_reset() {
        let (limiter, clock) = limiter();
        for _ in 0..4 {
            limiter.record_failure("10.0.0.1");
        }
        clock.advance(Duration::from_secs(61));
        assert!(!limiter.record_failure("10.0.0.1"));
        assert!(!limiter.is_rate_limited("10.0.0.1"));
    }
}
