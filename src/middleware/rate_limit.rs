//! Per-IP rate limiting for the public read endpoints.
//!
//! In-memory sliding window; collisions across replicas only make the
//! limit slightly lax, never unsafe. Join submissions use the ledger's
//! durable per-IP/per-wallet buckets instead (see `engine::join`).

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 120,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitLayer {
    config: RateLimitConfig,
    state: Arc<Mutex<HashMap<IpAddr, WindowEntry>>>,
}

struct WindowEntry {
    count: u32,
    window_start: Instant,
}

enum Decision {
    Allowed,
    Exceeded { retry_after: Duration },
}

impl RateLimitLayer {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn check(&self, ip: IpAddr) -> Decision {
        let mut state = self.state.lock();
        let now = Instant::now();

        let entry = state.entry(ip).or_insert(WindowEntry {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) >= self.config.window {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count += 1;

        if entry.count > self.config.max_requests {
            let reset_at = entry.window_start + self.config.window;
            Decision::Exceeded {
                retry_after: reset_at.duration_since(now),
            }
        } else {
            Decision::Allowed
        }
    }

    /// Drop windows idle for two periods; call from a background task.
    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        let window = self.config.window;
        state.retain(|_, entry| now.duration_since(entry.window_start) < window * 2);
    }
}

pub async fn rate_limit_middleware(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    axum::extract::State(limiter): axum::extract::State<RateLimitLayer>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ip = addr.ip();

    match limiter.check(ip) {
        Decision::Allowed => next.run(request).await,
        Decision::Exceeded { retry_after } => {
            let retry_after_sec = retry_after.as_secs().max(1);
            warn!(ip = %ip, retry_after_sec, "rate limit exceeded");

            let body = serde_json::json!({
                "error": "rate_limit_exceeded",
                "retryAfterSec": retry_after_sec,
            });
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after_sec.to_string())],
                axum::Json(body),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_under_limit() {
        let limiter = RateLimitLayer::new(RateLimitConfig {
            max_requests: 10,
            window: Duration::from_secs(60),
        });
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        for _ in 0..10 {
            assert!(matches!(limiter.check(ip), Decision::Allowed));
        }
        assert!(matches!(limiter.check(ip), Decision::Exceeded { .. }));
    }

    #[test]
    fn test_limits_are_per_ip() {
        let limiter = RateLimitLayer::new(RateLimitConfig {
            max_requests: 1,
            window: Duration::from_secs(60),
        });
        let a: IpAddr = "127.0.0.1".parse().unwrap();
        let b: IpAddr = "127.0.0.2".parse().unwrap();

        assert!(matches!(limiter.check(a), Decision::Allowed));
        assert!(matches!(limiter.check(a), Decision::Exceeded { .. }));
        assert!(matches!(limiter.check(b), Decision::Allowed));
    }

    #[test]
    fn test_cleanup_retains_active_windows() {
        let limiter = RateLimitLayer::new(RateLimitConfig {
            max_requests: 5,
            window: Duration::from_secs(60),
        });
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        limiter.check(ip);
        limiter.cleanup();
        assert_eq!(limiter.state.lock().len(), 1);
    }
}
