use std::collections::HashMap;
use std::hash::Hash;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::ConnectInfo,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tokio::sync::Mutex;
use tracing::warn;

/// Refills continuously at `rate` tokens per second, up to `burst`.
#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    touched: Instant,
}

impl Bucket {
    fn full(burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            touched: now,
        }
    }

    fn take(&mut self, now: Instant, rate: f64, burst: f64) -> bool {
        let idle = now.saturating_duration_since(self.touched).as_secs_f64();
        self.touched = now;
        self.tokens = (self.tokens + idle * rate).min(burst);

        let allowed = self.tokens >= 1.0;
        if allowed {
            self.tokens -= 1.0;
        }
        allowed
    }
}

/// Token-bucket limiter shared by two front doors: REST requests are keyed by
/// client IP, socket events by the user bound to the connection, so every tab
/// of one user draws from the same budget.
#[derive(Clone)]
pub struct RateLimiter<K> {
    buckets: Arc<Mutex<HashMap<K, Bucket>>>,
    rate: f64,
    burst: f64,
}

impl<K: Eq + Hash> RateLimiter<K> {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            rate,
            burst,
        }
    }

    /// Spend one token for `key`. A key seen for the first time starts full.
    pub async fn check(&self, key: K) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        buckets
            .entry(key)
            .or_insert_with(|| Bucket::full(self.burst, now))
            .take(now, self.rate, self.burst)
    }

    /// Forget keys idle for at least `max_idle_secs` and return how many are
    /// still tracked. A forgotten key comes back with a full bucket, which is
    /// what it would have refilled to anyway.
    pub async fn purge_stale(&self, max_idle_secs: f64) -> usize {
        let cutoff = Duration::from_secs_f64(max_idle_secs.max(0.0));
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.touched) < cutoff);
        buckets.len()
    }
}

impl<K: Eq + Hash> Default for RateLimiter<K> {
    fn default() -> Self {
        Self::new(10.0, 30.0)
    }
}

pub async fn rate_limit_middleware(
    axum::extract::State(limiter): axum::extract::State<RateLimiter<IpAddr>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(ip) = extract_client_ip(&req) {
        if !limiter.check(ip).await {
            warn!(ip = %ip, "Rate limit exceeded");
            return Err(StatusCode::TOO_MANY_REQUESTS);
        }
    }

    Ok(next.run(req).await)
}

/// Try ConnectInfo first, then X-Forwarded-For, then X-Real-IP.
fn extract_client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<std::net::SocketAddr>>() {
        return Some(connect_info.0.ip());
    }

    let header_ip = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    };

    header_ip("x-forwarded-for").or_else(|| header_ip("x-real-ip"))
}

#[cfg(test)]
mod tests {
    use society_chat_shared::UserId;

    use super::*;

    #[tokio::test]
    async fn test_rate_limiter_allows_burst() {
        let limiter = RateLimiter::new(10.0, 5.0);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        for _ in 0..5 {
            assert!(limiter.check(ip).await);
        }

        assert!(!limiter.check(ip).await);
    }

    #[tokio::test]
    async fn test_rate_limiter_keys_by_user() {
        let limiter: RateLimiter<UserId> = RateLimiter::new(0.001, 2.0);

        assert!(limiter.check("u1".into()).await);
        assert!(limiter.check("u1".into()).await);
        assert!(!limiter.check("u1".into()).await);

        assert!(limiter.check("u2".into()).await);
    }

    #[tokio::test]
    async fn test_purge_stale() {
        let limiter = RateLimiter::new(10.0, 5.0);
        let ip: IpAddr = "192.168.1.1".parse().unwrap();
        assert!(limiter.check(ip).await);

        assert_eq!(limiter.purge_stale(600.0).await, 1);
        assert_eq!(limiter.purge_stale(0.0).await, 0);
    }

    #[test]
    fn test_forwarded_header_ip() {
        let req = Request::builder()
            .header("x-forwarded-for", "10.1.2.3, 172.16.0.1")
            .body(())
            .unwrap();
        assert_eq!(extract_client_ip(&req), Some("10.1.2.3".parse().unwrap()));
    }
}
