use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ApiError;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Sustained requests per second per client.
    pub rps: f64,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rps: 2.0,
            burst: 4,
        }
    }
}

/// Remaining allowance of one client. Refills continuously at `rps`, capped
/// at `burst`.
#[derive(Debug, Clone, Copy)]
struct ClientBucket {
    allowance: f64,
    last_seen: Instant,
}

impl ClientBucket {
    fn full(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            allowance: f64::from(config.burst),
            last_seen: now,
        }
    }

    fn admit(&mut self, config: &RateLimitConfig, now: Instant) -> bool {
        let refill = self.idle_for(now).as_secs_f64() * config.rps;
        self.allowance = (self.allowance + refill).min(f64::from(config.burst));
        self.last_seen = now;

        if self.allowance < 1.0 {
            return false;
        }
        self.allowance -= 1.0;
        true
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }
}

/// Per-client token buckets keyed by IP. Constructed once at startup and
/// shared by clone.
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<IpAddr, ClientBucket>>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    pub fn disabled() -> Self {
        Self::new(RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub async fn check(&self, ip: IpAddr) -> bool {
        if !self.config.enabled {
            return true;
        }

        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        buckets
            .entry(ip)
            .or_insert_with(|| ClientBucket::full(&self.config, now))
            .admit(&self.config, now)
    }

    /// Forget clients not seen for `max_idle`. Returns how many were dropped.
    pub async fn purge_stale(&self, max_idle: Duration) -> usize {
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        let now = Instant::now();
        buckets.retain(|_, bucket| bucket.idle_for(now) < max_idle);
        before - buckets.len()
    }
}

/// Sweep idle clients every `interval` until `shutdown` fires.
pub async fn run_sweep(
    limiter: RateLimiter,
    interval: Duration,
    max_idle: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let purged = limiter.purge_stale(max_idle).await;
                if purged > 0 {
                    debug!("Rate limiter: dropped {} idle clients", purged);
                }
            }
        }
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if limiter.is_enabled() {
        if let Some(ip) = extract_client_ip(&req) {
            if !limiter.check(ip).await {
                warn!(ip = %ip, "Rate limit exceeded");
                return Err(ApiError::RateLimited);
            }
        }
    }

    Ok(next.run(req).await)
}

/// Try ConnectInfo first, then X-Forwarded-For, then X-Real-IP.
fn extract_client_ip<B>(req: &axum::http::Request<B>) -> Option<IpAddr> {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<std::net::SocketAddr>>() {
        return Some(connect_info.0.ip());
    }

    if let Some(forwarded) = req.headers().get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(first) = value.split(',').next() {
                if let Ok(ip) = first.trim().parse::<IpAddr>() {
                    return Some(ip);
                }
            }
        }
    }

    if let Some(real_ip) = req.headers().get("x-real-ip") {
        if let Ok(value) = real_ip.to_str() {
            if let Ok(ip) = value.trim().parse::<IpAddr>() {
                return Some(ip);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rps: f64, burst: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            enabled: true,
            rps,
            burst,
        })
    }

    #[test]
    fn bucket_refills_with_time_up_to_burst() {
        let config = RateLimitConfig {
            enabled: true,
            rps: 2.0,
            burst: 2,
        };
        let start = Instant::now();
        let mut bucket = ClientBucket::full(&config, start);

        assert!(bucket.admit(&config, start));
        assert!(bucket.admit(&config, start));
        assert!(!bucket.admit(&config, start));

        // Half a second at 2 rps buys one request.
        let later = start + Duration::from_millis(500);
        assert!(bucket.admit(&config, later));
        assert!(!bucket.admit(&config, later));

        // A long pause refills only to the burst size.
        let much_later = later + Duration::from_secs(60);
        assert!(bucket.admit(&config, much_later));
        assert!(bucket.admit(&config, much_later));
        assert!(!bucket.admit(&config, much_later));
    }

    #[tokio::test]
    async fn allows_burst_then_refuses() {
        let limiter = limiter(0.001, 5);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        for _ in 0..5 {
            assert!(limiter.check(ip).await);
        }
        assert!(!limiter.check(ip).await);
    }

    #[tokio::test]
    async fn clients_have_separate_buckets() {
        let limiter = limiter(0.001, 2);
        let ip1: IpAddr = "10.0.0.1".parse().unwrap();
        let ip2: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(limiter.check(ip1).await);
        assert!(limiter.check(ip1).await);
        assert!(!limiter.check(ip1).await);

        assert!(limiter.check(ip2).await);
    }

    #[tokio::test]
    async fn disabled_limiter_never_refuses() {
        let limiter = RateLimiter::disabled();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        for _ in 0..100 {
            assert!(limiter.check(ip).await);
        }
    }

    #[tokio::test]
    async fn purge_drops_idle_clients() {
        let limiter = limiter(10.0, 5);
        let ip: IpAddr = "192.168.1.1".parse().unwrap();
        assert!(limiter.check(ip).await);

        assert_eq!(limiter.purge_stale(Duration::from_secs(60)).await, 0);
        assert_eq!(limiter.purge_stale(Duration::ZERO).await, 1);
        assert!(limiter.buckets.lock().await.is_empty());
    }

    #[tokio::test]
    async fn sweep_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let sweep = tokio::spawn(run_sweep(
            limiter(1.0, 1),
            Duration::from_millis(10),
            Duration::from_secs(60),
            shutdown.clone(),
        ));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), sweep)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn forwarded_for_uses_first_hop() {
        let req = axum::http::Request::builder()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(())
            .unwrap();
        assert_eq!(extract_client_ip(&req), Some("203.0.113.7".parse().unwrap()));
    }
}
