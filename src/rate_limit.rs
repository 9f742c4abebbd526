use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use actix_web::HttpRequest;
use dashmap::DashMap;

/// Accepted hits for one key, kept with the window they were counted against.
#[derive(Debug)]
struct History {
    window: Duration,
    hits: VecDeque<Instant>,
}

impl History {
    fn idle_at(&self, now: Instant) -> bool {
        self.hits.back().map_or(true, |t| now.saturating_duration_since(*t) >= self.window)
    }
}

/// Sliding window in-memory rate limiter (process local, reset on restart).
#[derive(Clone)]
pub struct InMemoryRateLimiter {
    store: Arc<DashMap<String, History>>,
    pub enabled: bool,
    max_tracked: usize,
}

impl InMemoryRateLimiter {
    pub fn new(enabled: bool) -> Self {
        Self::with_capacity(enabled, 10_000)
    }

    /// `max_tracked` bounds the number of keys kept before idle ones are swept.
    pub fn with_capacity(enabled: bool, max_tracked: usize) -> Self {
        Self { store: Arc::new(DashMap::new()), enabled, max_tracked }
    }

    /// Returns true if allowed, false if limited.
    pub fn check(&self, key: &str, limit: usize, window: Duration) -> bool {
        self.check_at(key, limit, window, Instant::now())
    }

    /// Allowed iff fewer than `limit` accepted hits fall inside `(now - window, now]`.
    /// Rejected calls are not recorded.
    pub fn check_at(&self, key: &str, limit: usize, window: Duration, now: Instant) -> bool {
        if !self.enabled { return true; }
        if self.store.len() >= self.max_tracked && !self.store.contains_key(key) {
            self.sweep(now);
        }
        let mut entry = self
            .store
            .entry(key.to_string())
            .or_insert_with(|| History { window, hits: VecDeque::new() });
        entry.window = window;
        while let Some(front) = entry.hits.front() {
            if now.saturating_duration_since(*front) < window {
                break;
            }
            entry.hits.pop_front();
        }
        if entry.hits.len() < limit {
            entry.hits.push_back(now);
            true
        } else {
            false
        }
    }

    /// Drop keys whose newest hit has left that key's own window.
    pub fn sweep(&self, now: Instant) {
        self.store.retain(|_, history| !history.idle_at(now));
    }

    pub fn tracked(&self) -> usize { self.store.len() }
}

/// Per-action limits derived from env.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub anon_limit: usize,
    pub anon_window: Duration,
    pub index_limit: usize,
    pub index_window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            anon_limit: 5,
            anon_window: Duration::from_secs(60),
            index_limit: 10,
            index_window: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        fn usize_env(name: &str, default: usize) -> usize { std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default) }
        fn dur_env(name: &str, default: u64) -> Duration { Duration::from_secs(std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)) }
        Self {
            anon_limit: usize_env("RL_ANON_LIMIT", 5),
            anon_window: dur_env("RL_ANON_WINDOW", 60),
            index_limit: usize_env("RL_INDEX_LIMIT", 10),
            index_window: dur_env("RL_INDEX_WINDOW", 60),
        }
    }
}

/// High level guard used by handlers. Listing is never limited.
#[derive(Clone)]
pub struct RateLimiterFacade {
    pub limiter: InMemoryRateLimiter,
    pub cfg: RateLimitConfig,
}

impl RateLimiterFacade {
    pub fn new(limiter: InMemoryRateLimiter, cfg: RateLimitConfig) -> Self { Self { limiter, cfg } }
    pub fn allow_anonymous(&self, ip: &str) -> bool { self.limiter.check(&format!("anon:{ip}"), self.cfg.anon_limit, self.cfg.anon_window) }
    pub fn allow_index(&self, ip: &str) -> bool { self.limiter.check(&format!("index:{ip}"), self.cfg.index_limit, self.cfg.index_window) }
}

/// Best-effort client identity for abuse control, not authentication.
///
/// With `trust_proxy` the Forwarded / X-Forwarded-For chain wins over the
/// socket address. Those headers are client-controlled unless the edge proxy
/// overwrites them, so a direct caller can spoof its identity.
pub fn client_identity(req: &HttpRequest, trust_proxy: bool) -> String {
    let ip = if trust_proxy {
        req.connection_info().realip_remote_addr().map(str::to_string)
    } else {
        req.peer_addr().map(|a| a.ip().to_string())
    };
    ip.map(|s| strip_port(&s).to_string()).unwrap_or_else(|| "unknown".into())
}

// realip_remote_addr may carry "ip:port" (or "[v6]:port") when it falls back to the peer address
fn strip_port(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn sliding_window_basic() {
        let rl = InMemoryRateLimiter::new(true);
        let window = Duration::from_millis(50);
        for _ in 0..3 { assert!(rl.check("k", 3, window)); }
        assert!(!rl.check("k", 3, window));
    }

    #[test]
    fn window_reopens_after_earliest_expires() {
        let rl = InMemoryRateLimiter::new(true);
        let window = Duration::from_secs(60);
        let t0 = Instant::now();
        for i in 0..5 { assert!(rl.check_at("ip", 5, window, t0 + Duration::from_secs(i))); }
        assert!(!rl.check_at("ip", 5, window, t0 + Duration::from_secs(5)));
        // rejection is not recorded, so only the first hit has to expire
        assert!(rl.check_at("ip", 5, window, t0 + Duration::from_secs(60)));
        assert!(!rl.check_at("ip", 5, window, t0 + Duration::from_secs(60)));
    }

    #[test]
    fn disabled_always_allows() {
        let rl = InMemoryRateLimiter::new(false);
        for _ in 0..100 { assert!(rl.check("k", 1, Duration::from_secs(60))); }
    }

    #[test]
    fn sweep_bounds_tracked_keys() {
        let rl = InMemoryRateLimiter::with_capacity(true, 2);
        let window = Duration::from_secs(10);
        let t0 = Instant::now();
        assert!(rl.check_at("a", 1, window, t0));
        assert!(rl.check_at("b", 1, window, t0));
        assert!(rl.check_at("c", 1, window, t0 + Duration::from_secs(11)));
        assert_eq!(rl.tracked(), 1);
    }

    #[test]
    fn sweep_respects_each_key_window() {
        let rl = InMemoryRateLimiter::with_capacity(true, 2);
        let (long, short) = (Duration::from_secs(100), Duration::from_secs(10));
        let t0 = Instant::now();
        assert!(rl.check_at("anon:a", 1, long, t0));
        assert!(rl.check_at("index:b", 1, short, t0));
        // sweep triggered by a short-window key must keep the long-window history
        assert!(rl.check_at("index:c", 1, short, t0 + Duration::from_secs(20)));
        assert!(!rl.check_at("anon:a", 1, long, t0 + Duration::from_secs(21)));
        assert!(rl.check_at("anon:a", 1, long, t0 + Duration::from_secs(100)));
    }

    #[test]
    fn identity_prefers_forwarded_header_when_trusted() {
        let req = TestRequest::default()
            .insert_header(("X-Forwarded-For", "203.0.113.9, 10.0.0.1"))
            .peer_addr("10.0.0.1:4000".parse().unwrap())
            .to_http_request();
        assert_eq!(client_identity(&req, true), "203.0.113.9");
        assert_eq!(client_identity(&req, false), "10.0.0.1");
    }

    #[test]
    fn strip_port_variants() {
        assert_eq!(strip_port("1.2.3.4:80"), "1.2.3.4");
        assert_eq!(strip_port("1.2.3.4"), "1.2.3.4");
        assert_eq!(strip_port("[::1]:80"), "::1");
        assert_eq!(strip_port("::1"), "::1");
    }
}
