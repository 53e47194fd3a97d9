//! Multi-scope sliding window rate limiting.
//!
//! Each distinct key owns an independent window of request timestamps.
//! Admission prunes timestamps older than `now - window`, then admits and
//! records only while the pruned count is below the configured maximum,
//! so exactly `max` requests are admitted per trailing window. Rejected
//! requests are dropped, never queued.
//!
//! Four scopes are composed as sequential gates: global, per-client-IP,
//! per-user (falling back to an anonymous-plus-IP key), and per-endpoint.
//! Each scope is independently enabled and configured.

use crate::config::{LimitRule, RateLimitSettings};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// A sliding window limiter over string keys.
///
/// Prune-and-record is atomic per key: no two concurrent calls for the
/// same key can both be admitted when only one slot remains. Keys whose
/// recorded timestamps have all aged out are evicted wholesale during
/// admission, so the key map stays bounded by the set of callers active
/// within one window.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    windows: DashMap<String, Vec<Instant>>,
    limit: usize,
    window: Duration,
    last_cleanup: Mutex<Instant>,
}

impl SlidingWindowLimiter {
    /// Creates a limiter admitting at most `limit` requests per `window`.
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            limit,
            window,
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    /// Creates a limiter from a configured rule.
    pub fn from_rule(rule: &LimitRule) -> Self {
        Self::new(rule.requests, rule.window())
    }

    /// Checks and records an admission for `key`.
    ///
    /// Returns `false` without recording when the window is full.
    pub fn allow(&self, key: &str) -> bool {
        self.maybe_cleanup();

        let now = Instant::now();
        let mut entry = self.windows.entry(key.to_string()).or_default();

        entry.retain(|t| now.duration_since(*t) < self.window);

        if entry.len() >= self.limit {
            return false;
        }

        entry.push(now);
        true
    }

    /// Drops keys with no timestamps left inside the window, at most once
    /// per window length. Runs before any per-key entry is held.
    fn maybe_cleanup(&self) {
        let now = Instant::now();
        {
            let mut last_cleanup = self.last_cleanup.lock();
            if now.duration_since(*last_cleanup) < self.window {
                return;
            }
            *last_cleanup = now;
        }

        self.windows
            .retain(|_, timestamps| timestamps.iter().any(|t| now.duration_since(*t) < self.window));
    }

    /// Clears a single key's history immediately.
    pub fn reset(&self, key: &str) {
        self.windows.remove(key);
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// Configured maximum per window.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Configured window length.
    pub fn window(&self) -> Duration {
        self.window
    }
}

/// The scope whose gate rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    Global,
    PerIp,
    PerUser,
    PerApi,
}

impl fmt::Display for LimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LimitScope::Global => "global",
            LimitScope::PerIp => "ip",
            LimitScope::PerUser => "user",
            LimitScope::PerApi => "api",
        };
        f.write_str(name)
    }
}

/// Information about a rate limit rejection.
#[derive(Debug, Clone)]
pub struct RateLimitRejection {
    /// Scope whose gate rejected the request.
    pub scope: LimitScope,
    /// Configured maximum for that scope.
    pub limit: usize,
    /// Window length for that scope.
    pub window: Duration,
    /// Path of the offending request.
    pub path: String,
}

impl RateLimitRejection {
    /// Suggested `Retry-After` value in whole seconds, at least 1.
    pub fn retry_after_secs(&self) -> u64 {
        self.window.as_secs().max(1)
    }
}

/// Request attributes consulted during admission.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionContext<'a> {
    /// Client IP, when known.
    pub client_ip: Option<IpAddr>,
    /// Authenticated user id, when an identity is attached.
    pub user_id: Option<&'a str>,
    /// HTTP method of the request.
    pub method: &'a str,
    /// Request path.
    pub path: &'a str,
}

/// Composes the four scope gates in sequence.
pub struct GatewayRateLimiter {
    enabled: bool,
    global: Option<SlidingWindowLimiter>,
    per_ip: Option<SlidingWindowLimiter>,
    per_user: Option<SlidingWindowLimiter>,
    api_rules: HashMap<String, LimitRule>,
    api_limiters: DashMap<String, Arc<SlidingWindowLimiter>>,
}

impl GatewayRateLimiter {
    /// Builds the limiter from configured settings.
    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        Self {
            enabled: settings.enabled,
            global: settings.global.as_ref().map(SlidingWindowLimiter::from_rule),
            per_ip: settings.per_ip.as_ref().map(SlidingWindowLimiter::from_rule),
            per_user: settings
                .per_user
                .as_ref()
                .map(SlidingWindowLimiter::from_rule),
            api_rules: settings.api.clone(),
            api_limiters: DashMap::new(),
        }
    }

    /// Creates a disabled limiter that admits everything.
    pub fn disabled() -> Self {
        Self::from_settings(&RateLimitSettings::default())
    }

    /// Runs all enabled gates in order: global, IP, user, endpoint.
    ///
    /// Rejection carries the offending scope and path and logs a warning;
    /// it has no other side effect.
    pub fn check(&self, ctx: &AdmissionContext<'_>) -> Result<(), RateLimitRejection> {
        if !self.enabled {
            return Ok(());
        }

        if let Some(global) = &self.global {
            if !global.allow("global") {
                return Err(self.reject(LimitScope::Global, global, ctx));
            }
        }

        if let Some(per_ip) = &self.per_ip {
            let key = match ctx.client_ip {
                Some(ip) => format!("ip:{}", ip),
                None => "ip:unknown".to_string(),
            };
            if !per_ip.allow(&key) {
                return Err(self.reject(LimitScope::PerIp, per_ip, ctx));
            }
        }

        if let Some(per_user) = &self.per_user {
            let key = match ctx.user_id {
                Some(user) => format!("user:{}", user),
                None => match ctx.client_ip {
                    Some(ip) => format!("user:anonymous:{}", ip),
                    None => "user:anonymous".to_string(),
                },
            };
            if !per_user.allow(&key) {
                return Err(self.reject(LimitScope::PerUser, per_user, ctx));
            }
        }

        if let Some(rule) = self.api_rules.get(ctx.path) {
            let limiter_key = format!("api:{}:{}", ctx.method, ctx.path);
            let limiter = self
                .api_limiters
                .entry(limiter_key.clone())
                .or_insert_with(|| Arc::new(SlidingWindowLimiter::from_rule(rule)))
                .clone();

            let key = match ctx.user_id {
                Some(user) => format!("{}:user:{}", limiter_key, user),
                None => match ctx.client_ip {
                    Some(ip) => format!("{}:ip:{}", limiter_key, ip),
                    None => format!("{}:ip:unknown", limiter_key),
                },
            };
            if !limiter.allow(&key) {
                return Err(self.reject(LimitScope::PerApi, &limiter, ctx));
            }
        }

        Ok(())
    }

    fn reject(
        &self,
        scope: LimitScope,
        limiter: &SlidingWindowLimiter,
        ctx: &AdmissionContext<'_>,
    ) -> RateLimitRejection {
        warn!(
            scope = %scope,
            method = %ctx.method,
            path = %ctx.path,
            ip = ?ctx.client_ip,
            user = ?ctx.user_id,
            "rate limit exceeded"
        );
        RateLimitRejection {
            scope,
            limit: limiter.limit(),
            window: limiter.window(),
            path: ctx.path.to_string(),
        }
    }

    /// Clears one key's history across every scope, for administrative
    /// override.
    pub fn reset(&self, key: &str) {
        if let Some(global) = &self.global {
            global.reset(key);
        }
        if let Some(per_ip) = &self.per_ip {
            per_ip.reset(key);
        }
        if let Some(per_user) = &self.per_user {
            per_user.reset(key);
        }
        for limiter in self.api_limiters.iter() {
            limiter.reset(key);
        }
    }

    /// Returns current limiter statistics.
    pub fn stats(&self) -> RateLimitStats {
        RateLimitStats {
            enabled: self.enabled,
            global: self.global.as_ref().map(ScopeStats::from_limiter),
            per_ip: self.per_ip.as_ref().map(ScopeStats::from_limiter),
            per_user: self.per_user.as_ref().map(ScopeStats::from_limiter),
            api_rules: self.api_rules.len(),
            api_tracked_keys: self
                .api_limiters
                .iter()
                .map(|l| l.tracked_keys())
                .sum(),
        }
    }
}

/// Per-scope statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeStats {
    pub limit: usize,
    pub window_ms: u64,
    pub tracked_keys: usize,
}

impl ScopeStats {
    fn from_limiter(limiter: &SlidingWindowLimiter) -> Self {
        Self {
            limit: limiter.limit(),
            window_ms: limiter.window().as_millis() as u64,
            tracked_keys: limiter.tracked_keys(),
        }
    }
}

/// Rate limiter statistics for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStats {
    pub enabled: bool,
    pub global: Option<ScopeStats>,
    pub per_ip: Option<ScopeStats>,
    pub per_user: Option<ScopeStats>,
    pub api_rules: usize,
    pub api_tracked_keys: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx<'a>(ip: Option<IpAddr>, user: Option<&'a str>, path: &'a str) -> AdmissionContext<'a> {
        AdmissionContext {
            client_ip: ip,
            user_id: user,
            method: "GET",
            path,
        }
    }

    fn settings(global: Option<LimitRule>) -> RateLimitSettings {
        RateLimitSettings {
            enabled: true,
            global,
            per_ip: None,
            per_user: None,
            api: HashMap::new(),
        }
    }

    #[test]
    fn test_window_boundary() {
        let limiter = SlidingWindowLimiter::new(3, Duration::from_secs(60));

        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
        assert!(!limiter.allow("k"));
    }

    #[test]
    fn test_window_expiry_readmits() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_millis(50));

        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));

        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter.allow("k"));
    }

    #[test]
    fn test_rejection_does_not_record() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_millis(50));

        assert!(limiter.allow("k"));
        // Repeated rejections must not extend the window.
        for _ in 0..5 {
            assert!(!limiter.allow("k"));
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter.allow("k"));
    }

    #[test]
    fn test_stale_keys_are_evicted() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_millis(50));

        for i in 0..10 {
            assert!(limiter.allow(&format!("k{}", i)));
        }
        assert_eq!(limiter.tracked_keys(), 10);

        std::thread::sleep(Duration::from_millis(60));
        // The next admission sweeps out keys whose timestamps all aged out.
        assert!(limiter.allow("fresh"));
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(60));

        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        assert!(limiter.allow("b"));
    }

    #[test]
    fn test_reset_clears_history() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(60));

        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
        limiter.reset("k");
        assert!(limiter.allow("k"));
    }

    #[test]
    fn test_concurrent_admissions_respect_limit() {
        let limiter = Arc::new(SlidingWindowLimiter::new(50, Duration::from_secs(60)));
        let admitted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let admitted = Arc::clone(&admitted);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        if limiter.allow("shared") {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_disabled_limiter_admits_everything() {
        let limiter = GatewayRateLimiter::disabled();
        for _ in 0..1000 {
            assert!(limiter.check(&ctx(None, None, "/x")).is_ok());
        }
    }

    #[test]
    fn test_global_gate() {
        let limiter = GatewayRateLimiter::from_settings(&settings(Some(LimitRule {
            requests: 2,
            window_ms: 60000,
        })));

        assert!(limiter.check(&ctx(None, None, "/x")).is_ok());
        assert!(limiter.check(&ctx(None, None, "/x")).is_ok());
        let rejection = limiter.check(&ctx(None, None, "/x")).unwrap_err();
        assert_eq!(rejection.scope, LimitScope::Global);
        assert_eq!(rejection.path, "/x");
    }

    #[test]
    fn test_per_ip_gate_is_independent_per_client() {
        let mut s = settings(None);
        s.per_ip = Some(LimitRule {
            requests: 1,
            window_ms: 60000,
        });
        let limiter = GatewayRateLimiter::from_settings(&s);

        let ip1 = Some(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)));
        let ip2 = Some(IpAddr::V4(Ipv4Addr::new(5, 6, 7, 8)));

        assert!(limiter.check(&ctx(ip1, None, "/x")).is_ok());
        let rejection = limiter.check(&ctx(ip1, None, "/x")).unwrap_err();
        assert_eq!(rejection.scope, LimitScope::PerIp);
        assert!(limiter.check(&ctx(ip2, None, "/x")).is_ok());
    }

    #[test]
    fn test_per_user_gate_falls_back_to_anonymous_ip() {
        let mut s = settings(None);
        s.per_user = Some(LimitRule {
            requests: 1,
            window_ms: 60000,
        });
        let limiter = GatewayRateLimiter::from_settings(&s);

        let ip = Some(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)));

        assert!(limiter.check(&ctx(ip, Some("42"), "/x")).is_ok());
        assert!(limiter.check(&ctx(ip, None, "/x")).is_ok());
        // Same anonymous ip key again.
        let rejection = limiter.check(&ctx(ip, None, "/x")).unwrap_err();
        assert_eq!(rejection.scope, LimitScope::PerUser);
        // The authenticated key is unaffected by anonymous traffic.
        let rejection = limiter.check(&ctx(ip, Some("42"), "/x")).unwrap_err();
        assert_eq!(rejection.scope, LimitScope::PerUser);
    }

    #[test]
    fn test_api_gate_keyed_by_path_and_caller() {
        let mut s = settings(None);
        s.api.insert(
            "/orders".to_string(),
            LimitRule {
                requests: 1,
                window_ms: 60000,
            },
        );
        let limiter = GatewayRateLimiter::from_settings(&s);

        assert!(limiter.check(&ctx(None, Some("a"), "/orders")).is_ok());
        let rejection = limiter.check(&ctx(None, Some("a"), "/orders")).unwrap_err();
        assert_eq!(rejection.scope, LimitScope::PerApi);
        assert_eq!(rejection.path, "/orders");

        // Different caller, unconfigured path: both admitted.
        assert!(limiter.check(&ctx(None, Some("b"), "/orders")).is_ok());
        assert!(limiter.check(&ctx(None, Some("a"), "/other")).is_ok());
    }

    #[test]
    fn test_reset_makes_next_allow_succeed() {
        let limiter = GatewayRateLimiter::from_settings(&settings(Some(LimitRule {
            requests: 1,
            window_ms: 60000,
        })));

        assert!(limiter.check(&ctx(None, None, "/x")).is_ok());
        assert!(limiter.check(&ctx(None, None, "/x")).is_err());
        limiter.reset("global");
        assert!(limiter.check(&ctx(None, None, "/x")).is_ok());
    }

    #[test]
    fn test_stats() {
        let limiter = GatewayRateLimiter::from_settings(&settings(Some(LimitRule {
            requests: 5,
            window_ms: 1000,
        })));
        let _ = limiter.check(&ctx(None, None, "/x"));

        let stats = limiter.stats();
        assert!(stats.enabled);
        let global = stats.global.unwrap();
        assert_eq!(global.limit, 5);
        assert_eq!(global.window_ms, 1000);
        assert_eq!(global.tracked_keys, 1);
    }

    #[test]
    fn test_rejection_retry_after() {
        let rejection = RateLimitRejection {
            scope: LimitScope::Global,
            limit: 1,
            window: Duration::from_millis(500),
            path: "/x".to_string(),
        };
        assert_eq!(rejection.retry_after_secs(), 1);
    }
}
