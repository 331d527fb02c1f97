//! Process-wide shared state handed to every axum handler.
//!
//! One `AppState` is built at startup and cloned into each request —
//! cheap, since the clone is just an `Arc` bump and every field that needs
//! mutation is itself an `Arc<RateLimiter>`/`Arc<Registry>`/atomic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::ratelimit::{spawn_eviction_task, RateLimiter};
use crate::registry::Registry;

// ─── Rate limit tuning ───────────────────────────────────────────
// Three independent limiters, one per route class, each keyed by client IP
// (`connect`/`stats`) or by agent address (`request`) — see router.rs.
const CONNECT_LIMIT: u32 = 5;
const CONNECT_WINDOW: Duration = Duration::from_secs(60);
const REQUEST_LIMIT: u32 = 100;
const REQUEST_WINDOW: Duration = Duration::from_secs(60);
const STATS_LIMIT: u32 = 10;
const STATS_WINDOW: Duration = Duration::from_secs(60);
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState(Arc<Inner>);

struct Inner {
    /// The address → tunnel routing table shared by the router and every
    /// tunnel's actor task.
    registry: Arc<Registry>,
    connect_limiter: Arc<RateLimiter>,
    request_limiter: Arc<RateLimiter>,
    stats_limiter: Arc<RateLimiter>,
    /// Domain suffix agent subdomains are matched against (e.g.
    /// `agent.osaurus.ai`); an `Arc<str>` since it's read on every request
    /// but never mutated after startup.
    base_domain: Arc<str>,
    started_at: Instant,
    total_requests_relayed: AtomicU64,
    total_tunnel_connections: AtomicU64,
}

impl AppState {
    /// Builds the shared state and spawns one eviction task per limiter.
    /// Those tasks run for the life of the process; nothing ever joins them.
    pub fn new(base_domain: String) -> Self {
        let connect_limiter = Arc::new(RateLimiter::new("tunnel-connect", CONNECT_LIMIT, CONNECT_WINDOW));
        let request_limiter = Arc::new(RateLimiter::new("request", REQUEST_LIMIT, REQUEST_WINDOW));
        let stats_limiter = Arc::new(RateLimiter::new("stats", STATS_LIMIT, STATS_WINDOW));

        spawn_eviction_task(connect_limiter.clone(), EVICTION_INTERVAL);
        spawn_eviction_task(request_limiter.clone(), EVICTION_INTERVAL);
        spawn_eviction_task(stats_limiter.clone(), EVICTION_INTERVAL);

        Self(Arc::new(Inner {
            registry: Arc::new(Registry::new()),
            connect_limiter,
            request_limiter,
            stats_limiter,
            base_domain: Arc::from(base_domain.as_str()),
            started_at: Instant::now(),
            total_requests_relayed: AtomicU64::new(0),
            total_tunnel_connections: AtomicU64::new(0),
        }))
    }

    pub fn registry(&self) -> &Registry {
        &self.0.registry
    }

    /// Clones the registry handle for a tunnel's actor task, which outlives
    /// the request that spawned it.
    pub fn registry_arc(&self) -> Arc<Registry> {
        self.0.registry.clone()
    }

    pub fn base_domain(&self) -> &Arc<str> {
        &self.0.base_domain
    }

    pub fn connect_limiter(&self) -> &RateLimiter {
        &self.0.connect_limiter
    }

    pub fn request_limiter(&self) -> &RateLimiter {
        &self.0.request_limiter
    }

    pub fn stats_limiter(&self) -> &RateLimiter {
        &self.0.stats_limiter
    }

    pub fn record_tunnel_connection(&self) {
        self.0.total_tunnel_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_relayed(&self) {
        self.0.total_requests_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.0.started_at.elapsed().as_secs()
    }

    pub fn total_requests_relayed(&self) -> u64 {
        self.0.total_requests_relayed.load(Ordering::Relaxed)
    }

    pub fn total_tunnel_connections(&self) -> u64 {
        self.0.total_tunnel_connections.load(Ordering::Relaxed)
    }
}
