use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RateLimitConfig;
use crate::tasks;
use super::AdmissionControl;

/// Admitted request instants for one client, oldest first
#[derive(Debug, Default)]
struct RateWindow {
    hits: VecDeque<Instant>,
}

impl RateWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.hits.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    fn admit(&mut self, now: Instant, limit: usize, window: Duration) -> bool {
        self.prune(now, window);

        if self.hits.len() < limit {
            self.hits.push_back(now);
            true
        } else {
            false
        }
    }

    fn count(&self, now: Instant, window: Duration) -> usize {
        self.hits
            .iter()
            .filter(|hit| now.saturating_duration_since(**hit) < window)
            .count()
    }

    fn last_seen(&self) -> Option<Instant> {
        self.hits.back().copied()
    }
}

/// Per-client sliding-window log rate limiter.
///
/// Each client identity owns an ordered log of admitted instants. A request is
/// admitted while fewer than `limit` instants fall inside the trailing
/// `window`. Registry shards are locked for the duration of a single
/// admission, which serializes concurrent calls for the same client.
pub struct RateLimiter {
    clients: Arc<DashMap<String, RateWindow>>,
    limit: usize,
    window: Duration,
    reap_after: Duration,
    statistics: Arc<RateLimiterStatistics>,
    shutdown: CancellationToken,
}

#[derive(Debug, Default)]
struct RateLimiterStatistics {
    requests: AtomicU64,
    blocked: AtomicU64,
    reaped: AtomicU64,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration, reap_after: Duration) -> Self {
        info!(
            limit,
            window_secs = window.as_secs(),
            reap_after_secs = reap_after.as_secs(),
            "Per-client rate limiter configured"
        );

        Self {
            clients: Arc::new(DashMap::new()),
            limit,
            window,
            reap_after,
            statistics: Arc::new(RateLimiterStatistics::default()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.requests_per_minute as usize, config.window, config.reap_after)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub(crate) fn allow_at(&self, client: &str, now: Instant) -> bool {
        self.statistics.requests.fetch_add(1, Ordering::Relaxed);

        // Get-or-create and admit under the same shard guard
        let mut window = self.clients.entry(client.to_string()).or_default();

        if window.admit(now, self.limit, self.window) {
            debug!("Rate limit check passed for {}", client);
            true
        } else {
            drop(window);
            self.statistics.blocked.fetch_add(1, Ordering::Relaxed);
            debug!("Rate limit check failed for {}", client);
            false
        }
    }

    pub(crate) fn current_count_at(&self, client: &str, now: Instant) -> usize {
        self.clients
            .get(client)
            .map(|window| window.count(now, self.window))
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn reap_at(&self, now: Instant) -> usize {
        reap_inactive(&self.clients, now, self.reap_after)
    }

    /// Number of client windows currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }

    /// Start the periodic reaper. Runs until [`RateLimiter::shutdown`] is called.
    pub fn start_reaper(&self, every: Duration) -> JoinHandle<()> {
        let clients = self.clients.clone();
        let statistics = self.statistics.clone();
        let reap_after = self.reap_after;

        info!("Rate limiter reaper scheduled every {:?}", every);
        tasks::spawn_periodic("rate-limit-reap", every, self.shutdown.clone(), move || {
            let removed = reap_inactive(&clients, Instant::now(), reap_after);
            statistics.reaped.fetch_add(removed as u64, Ordering::Relaxed);
            metrics::gauge!("gateway_rate_limit_clients").set(clients.len() as f64);
        })
    }

    /// Stop the background reaper.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn statistics(&self) -> serde_json::Value {
        let requests = self.statistics.requests.load(Ordering::Relaxed);
        let blocked = self.statistics.blocked.load(Ordering::Relaxed);

        serde_json::json!({
            "limit": self.limit,
            "window_seconds": self.window.as_secs(),
            "requests": requests,
            "blocked": blocked,
            "block_rate": if requests > 0 { blocked as f64 / requests as f64 } else { 0.0 },
            "tracked_clients": self.clients.len(),
            "reaped_clients": self.statistics.reaped.load(Ordering::Relaxed),
        })
    }
}

impl AdmissionControl for RateLimiter {
    fn allow(&self, client: &str) -> bool {
        self.allow_at(client, Instant::now())
    }

    fn current_count(&self, client: &str) -> usize {
        self.current_count_at(client, Instant::now())
    }
}

fn reap_inactive(clients: &DashMap<String, RateWindow>, now: Instant, reap_after: Duration) -> usize {
    let before = clients.len();
    clients.retain(|_, window| match window.last_seen() {
        Some(last) => now.saturating_duration_since(last) < reap_after,
        None => false,
    });
    let removed = before.saturating_sub(clients.len());

    if removed > 0 {
        debug!(
            removed,
            remaining = clients.len(),
            "Cleaned up inactive rate limiter entries"
        );
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MINUTE: Duration = Duration::from_secs(60);

    fn limiter(limit: usize) -> RateLimiter {
        RateLimiter::new(limit, MINUTE, Duration::from_secs(600))
    }

    #[derive(Clone, Default)]
    struct CapturedLog(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_denial_is_not_logged_as_warning() {
        let limiter = limiter(1);
        let now = Instant::now();
        let captured = CapturedLog::default();

        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            assert!(limiter.allow_at("1.2.3.4", now));
            assert!(!limiter.allow_at("1.2.3.4", now));
        });

        // The gateway reports denials, the limiter stays quiet above debug
        assert!(captured.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_admits_up_to_limit_then_denies() {
        let limiter = limiter(3);
        let now = Instant::now();

        assert!(limiter.allow_at("1.2.3.4", now));
        assert!(limiter.allow_at("1.2.3.4", now + Duration::from_millis(300)));
        assert!(limiter.allow_at("1.2.3.4", now + Duration::from_millis(600)));
        assert!(!limiter.allow_at("1.2.3.4", now + Duration::from_millis(900)));

        // Other clients are independent
        assert!(limiter.allow_at("5.6.7.8", now + Duration::from_millis(900)));
    }

    #[test]
    fn test_window_slides_instead_of_resetting() {
        let limiter = limiter(2);
        let start = Instant::now();

        assert!(limiter.allow_at("c", start));
        assert!(limiter.allow_at("c", start + Duration::from_secs(30)));
        assert!(!limiter.allow_at("c", start + Duration::from_secs(59)));

        // The first hit leaves the window exactly at start + 60s, the second one stays
        assert!(limiter.allow_at("c", start + Duration::from_secs(60)));
        assert!(!limiter.allow_at("c", start + Duration::from_secs(61)));
        assert!(limiter.allow_at("c", start + Duration::from_secs(90)));
    }

    #[test]
    fn test_denied_requests_do_not_consume_capacity() {
        let limiter = limiter(1);
        let start = Instant::now();

        assert!(limiter.allow_at("c", start));
        for i in 1..10 {
            assert!(!limiter.allow_at("c", start + Duration::from_secs(i)));
        }
        assert!(limiter.allow_at("c", start + MINUTE));
    }

    #[test]
    fn test_current_count_is_read_only() {
        let limiter = limiter(5);
        let start = Instant::now();

        assert_eq!(limiter.current_count_at("c", start), 0);
        assert_eq!(limiter.tracked_clients(), 0);

        limiter.allow_at("c", start);
        limiter.allow_at("c", start + Duration::from_secs(10));

        assert_eq!(limiter.current_count_at("c", start + Duration::from_secs(20)), 2);
        assert_eq!(limiter.current_count_at("c", start + Duration::from_secs(65)), 1);
        assert_eq!(limiter.current_count_at("c", start + Duration::from_secs(20)), 2);
    }

    #[test]
    fn test_reap_removes_only_inactive_clients() {
        let limiter = limiter(5);
        let start = Instant::now();

        limiter.allow_at("idle", start);
        limiter.allow_at("busy", start);
        limiter.allow_at("busy", start + Duration::from_secs(400));

        let removed = limiter.reap_at(start + Duration::from_secs(601));
        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked_clients(), 1);
        assert_eq!(limiter.current_count_at("idle", start + Duration::from_secs(601)), 0);

        // A reaped client starts over with a fresh window
        assert!(limiter.allow_at("idle", start + Duration::from_secs(602)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_task_runs_and_stops() {
        let limiter = RateLimiter::new(5, MINUTE, Duration::from_secs(600));
        let handle = limiter.start_reaper(Duration::from_secs(300));

        limiter.allow("client");
        assert_eq!(limiter.tracked_clients(), 1);

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(limiter.tracked_clients(), 1);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(limiter.tracked_clients(), 0);

        limiter.shutdown();
        handle.await.unwrap();
    }

    #[test]
    fn test_concurrent_first_requests_share_one_window() {
        let limiter = Arc::new(limiter(10));
        let admitted = AtomicU64::new(0);

        std::thread::scope(|scope| {
            for _ in 0..16 {
                let limiter = limiter.clone();
                let admitted = &admitted;
                scope.spawn(move || {
                    for _ in 0..20 {
                        if limiter.allow("9.9.9.9") {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.load(Ordering::SeqCst), 10);
        assert_eq!(limiter.tracked_clients(), 1);
        assert_eq!(limiter.current_count("9.9.9.9"), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tasks_never_over_admit() {
        let limiter = Arc::new(limiter(25));

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.allow("10.0.0.1") })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 25);
    }

    proptest! {
        #[test]
        fn prop_matches_reference_sliding_window(
            limit in 1usize..8,
            gaps in proptest::collection::vec(0u64..30_000, 1..120),
        ) {
            let window = Duration::from_secs(10);
            let limiter = RateLimiter::new(limit, window, Duration::from_secs(600));
            let start = Instant::now();

            let mut elapsed = 0u64;
            let mut admitted_at: Vec<u64> = Vec::new();

            for gap in gaps {
                elapsed += gap;
                let now = start + Duration::from_millis(elapsed);

                let in_window = admitted_at
                    .iter()
                    .filter(|t| elapsed - **t < window.as_millis() as u64)
                    .count();
                let expected = in_window < limit;

                prop_assert_eq!(limiter.allow_at("client", now), expected);
                if expected {
                    admitted_at.push(elapsed);
                }
                prop_assert!(limiter.current_count_at("client", now) <= limit);
            }
        }
    }
}
