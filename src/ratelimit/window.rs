//! Per-client sliding-window request history.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use super::client::ClientId;

/// Timestamps of admitted requests for one client, oldest first.
#[derive(Debug, Default)]
struct RequestHistory {
    entries: VecDeque<Instant>,
}

impl RequestHistory {
    /// Drop every entry older than `window` relative to `now` and return the
    /// retained count. An entry exactly `window` old is retained.
    fn purge(&mut self, now: Instant, window: Duration) -> usize {
        while let Some(&oldest) = self.entries.front() {
            if now.saturating_duration_since(oldest) > window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
        self.entries.len()
    }

    fn push(&mut self, now: Instant) {
        // Keep entries non-decreasing even if a caller hands us a stale instant.
        let at = match self.entries.back() {
            Some(&last) if last > now => last,
            _ => now,
        };
        self.entries.push_back(at);
    }
}

/// Result of a [`ClientWindowStore::record`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Retained entries after purging, before `now` was considered
    pub count: usize,
    /// Whether `now` was appended to the history
    pub recorded: bool,
}

/// Concurrent map from client identifier to that client's request history.
///
/// Every client owns its own mutex; the outer map is sharded, so requests
/// from different clients only meet briefly on a shard lookup and never wait
/// on each other's purge/record work.
#[derive(Debug, Default)]
pub struct ClientWindowStore {
    clients: DashMap<ClientId, Arc<Mutex<RequestHistory>>>,
}

impl ClientWindowStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Purge, count and conditionally record a request as one atomic step.
    ///
    /// `admit` receives the retained count after purging and decides whether
    /// `now` is appended. The whole sequence runs under the client's lock, so
    /// concurrent callers for the same client observe each other's appends.
    pub fn record<F>(&self, client: &ClientId, now: Instant, window: Duration, admit: F) -> WindowCount
    where
        F: FnOnce(usize) -> bool,
    {
        let history = self.history_for(client);
        let mut history = history.lock();

        let count = history.purge(now, window);
        let recorded = admit(count);
        if recorded {
            history.push(now);
        }

        WindowCount { count, recorded }
    }

    /// Purge a client's expired entries and return the retained count.
    ///
    /// Returns `None` if the client has never been seen (or was evicted).
    pub fn purge(&self, client: &ClientId, now: Instant, window: Duration) -> Option<usize> {
        let history = self.clients.get(client).map(|entry| Arc::clone(entry.value()))?;
        let count = history.lock().purge(now, window);
        Some(count)
    }

    /// Raw number of retained entries for a client, without purging.
    pub fn count(&self, client: &ClientId) -> usize {
        self.clients
            .get(client)
            .map(|entry| entry.value().lock().entries.len())
            .unwrap_or(0)
    }

    /// Number of clients currently tracked.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Purge every client and drop the ones left with an empty history.
    ///
    /// A history that an in-flight `record` or `purge` still holds is never
    /// removed: the shard write lock taken by `retain` prevents new handles
    /// from being handed out, and an outstanding handle shows up in the
    /// reference count.
    pub fn evict_idle(&self, now: Instant, window: Duration) -> usize {
        let before = self.clients.len();
        self.clients.retain(|_, history| {
            if Arc::strong_count(history) > 1 {
                return true;
            }
            history.lock().purge(now, window) > 0
        });
        before.saturating_sub(self.clients.len())
    }

    /// Forget every client.
    pub fn clear(&self) {
        self.clients.clear();
    }

    /// Run [`evict_idle`](Self::evict_idle) every `every` on the current
    /// tokio runtime until the returned handle is aborted.
    pub fn spawn_evictor(store: Arc<Self>, window: Duration, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = store.evict_idle(Instant::now(), window);
                if evicted > 0 {
                    debug!(
                        evicted = evicted,
                        remaining = store.client_count(),
                        "Evicted idle client histories"
                    );
                }
            }
        })
    }

    fn history_for(&self, client: &ClientId) -> Arc<Mutex<RequestHistory>> {
        if let Some(entry) = self.clients.get(client) {
            return Arc::clone(entry.value());
        }
        Arc::clone(self.clients.entry(client.clone()).or_default().value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    const WINDOW: Duration = Duration::from_secs(60);

    fn client(key: &str) -> ClientId {
        ClientId::new(key)
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_record_appends_only_when_admitted() {
        let store = ClientWindowStore::new();
        let id = client("a");
        let t0 = Instant::now();

        let first = store.record(&id, t0, WINDOW, |_| true);
        assert_eq!(first, WindowCount { count: 0, recorded: true });

        let second = store.record(&id, t0 + secs(1), WINDOW, |_| false);
        assert_eq!(second, WindowCount { count: 1, recorded: false });

        assert_eq!(store.count(&id), 1);
    }

    #[test]
    fn test_record_reports_count_before_append() {
        let store = ClientWindowStore::new();
        let id = client("a");
        let t0 = Instant::now();

        for expected in 0..5 {
            let result = store.record(&id, t0, WINDOW, |_| true);
            assert_eq!(result.count, expected);
        }
    }

    #[test]
    fn test_expired_entries_are_purged_before_count() {
        let store = ClientWindowStore::new();
        let id = client("a");
        let t0 = Instant::now();

        store.record(&id, t0, WINDOW, |_| true);
        store.record(&id, t0 + secs(30), WINDOW, |_| true);

        let result = store.record(&id, t0 + secs(61), WINDOW, |_| false);
        assert_eq!(result.count, 1);
        assert_eq!(store.count(&id), 1);
    }

    #[test]
    fn test_entry_exactly_window_old_is_retained() {
        let store = ClientWindowStore::new();
        let id = client("a");
        let t0 = Instant::now();

        store.record(&id, t0, WINDOW, |_| true);

        assert_eq!(store.purge(&id, t0 + WINDOW, WINDOW), Some(1));
        assert_eq!(store.purge(&id, t0 + WINDOW + Duration::from_millis(1), WINDOW), Some(0));
    }

    #[test]
    fn test_purge_is_idempotent() {
        let store = ClientWindowStore::new();
        let id = client("a");
        let t0 = Instant::now();

        for i in 0..4 {
            store.record(&id, t0 + secs(i * 20), WINDOW, |_| true);
        }

        let now = t0 + secs(90);
        let first = store.purge(&id, now, WINDOW);
        let second = store.purge(&id, now, WINDOW);
        let third = store.purge(&id, now, WINDOW);

        assert_eq!(first, Some(2));
        assert_eq!(first, second);
        assert_eq!(second, third);
    }

    #[test]
    fn test_purge_unknown_client() {
        let store = ClientWindowStore::new();
        assert_eq!(store.purge(&client("nobody"), Instant::now(), WINDOW), None);
        assert_eq!(store.client_count(), 0);
    }

    #[test]
    fn test_clients_are_isolated() {
        let store = ClientWindowStore::new();
        let t0 = Instant::now();

        for _ in 0..3 {
            store.record(&client("a"), t0, WINDOW, |_| true);
        }
        let b = store.record(&client("b"), t0, WINDOW, |_| true);

        assert_eq!(b.count, 0);
        assert_eq!(store.count(&client("a")), 3);
        assert_eq!(store.count(&client("b")), 1);
        assert_eq!(store.client_count(), 2);
    }

    #[test]
    fn test_stale_instant_keeps_history_ordered() {
        let store = ClientWindowStore::new();
        let id = client("a");
        let t0 = Instant::now();

        store.record(&id, t0 + secs(10), WINDOW, |_| true);
        store.record(&id, t0, WINDOW, |_| true);

        // Both entries were stored at t0 + 10s, so both expire together.
        assert_eq!(store.purge(&id, t0 + secs(70), WINDOW), Some(2));
        assert_eq!(store.purge(&id, t0 + secs(71), WINDOW), Some(0));
    }

    #[test]
    fn test_evict_idle_drops_only_empty_histories() {
        let store = ClientWindowStore::new();
        let t0 = Instant::now();

        store.record(&client("old"), t0, WINDOW, |_| true);
        store.record(&client("recent"), t0 + secs(50), WINDOW, |_| true);
        store.record(&client("never-admitted"), t0, WINDOW, |_| false);

        let evicted = store.evict_idle(t0 + secs(70), WINDOW);

        assert_eq!(evicted, 2);
        assert_eq!(store.client_count(), 1);
        assert_eq!(store.count(&client("recent")), 1);
    }

    #[test]
    fn test_evict_idle_keeps_history_in_use() {
        let store = ClientWindowStore::new();
        let id = client("busy");
        let t0 = Instant::now();

        store.record(&id, t0, WINDOW, |_| false);
        let held = store.history_for(&id);

        assert_eq!(store.evict_idle(t0, WINDOW), 0);
        assert_eq!(store.client_count(), 1);

        drop(held);
        assert_eq!(store.evict_idle(t0, WINDOW), 1);
    }

    #[test]
    fn test_clear() {
        let store = ClientWindowStore::new();
        store.record(&client("a"), Instant::now(), WINDOW, |_| true);

        store.clear();
        assert_eq!(store.client_count(), 0);
    }

    #[test]
    fn test_concurrent_records_never_overshoot() {
        const THREADS: usize = 32;
        const LIMIT: usize = 5;

        let store = Arc::new(ClientWindowStore::new());
        let barrier = Arc::new(Barrier::new(THREADS));
        let now = Instant::now();

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    store
                        .record(&client("shared"), now, WINDOW, |count| count < LIMIT)
                        .recorded
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|recorded| *recorded)
            .count();

        assert_eq!(admitted, LIMIT);
        assert_eq!(store.count(&client("shared")), LIMIT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evictor_task_removes_idle_clients() {
        let store = Arc::new(ClientWindowStore::new());
        store.record(&client("gone"), Instant::now(), Duration::ZERO, |_| false);

        let handle = ClientWindowStore::spawn_evictor(Arc::clone(&store), Duration::ZERO, secs(1));
        tokio::time::sleep(secs(2)).await;

        assert_eq!(store.client_count(), 0);
        handle.abort();
    }
}
