use std::{
    sync::Arc,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    time::Instant,
};

use once_cell::sync::Lazy;

pub static METRICS: Lazy<Arc<Metrics>> = Lazy::new(|| Arc::new(Metrics::new()));

#[derive(Debug)]
pub struct Metrics {
    start: Instant,
    ready: AtomicBool,
    active_sessions: AtomicUsize,
    sessions_created: AtomicU64,
    searches: AtomicU64,
    search_fallbacks: AtomicU64,
    notifications: AtomicU64,
    external_dropped: AtomicU64,
    external_enabled: AtomicBool,
}

impl Metrics {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            ready: AtomicBool::new(false),
            active_sessions: AtomicUsize::new(0),
            sessions_created: AtomicU64::new(0),
            searches: AtomicU64::new(0),
            search_fallbacks: AtomicU64::new(0),
            notifications: AtomicU64::new(0),
            external_dropped: AtomicU64::new(0),
            external_enabled: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self, v: bool) {
        self.ready.store(v, Ordering::Relaxed);
    }
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn inc_sessions(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }
    pub fn dec_sessions(&self) {
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                Some(x.saturating_sub(1))
            });
    }

    pub fn inc_searches(&self) {
        self.searches.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_search_fallbacks(&self) {
        self.search_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_notifications(&self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_external_dropped(&self) {
        self.external_dropped.fetch_add(1, Ordering::Relaxed);
    }
    pub fn set_external_enabled(&self, v: bool) {
        self.external_enabled.store(v, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.start.elapsed().as_secs(),
            ready: self.is_ready(),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            searches: self.searches.load(Ordering::Relaxed),
            search_fallbacks: self.search_fallbacks.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
            external_dropped: self.external_dropped.load(Ordering::Relaxed),
            external_enabled: self.external_enabled.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub ready: bool,
    pub active_sessions: usize,
    pub sessions_created: u64,
    pub searches: u64,
    pub search_fallbacks: u64,
    pub notifications: u64,
    pub external_dropped: u64,
    pub external_enabled: bool,
}
