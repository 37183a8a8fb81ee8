use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use axum::response::sse::{Event, KeepAlive};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::debug;

const EVENT_NAME: &str = "revalidate";
const BROADCAST_BUFFER: usize = 128;

/// Notice that every cached rendering under `path` is stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevalidationEvent {
    pub path: String,
    pub at: DateTime<Utc>,
}

impl RevalidationEvent {
    pub fn into_sse_event(self) -> Result<Event, serde_json::Error> {
        let data = serde_json::to_string(&self)?;
        Ok(Event::default().event(EVENT_NAME).data(data))
    }
}

/// Fan-out of revalidation events to connected dashboards.
#[derive(Clone)]
pub struct RevalidationHub {
    sender: broadcast::Sender<RevalidationEvent>,
}

impl RevalidationHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_BUFFER);
        Self { sender }
    }

    pub fn publish(&self, event: RevalidationEvent) {
        // No open dashboards is the common case, not a failure.
        if self.sender.send(event).is_err() {
            debug!(stage = "revalidate", "no subscribers for revalidation event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RevalidationEvent> {
        self.sender.subscribe()
    }
}

impl Default for RevalidationHub {
    fn default() -> Self {
        Self::new()
    }
}

pub fn revalidation_stream(
    hub: &RevalidationHub,
) -> impl Stream<Item = Result<Event, serde_json::Error>> + Send + 'static {
    BroadcastStream::new(hub.subscribe()).filter_map(|result| match result {
        Ok(event) => Some(event.into_sse_event()),
        // A lagged receiver just skips ahead; the next event still triggers a refresh.
        Err(_) => None,
    })
}

pub fn revalidation_keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(20))
        .text("heartbeat")
}

/// Most rendered list pages kept at once. The oldest entry is evicted first.
pub const LIST_CACHE_CAPACITY: usize = 256;

/// Rendered list pages keyed by request path and query string.
///
/// Every invalidation bumps a generation counter. A render started before an
/// invalidation carries the older generation and is not stored.
#[derive(Clone)]
pub struct ListViewCache {
    inner: Arc<Mutex<CacheInner>>,
    capacity: usize,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, String>,
    order: VecDeque<String>,
    generation: u64,
}

impl ListViewCache {
    pub fn new() -> Self {
        Self::with_capacity(LIST_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner::default())),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let hit = self.lock().entries.get(key).cloned();
        let result = if hit.is_some() { "hit" } else { "miss" };
        counter!("list_view_cache_total", "result" => result).increment(1);
        hit
    }

    /// Generation to pass to [`ListViewCache::insert`] for a render that starts now.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Stores `body` unless the cache was invalidated after `generation` was read.
    /// Returns whether the entry was stored.
    pub fn insert(&self, key: String, body: String, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            counter!("list_view_cache_total", "result" => "stale").increment(1);
            return false;
        }

        if inner.entries.insert(key.clone(), body).is_none() {
            inner.order.push_back(key);
        }
        while inner.entries.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
            counter!("list_view_cache_total", "result" => "evicted").increment(1);
        }
        true
    }

    /// Drops every entry rendered for `path`, with or without a query string.
    /// Returns the number of entries removed.
    pub fn invalidate(&self, path: &str) -> usize {
        let mut inner = self.lock();
        inner.generation += 1;
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !covers(path, key));
        let CacheInner { entries, order, .. } = &mut *inner;
        order.retain(|key| entries.contains_key(key));
        before - entries.len()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        // Entries are plain strings, so a poisoned map is still consistent.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ListViewCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the cache key for a request.
pub fn cache_key(path: &str, raw_query: Option<&str>) -> String {
    match raw_query {
        Some(query) if !query.is_empty() => format!("{path}?{query}"),
        _ => path.to_string(),
    }
}

fn covers(path: &str, key: &str) -> bool {
    match key.strip_prefix(path) {
        Some(rest) => rest.is_empty() || rest.starts_with('?') || rest.starts_with('/'),
        None => false,
    }
}
