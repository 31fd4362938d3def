use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use uuid::Uuid;

/// Process-local playback history: when each item and each filler show last
/// aired per channel, plus the per-session failure window behind the
/// too-many-attempts throttle. All operations are O(1) map touches; nothing
/// awaits while the lock is held.
#[derive(Default)]
pub struct PlaybackCache {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    items: HashMap<u32, HashMap<String, i64>>,
    filler_shows: HashMap<u32, HashMap<Uuid, i64>>,
    failures: HashMap<u64, VecDeque<i64>>,
}

impl PlaybackCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timestamps only move forward; concurrent recorders can race.
    pub fn record_item(&self, channel: u32, key: &str, now_ms: i64) {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .items
            .entry(channel)
            .or_default()
            .entry(key.to_string())
            .or_insert(now_ms);
        if now_ms > *slot {
            *slot = now_ms;
        }
    }

    pub fn last_played_item(&self, channel: u32, key: &str) -> Option<i64> {
        let inner = self.inner.lock().unwrap();
        inner.items.get(&channel)?.get(key).copied()
    }

    pub fn record_filler_show(&self, channel: u32, show: Uuid, now_ms: i64) {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .filler_shows
            .entry(channel)
            .or_default()
            .entry(show)
            .or_insert(now_ms);
        if now_ms > *slot {
            *slot = now_ms;
        }
    }

    pub fn last_played_filler_show(&self, channel: u32, show: Uuid) -> Option<i64> {
        let inner = self.inner.lock().unwrap();
        inner.filler_shows.get(&channel)?.get(&show).copied()
    }

    /// Forget a channel's history. Used when the controller skips over a short
    /// offline gap that was reached through redirects.
    pub fn clear_channel(&self, channel: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.items.remove(&channel);
        inner.filler_shows.remove(&channel);
    }

    pub fn record_failure(&self, session: u64, now_ms: i64) {
        if session == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.failures.entry(session).or_default().push_back(now_ms);
    }

    /// Failures for `session` inside the trailing window. Prunes as it counts.
    pub fn failures_within(&self, session: u64, window_ms: i64, now_ms: i64) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let Some(window) = inner.failures.get_mut(&session) else {
            return 0;
        };
        while let Some(&front) = window.front() {
            if now_ms - front > window_ms {
                window.pop_front();
            } else {
                break;
            }
        }
        window.len()
    }

    pub fn clear_session(&self, session: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.failures.remove(&session);
    }
}
