use std::collections::HashMap;
use std::sync::Mutex;

/// Failures allowed per window before throttling.
const MAX_FAILURES: u32 = 20;
/// Fixed window length.
const WINDOW_MS: i64 = 60_000;
/// Upper bound on tracked client keys.
const MAX_KEYS: usize = 2048;

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: i64,
    failures: u32,
}

/// Fixed-window auth-failure counter for the hook endpoints.
///
/// At most `MAX_KEYS` clients are tracked; when the table fills, expired
/// windows are pruned first and, failing that, the oldest half is dropped.
pub struct FailureWindow {
    entries: Mutex<HashMap<String, Window>>,
}

/// What the caller should do with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    /// Throttled; retry after this many seconds.
    Throttle { retry_after_secs: u64 },
}

impl FailureWindow {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether a request from `key` may attempt authentication.
    pub fn check(&self, key: &str, now_ms: i64) -> Decision {
        let entries = self.entries.lock().expect("window lock");
        match entries.get(key) {
            Some(w) if now_ms - w.started_at < WINDOW_MS && w.failures >= MAX_FAILURES => {
                let remaining_ms = WINDOW_MS - (now_ms - w.started_at);
                Decision::Throttle {
                    retry_after_secs: (remaining_ms as u64).div_ceil(1000).max(1),
                }
            }
            _ => Decision::Allow,
        }
    }

    /// Record one failed authentication.
    pub fn record_failure(&self, key: &str, now_ms: i64) {
        let mut entries = self.entries.lock().expect("window lock");

        if !entries.contains_key(key) && entries.len() >= MAX_KEYS {
            Self::evict(&mut entries, now_ms);
        }

        let window = entries.entry(key.to_string()).or_insert(Window {
            started_at: now_ms,
            failures: 0,
        });
        if now_ms - window.started_at >= WINDOW_MS {
            window.started_at = now_ms;
            window.failures = 0;
        }
        window.failures += 1;
    }

    /// Successful authentication clears the counter.
    pub fn record_success(&self, key: &str) {
        self.entries.lock().expect("window lock").remove(key);
    }

    /// Expired entries first; if the table is still full, drop the oldest
    /// half.
    fn evict(entries: &mut HashMap<String, Window>, now_ms: i64) {
        entries.retain(|_, w| now_ms - w.started_at < WINDOW_MS);
        if entries.len() < MAX_KEYS {
            return;
        }

        let mut by_age: Vec<(String, i64)> = entries
            .iter()
            .map(|(k, w)| (k.clone(), w.started_at))
            .collect();
        by_age.sort_by_key(|(_, started)| *started);
        for (key, _) in by_age.iter().take(entries.len() / 2) {
            entries.remove(key);
        }
    }
}

impl Default for FailureWindow {
    fn default() -> Self {
        Self::new()
    }
}
