//! Per-conversation session pool keyed by `source:guild:channel:user`.
//!
//! Token totals increase monotonically until a reset; the pool reports when a
//! session is near the compaction threshold but never compacts on its own.
//! The caller decides.

use std::fmt;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Composite conversation key. Any segment may be `"default"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub source: String,
    pub guild: String,
    pub channel: String,
    pub user: String,
}

impl ChannelKey {
    pub fn new(
        source: impl Into<String>,
        guild: Option<&str>,
        channel: Option<&str>,
        user: Option<&str>,
    ) -> Self {
        let or_default = |v: Option<&str>| {
            v.filter(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| "default".to_string())
        };
        Self {
            source: source.into(),
            guild: or_default(guild),
            channel: or_default(channel),
            user: or_default(user),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.source, self.guild, self.channel, self.user
        )
    }
}

#[derive(Debug, Clone)]
pub struct SessionPoolConfig {
    /// Running token total at which `near_threshold` starts reporting true.
    pub token_threshold: u64,
    /// Sessions idle longer than this are dropped by `sweep_idle`.
    pub max_idle: Duration,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            token_threshold: 150_000,
            max_idle: Duration::from_secs(3600),
        }
    }
}

/// What `get_session` hands back.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: String,
    pub is_new: bool,
}

/// What `update_tokens` hands back. `near_threshold` is the compaction signal.
#[derive(Debug, Clone, Copy)]
pub struct TokenUsageReport {
    pub total_tokens: u64,
    pub near_threshold: bool,
}

struct SessionState {
    session_id: String,
    total_tokens: u64,
    created_at: Instant,
    last_activity: Instant,
}

/// Session pool: one session per channel key, reused across turns.
pub struct SessionPool {
    sessions: DashMap<String, SessionState>,
    config: SessionPoolConfig,
}

impl SessionPool {
    pub fn new(config: SessionPoolConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
        }
    }

    /// Returns the session for `key`, creating one if absent.
    pub fn get_session(&self, key: &ChannelKey) -> SessionHandle {
        let now = Instant::now();
        let mut is_new = false;
        let mut entry = self.sessions.entry(key.to_string()).or_insert_with(|| {
            is_new = true;
            SessionState {
                session_id: uuid::Uuid::new_v4().to_string(),
                total_tokens: 0,
                created_at: now,
                last_activity: now,
            }
        });
        entry.last_activity = Instant::now();
        SessionHandle {
            session_id: entry.session_id.clone(),
            is_new,
        }
    }

    /// Attaches an externally supplied session id (e.g. returned by the
    /// backend on the first turn) to the channel key.
    pub fn attach_session_id(&self, key: &ChannelKey, session_id: &str) {
        if let Some(mut entry) = self.sessions.get_mut(&key.to_string()) {
            entry.session_id = session_id.to_string();
        }
    }

    /// Adds one turn's usage to the running total and reports whether the
    /// session is near the configured threshold.
    pub fn update_tokens(&self, key: &ChannelKey, input: u64, output: u64) -> TokenUsageReport {
        let mut entry = self
            .sessions
            .entry(key.to_string())
            .or_insert_with(|| SessionState {
                session_id: uuid::Uuid::new_v4().to_string(),
                total_tokens: 0,
                created_at: Instant::now(),
                last_activity: Instant::now(),
            });
        entry.total_tokens += input + output;
        entry.last_activity = Instant::now();
        TokenUsageReport {
            total_tokens: entry.total_tokens,
            near_threshold: entry.total_tokens >= self.config.token_threshold,
        }
    }

    /// Tears the session down; the next `get_session` starts fresh.
    pub fn reset_session(&self, key: &ChannelKey) -> bool {
        self.sessions.remove(&key.to_string()).is_some()
    }

    /// Age of the session for `key`, when one exists.
    pub fn session_age(&self, key: &ChannelKey) -> Option<Duration> {
        self.sessions
            .get(&key.to_string())
            .map(|state| state.created_at.elapsed())
    }

    /// Drops sessions idle past `max_idle`. Returns how many were dropped.
    pub fn sweep_idle(&self) -> usize {
        let before = self.sessions.len();
        let max_idle = self.config.max_idle;
        self.sessions
            .retain(|_, state| state.last_activity.elapsed() < max_idle);
        before - self.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(user: &str) -> ChannelKey {
        ChannelKey::new("discord", Some("g1"), Some("c1"), Some(user))
    }

    #[test]
    fn channel_key_formats_with_defaults() {
        let full = ChannelKey::new("discord", Some("g"), Some("c"), Some("u"));
        assert_eq!(full.to_string(), "discord:g:c:u");
        let sparse = ChannelKey::new("cli", None, None, Some(""));
        assert_eq!(sparse.to_string(), "cli:default:default:default");
    }

    #[test]
    fn session_reused_across_turns() {
        let pool = SessionPool::new(SessionPoolConfig::default());
        let first = pool.get_session(&key("u1"));
        assert!(first.is_new);
        let second = pool.get_session(&key("u1"));
        assert_eq!(first.session_id, second.session_id);

        let other = pool.get_session(&key("u2"));
        assert_ne!(first.session_id, other.session_id);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn token_totals_accumulate_and_report_threshold() {
        let pool = SessionPool::new(SessionPoolConfig {
            token_threshold: 100,
            ..Default::default()
        });
        let k = key("u1");
        pool.get_session(&k);
        let report = pool.update_tokens(&k, 30, 20);
        assert_eq!(report.total_tokens, 50);
        assert!(!report.near_threshold);
        let report = pool.update_tokens(&k, 40, 15);
        assert_eq!(report.total_tokens, 105);
        assert!(report.near_threshold);
    }

    #[test]
    fn reset_starts_a_fresh_session() {
        let pool = SessionPool::new(SessionPoolConfig::default());
        let k = key("u1");
        let first = pool.get_session(&k);
        pool.update_tokens(&k, 10, 10);
        assert!(pool.reset_session(&k));
        let fresh = pool.get_session(&k);
        assert!(fresh.is_new);
        assert_ne!(first.session_id, fresh.session_id);
        assert!(!pool.reset_session(&ChannelKey::new("nope", None, None, None)));
    }

    #[test]
    fn idle_sessions_are_swept() {
        let pool = SessionPool::new(SessionPoolConfig {
            max_idle: Duration::from_millis(10),
            ..Default::default()
        });
        pool.get_session(&key("u1"));
        std::thread::sleep(Duration::from_millis(30));
        pool.get_session(&key("u2"));
        assert_eq!(pool.sweep_idle(), 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn attach_session_id_overrides_generated() {
        let pool = SessionPool::new(SessionPoolConfig::default());
        let k = key("u1");
        pool.get_session(&k);
        pool.attach_session_id(&k, "server-side-id");
        assert_eq!(pool.get_session(&k).session_id, "server-side-id");
    }
}
