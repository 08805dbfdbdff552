//! Per-session rate limiting for tool calls
//!
//! Counters are keyed by (session, server) plus one global counter per
//! session. They are never shared across sessions and are dropped when the
//! session ends. Check and increment happen under one lock, so two calls
//! racing for the last slot cannot both get it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{GovernanceError, Result};
use crate::types::{now, SessionId, Timestamp};

/// Monotonic call counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitCounter {
    pub count: u32,
    pub window_start: Timestamp,
}

impl RateLimitCounter {
    fn new() -> Self {
        Self {
            count: 0,
            window_start: now(),
        }
    }

    fn would_exceed(&self, limit: u32) -> bool {
        self.count.saturating_add(1) > limit
    }

    fn increment(&mut self) -> u32 {
        self.count = self.count.saturating_add(1);
        self.count
    }
}

#[derive(Debug, Default)]
struct SessionCounters {
    global: Option<RateLimitCounter>,
    servers: HashMap<String, RateLimitCounter>,
}

/// Shared limiter for all sessions of an engine
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    sessions: Arc<Mutex<HashMap<SessionId, SessionCounters>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one slot for `server`, or fail without counting the call
    pub fn try_acquire(
        &self,
        session: &SessionId,
        server: &str,
        server_limit: Option<u32>,
        global_limit: u32,
    ) -> Result<u32> {
        let mut sessions = self.sessions.lock();
        let counters = sessions.entry(session.clone()).or_default();

        let global = counters.global.get_or_insert_with(RateLimitCounter::new);
        if global.would_exceed(global_limit) {
            return Err(GovernanceError::RateLimitExceeded {
                scope: "global".to_string(),
                count: global.count + 1,
                limit: global_limit,
            });
        }

        let per_server = counters
            .servers
            .entry(server.to_string())
            .or_insert_with(RateLimitCounter::new);
        if let Some(limit) = server_limit {
            if per_server.would_exceed(limit) {
                return Err(GovernanceError::RateLimitExceeded {
                    scope: format!("server {server}"),
                    count: per_server.count + 1,
                    limit,
                });
            }
        }

        let count = per_server.increment();
        if let Some(global) = counters.global.as_mut() {
            global.increment();
        }
        Ok(count)
    }

    /// (server count, global count) for a session
    pub fn status(&self, session: &SessionId, server: &str) -> (u32, u32) {
        let sessions = self.sessions.lock();
        sessions.get(session).map_or((0, 0), |c| {
            (
                c.servers.get(server).map_or(0, |s| s.count),
                c.global.as_ref().map_or(0, |g| g.count),
            )
        })
    }

    /// Drop a finished session's counters
    pub fn reset(&self, session: &SessionId) {
        self.sessions.lock().remove(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_sub_limit() {
        let limiter = RateLimiter::new();
        let s = SessionId::from("session:a");
        assert_eq!(limiter.try_acquire(&s, "github", Some(2), 200).unwrap(), 1);
        assert_eq!(limiter.try_acquire(&s, "github", Some(2), 200).unwrap(), 2);

        let err = limiter.try_acquire(&s, "github", Some(2), 200).unwrap_err();
        assert!(err.to_string().contains("server github call count 3 would exceed limit 2"));

        // rejected calls are not counted
        assert_eq!(limiter.status(&s, "github"), (2, 2));
        assert!(limiter.try_acquire(&s, "jira", None, 200).is_ok());
    }

    #[test]
    fn test_global_limit_spans_servers() {
        let limiter = RateLimiter::new();
        let s = SessionId::from("session:a");
        limiter.try_acquire(&s, "github", None, 2).unwrap();
        limiter.try_acquire(&s, "jira", None, 2).unwrap();
        let err = limiter.try_acquire(&s, "slack", None, 2).unwrap_err();
        assert!(err.to_string().contains("global"));
    }

    #[test]
    fn test_counters_are_per_session() {
        let limiter = RateLimiter::new();
        let a = SessionId::from("session:a");
        let b = SessionId::from("session:b");
        limiter.try_acquire(&a, "github", Some(1), 200).unwrap();
        assert!(limiter.try_acquire(&b, "github", Some(1), 200).is_ok());

        limiter.reset(&a);
        assert_eq!(limiter.status(&a, "github"), (0, 0));
    }

    #[test]
    fn test_concurrent_acquire_never_overshoots() {
        let limiter = RateLimiter::new();
        let s = SessionId::from("session:a");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                let s = s.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .filter(|_| limiter.try_acquire(&s, "github", Some(100), 1000).is_ok())
                        .count()
                })
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 100);
    }
}
