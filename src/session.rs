//! Proxy capability tokens.
//!
//! Every rewritten playlist URI carries a token. The token maps to the
//! cookie and referer the upstream fetches need; requests with an unknown
//! token are refused.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Upstream context bound to a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxySession {
    pub token: String,
    pub cookie: Option<String>,
    /// Referer of the entry playlist
    pub referer: String,
}

struct SessionRecord {
    session: ProxySession,
    last_seen: Mutex<Instant>,
}

/// Token registry with idle expiry.
pub struct SessionRegistry {
    sessions: DashMap<String, SessionRecord>,
    ttl: Duration,
}

impl SessionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
        }
    }

    /// Issue a fresh token.
    pub fn create(&self, cookie: Option<String>, referer: impl Into<String>) -> ProxySession {
        let token = Uuid::new_v4().simple().to_string();
        let session = ProxySession {
            token: token.clone(),
            cookie: cookie.filter(|c| !c.is_empty()),
            referer: referer.into(),
        };
        self.sessions.insert(
            token,
            SessionRecord {
                session: session.clone(),
                last_seen: Mutex::new(Instant::now()),
            },
        );
        tracing::debug!(token = %session.token, "Proxy session created");
        session
    }

    /// Look up a token and mark it used.
    pub fn validate(&self, token: &str) -> Option<ProxySession> {
        let record = self.sessions.get(token)?;
        *record.last_seen.lock() = Instant::now();
        Some(record.session.clone())
    }

    pub fn end(&self, token: &str) -> bool {
        self.sessions.remove(token).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop sessions idle for longer than the TTL.
    pub fn sweep(&self) -> usize {
        let before = self.sessions.len();
        let ttl = self.ttl;
        self.sessions
            .retain(|_, record| record.last_seen.lock().elapsed() <= ttl);
        before.saturating_sub(self.sessions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_validate() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let session = registry.create(Some("__ddg2_=abc".into()), "https://kwik.cx");

        assert_eq!(session.token.len(), 32);
        let found = registry.validate(&session.token).unwrap();
        assert_eq!(found.cookie.as_deref(), Some("__ddg2_=abc"));
        assert_eq!(found.referer, "https://kwik.cx");
        assert!(registry.validate("forged").is_none());
    }

    #[test]
    fn test_tokens_unique() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let a = registry.create(None, "r");
        let b = registry.create(Some(String::new()), "r");
        assert_ne!(a.token, b.token);
        assert!(b.cookie.is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_sweep_expires_idle() {
        let registry = SessionRegistry::new(Duration::ZERO);
        let session = registry.create(None, "r");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.sweep(), 1);
        assert!(registry.validate(&session.token).is_none());
    }

    #[test]
    fn test_end() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let session = registry.create(None, "r");
        assert!(registry.end(&session.token));
        assert!(!registry.end(&session.token));
        assert!(registry.is_empty());
    }
}
