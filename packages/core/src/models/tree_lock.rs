//! Tree Lock Records
//!
//! A tree lock is a lease over a path prefix. It is identified by an opaque
//! token and expires on its own unless refreshed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One locked path prefix
///
/// A multi-path acquisition produces one record per path, all sharing the
/// same token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeLock {
    pub lock_id: i64,
    pub token: String,
    pub path: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TreeLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_expiry_is_inclusive() {
        let now = Utc::now();
        let lock = TreeLock {
            lock_id: 1,
            token: "t".into(),
            path: "/Root".into(),
            locked_at: now - Duration::seconds(10),
            expires_at: now,
        };
        assert!(lock.is_expired(now));
        assert!(!lock.is_expired(now - Duration::milliseconds(1)));
    }
}
