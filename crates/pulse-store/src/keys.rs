//! Store key and channel builders for all Pulse entries.
//!
//! Centralising key construction prevents typos and makes it easy
//! to find every key the relay uses.

/// Prefix applied to all Pulse store keys and channels.
const PREFIX: &str = "pulse";

// ── Presence keys ──────────────────────────────────────────

/// Hash key holding the last published message per client in a scope.
pub fn presence_hash(scope: &str) -> String {
    format!("{PREFIX}:presence:{scope}")
}

/// Pub/sub channel carrying live presence messages for a scope.
pub fn presence_channel(scope: &str) -> String {
    format!("{PREFIX}:presence:channel:{scope}")
}

// ── Sentry keys ────────────────────────────────────────────

/// Hash key holding one heartbeat record per live node.
pub fn sentry_hash() -> String {
    format!("{PREFIX}:sentry:nodes")
}

/// Pub/sub channel carrying node heartbeats.
pub fn sentry_channel() -> String {
    format!("{PREFIX}:sentry:heartbeat")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_keys() {
        assert_eq!(
            presence_hash("presence:/account/room"),
            "pulse:presence:presence:/account/room"
        );
        assert_eq!(
            presence_channel("presence:/account/room"),
            "pulse:presence:channel:presence:/account/room"
        );
    }

    #[test]
    fn test_sentry_keys() {
        assert_eq!(sentry_hash(), "pulse:sentry:nodes");
        assert_eq!(sentry_channel(), "pulse:sentry:heartbeat");
    }
}
