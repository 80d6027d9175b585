use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use super::lock_ignore_poison;
use crate::{CommandResponse, Error, Result};

type CallSlot = oneshot::Sender<Result<CommandResponse>>;

/// Tracks outstanding calls waiting for replies.
///
/// Maps correlation ids to oneshot channels. The caller registers a slot
/// before publishing its request; the reply listener resolves the slot
/// when the matching reply arrives. A slot is resolved at most once —
/// resolution removes it from the map, so a duplicate reply finds
/// nothing and is dropped by the listener.
pub(crate) struct PendingCalls {
    // ---
    calls: Mutex<HashMap<String, CallSlot>>,
}

impl PendingCalls {
    // ---

    pub fn new() -> Self {
        // ---
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new pending call.
    ///
    /// Returns the receiver the caller awaits (under its own timeout).
    pub fn register(&self, correlation_id: &str) -> oneshot::Receiver<Result<CommandResponse>> {
        // ---
        let (tx, rx) = oneshot::channel();
        lock_ignore_poison(&self.calls).insert(correlation_id.to_string(), tx);
        rx
    }

    /// Resolve a pending call with the given outcome.
    ///
    /// Returns false when no call with that correlation id is
    /// outstanding (already resolved, timed out, or never issued).
    pub fn resolve(&self, correlation_id: &str, outcome: Result<CommandResponse>) -> bool {
        // ---
        let slot = lock_ignore_poison(&self.calls).remove(correlation_id);

        match slot {
            Some(tx) => {
                // Send failure means the caller gave up (timeout) between
                // our remove and this send; the reply is dropped.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Remove a pending call without resolving it (timeout cleanup).
    pub fn remove(&self, correlation_id: &str) -> bool {
        // ---
        lock_ignore_poison(&self.calls).remove(correlation_id).is_some()
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        // ---
        lock_ignore_poison(&self.calls).len()
    }

    /// Fail every outstanding call with a connection-lost error.
    ///
    /// Used when the reply listener stops or the client closes.
    pub fn fail_all(&self) {
        // ---
        let drained: Vec<CallSlot> = lock_ignore_poison(&self.calls)
            .drain()
            .map(|(_, tx)| tx)
            .collect();

        for tx in drained {
            let _ = tx.send(Err(Error::ConnectionLost));
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::protocol::JsonMap;

    #[test]
    fn test_register_and_resolve() {
        // ---
        let pending = PendingCalls::new();

        let mut rx = pending.register("call-1");
        assert_eq!(pending.len(), 1);

        assert!(pending.resolve("call-1", Ok(CommandResponse::ok(JsonMap::new()))));

        // Removed after resolution.
        assert_eq!(pending.len(), 0);

        let outcome = rx.try_recv().unwrap();
        assert!(outcome.unwrap().success);
    }

    #[test]
    fn test_resolve_unknown_id() {
        // ---
        let pending = PendingCalls::new();
        assert!(!pending.resolve("nope", Ok(CommandResponse::ok(JsonMap::new()))));
    }

    #[test]
    fn test_no_double_resolution() {
        // ---
        let pending = PendingCalls::new();

        let _rx = pending.register("call-1");
        assert!(pending.resolve("call-1", Ok(CommandResponse::ok(JsonMap::new()))));

        // The second reply finds nothing.
        assert!(!pending.resolve("call-1", Ok(CommandResponse::ok(JsonMap::new()))));
    }

    #[test]
    fn test_remove() {
        // ---
        let pending = PendingCalls::new();

        let _rx = pending.register("call-1");
        assert_eq!(pending.len(), 1);

        assert!(pending.remove("call-1"));
        assert_eq!(pending.len(), 0);

        // Second remove should return false
        assert!(!pending.remove("call-1"));
    }

    #[test]
    fn test_fail_all() {
        // ---
        let pending = PendingCalls::new();

        let mut rx1 = pending.register("call-1");
        let mut rx2 = pending.register("call-2");

        pending.fail_all();
        assert_eq!(pending.len(), 0);

        assert!(matches!(rx1.try_recv().unwrap(), Err(Error::ConnectionLost)));
        assert!(matches!(rx2.try_recv().unwrap(), Err(Error::ConnectionLost)));
    }
}
