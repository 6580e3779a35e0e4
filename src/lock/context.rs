//! Per-flow record of held lock resources.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Tracks which lock resources one logical execution flow already holds.
///
/// Create one context per logical flow (typically one per worker task) and
/// pass it to every acquisition made from that flow. Cloning shares the
/// underlying set, so clones handed to continuations of the *same* flow
/// keep reentrancy working; distinct flows must construct distinct
/// contexts. A process-global set would be wrong here: unrelated flows
/// would observe each other's holdings and re-enter locks they never
/// acquired.
#[derive(Debug, Clone, Default)]
pub struct LockContext {
    held: Arc<Mutex<HashSet<String>>>,
}

impl LockContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn holds(&self, resource: &str) -> bool {
        self.held
            .lock()
            .expect("lock context mutex poisoned")
            .contains(resource)
    }

    pub(crate) fn insert(&self, resource: &str) {
        self.held
            .lock()
            .expect("lock context mutex poisoned")
            .insert(resource.to_string());
    }

    pub(crate) fn remove(&self, resource: &str) {
        self.held
            .lock()
            .expect("lock context mutex poisoned")
            .remove(resource);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_holdings_distinct_contexts_do_not() {
        let flow = LockContext::new();
        flow.insert("resource");

        let same_flow = flow.clone();
        assert!(same_flow.holds("resource"));

        let other_flow = LockContext::new();
        assert!(!other_flow.holds("resource"));

        same_flow.remove("resource");
        assert!(!flow.holds("resource"));
    }
}
