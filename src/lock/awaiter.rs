//! In-process awaiter registry.
//!
//! When the current holder of a lock lives in this process, contenders
//! wait on a shared per-resource [`Notify`] instead of polling the
//! database. Entries are weakly referenced: the registry returns the same
//! primitive while any holder or waiter keeps it alive, and dead entries
//! are pruned on release.

use dashmap::DashMap;
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::Notify;

static REGISTRY: OnceLock<DashMap<String, Weak<Notify>>> = OnceLock::new();

fn registry() -> &'static DashMap<String, Weak<Notify>> {
    REGISTRY.get_or_init(DashMap::new)
}

/// The shared awaiter for `resource`, creating one if no live entry exists.
pub(crate) fn awaiter_for(resource: &str) -> Arc<Notify> {
    let mut entry = registry()
        .entry(resource.to_string())
        .or_insert_with(Weak::new);
    match entry.upgrade() {
        Some(existing) => existing,
        None => {
            let fresh = Arc::new(Notify::new());
            *entry = Arc::downgrade(&fresh);
            fresh
        }
    }
}

/// Wake one in-process contender for `resource`, if any is registered. The
/// permit is stored when nobody is waiting, so a contender arriving just
/// after a release retries immediately instead of sleeping out its wait.
pub(crate) fn signal(resource: &str) {
    if let Some(entry) = registry().get(resource) {
        if let Some(notify) = entry.upgrade() {
            notify.notify_one();
        }
    }
}

/// Drop registry entries whose awaiter no longer has any holder.
pub(crate) fn prune() {
    registry().retain(|_, weak| weak.strong_count() > 0);
}
