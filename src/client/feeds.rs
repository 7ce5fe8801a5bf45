//! Process-wide guard over connections with live feeds.
//!
//! Embedding applications call [`shutdown`] when tearing down the task
//! runtime that owns their handlers: feed waiters are stripped from every
//! registered connection, so responses that arrive afterwards are silently
//! dropped instead of being dispatched to dead handlers.

use std::sync::{Arc, Mutex, Weak};

use super::{ConnInner, Connection};

static REGISTRY: Mutex<Vec<Weak<ConnInner>>> = Mutex::new(Vec::new());

/// Track a connection that just started a feed. Idempotent.
pub(crate) fn register(conn: &Connection) {
    let mut registry = REGISTRY.lock().unwrap();
    registry.retain(|weak| weak.strong_count() > 0);
    let ptr = Arc::as_ptr(&conn.inner);
    if !registry.iter().any(|weak| std::ptr::eq(weak.as_ptr(), ptr)) {
        registry.push(Arc::downgrade(&conn.inner));
    }
}

/// Strip feed waiters from every registered connection.
///
/// The registry lock is released before any connection lock is taken, so
/// this cannot invert lock order against the reader or the dispatchers.
pub fn shutdown() {
    let conns: Vec<Arc<ConnInner>> = {
        let mut registry = REGISTRY.lock().unwrap();
        registry.drain(..).filter_map(|weak| weak.upgrade()).collect()
    };
    for inner in conns {
        inner.drop_feed_waiters();
    }
}
