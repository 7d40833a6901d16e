//! Cooperative cancellation.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::info;

#[derive(Default)]
struct Inner {
    requested: AtomicBool,
    reason: Mutex<Option<String>>,
    parent: Option<ShutdownNotifier>,
}

/// A cloneable shutdown flag with a reason.
///
/// Clones share the same flag. A [`child`](ShutdownNotifier::child) sees its
/// parent's shutdown, but shutting the child down leaves the parent running.
#[derive(Clone, Default)]
pub struct ShutdownNotifier {
    inner: Arc<Inner>,
}

impl fmt::Debug for ShutdownNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownNotifier")
            .field("requested", &self.should_shutdown())
            .field("reason", &self.reason())
            .finish()
    }
}

impl ShutdownNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                parent: Some(self.clone()),
                ..Inner::default()
            }),
        }
    }

    /// Requests shutdown. Only the first reason is kept.
    pub fn request_shutdown(&self, reason: impl Into<String>) {
        let mut guard = self.inner.reason.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            let reason = reason.into();
            info!("shutdown requested: {}", reason);
            *guard = Some(reason);
        }
        self.inner.requested.store(true, Ordering::SeqCst);
    }

    pub fn should_shutdown(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
            || self.inner.parent.as_ref().map_or(false, |p| p.should_shutdown())
    }

    /// Whether this notifier itself (not an ancestor) was shut down.
    pub fn is_shutdown_locally(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// The shutdown reason, own first, else the nearest ancestor's.
    pub fn reason(&self) -> Option<String> {
        let own = self.inner.reason.lock().unwrap_or_else(|e| e.into_inner()).clone();
        own.or_else(|| self.inner.parent.as_ref().and_then(|p| p.reason()))
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let n = ShutdownNotifier::new();
        assert!(!n.should_shutdown());
        assert_eq!(n.reason(), None);
        n.request_shutdown("time");
        n.request_shutdown("memory");
        assert!(n.should_shutdown());
        assert_eq!(n.reason().as_deref(), Some("time"));
    }

    #[test]
    fn test_clones_share_state() {
        let n = ShutdownNotifier::new();
        let m = n.clone();
        m.request_shutdown("stop");
        assert!(n.should_shutdown());
    }

    #[test]
    fn test_child_sees_parent() {
        let parent = ShutdownNotifier::new();
        let child = parent.child();
        child.request_shutdown("round limit");
        assert!(child.should_shutdown());
        assert!(!parent.should_shutdown());

        let other = parent.child();
        parent.request_shutdown("global limit");
        assert!(other.should_shutdown());
        assert!(!other.is_shutdown_locally());
        assert_eq!(other.reason().as_deref(), Some("global limit"));
        assert_eq!(child.reason().as_deref(), Some("round limit"));
    }

    #[test]
    fn test_across_threads() {
        let n = ShutdownNotifier::new();
        let m = n.clone();
        std::thread::spawn(move || m.request_shutdown("worker")).join().unwrap();
        assert!(n.should_shutdown());
    }
}
