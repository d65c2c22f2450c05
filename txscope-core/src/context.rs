//! Request-scoped context
//!
//! A `Context` is an immutable, cheaply clonable value that carries:
//! - typed key/value entries, looked up innermost-first
//! - an optional cancellation scope (explicit cancel and/or deadline),
//!   inherited by every context derived from it
//!
//! Deriving a context never mutates the parent.

use std::any::{Any, TypeId};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use tokio::sync::watch;
use tokio::time::Instant;

/// A typed context key.
///
/// Keys are types rather than strings, so a key defined in a private module
/// cannot be read or overwritten by anything outside it.
pub trait ContextKey: 'static {
    type Value: Send + Sync + 'static;
}

/// Why a context is done
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Cancelled {
    #[error("context cancelled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

struct Entry {
    key: TypeId,
    value: Arc<dyn Any + Send + Sync>,
    parent: Option<Arc<Entry>>,
}

struct CancelScope {
    flag: watch::Sender<bool>,
    deadline: Option<Instant>,
    parent: Option<Arc<CancelScope>>,
}

impl CancelScope {
    fn new(parent: Option<Arc<CancelScope>>, deadline: Option<Instant>) -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            flag,
            deadline,
            parent,
        }
    }

    fn err(&self) -> Option<Cancelled> {
        if *self.flag.borrow() {
            return Some(Cancelled::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some(Cancelled::DeadlineExceeded);
        }
        self.parent.as_ref().and_then(|p| p.err())
    }

    fn ancestry(self: &Arc<Self>) -> impl Iterator<Item = &Arc<CancelScope>> {
        std::iter::successors(Some(self), |s| s.parent.as_ref())
    }
}

/// Cancels the context returned alongside it by `Context::with_cancel`
/// and every context derived from that one.
#[derive(Clone)]
pub struct CancelHandle {
    scope: Arc<CancelScope>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.scope.flag.send_replace(true);
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &*self.scope.flag.borrow())
            .finish()
    }
}

/// Request-scoped context
#[derive(Clone, Default)]
pub struct Context {
    values: Option<Arc<Entry>>,
    cancel: Option<Arc<CancelScope>>,
}

impl Context {
    /// The empty root context: no values, never cancelled
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a context carrying `value` under key `K`.
    ///
    /// An existing entry for `K` is shadowed in the child, not replaced in the parent.
    pub fn with_value<K: ContextKey>(&self, value: K::Value) -> Self {
        Self {
            values: Some(Arc::new(Entry {
                key: TypeId::of::<K>(),
                value: Arc::new(value),
                parent: self.values.clone(),
            })),
            cancel: self.cancel.clone(),
        }
    }

    /// Innermost value stored under key `K`
    pub fn value<K: ContextKey>(&self) -> Option<&K::Value> {
        self.values::<K>().next()
    }

    /// Every value stored under key `K`, innermost first
    pub fn values<K: ContextKey>(&self) -> impl Iterator<Item = &K::Value> {
        let key = TypeId::of::<K>();
        std::iter::successors(self.values.as_deref(), |entry| entry.parent.as_deref())
            .filter(move |entry| entry.key == key)
            .filter_map(|entry| entry.value.downcast_ref::<K::Value>())
    }

    /// Derive a cancellable child context
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let scope = Arc::new(CancelScope::new(self.cancel.clone(), None));
        let ctx = Self {
            values: self.values.clone(),
            cancel: Some(scope.clone()),
        };
        (ctx, CancelHandle { scope })
    }

    /// Derive a child context that is done once `timeout` has elapsed
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self {
            values: self.values.clone(),
            cancel: Some(Arc::new(CancelScope::new(
                self.cancel.clone(),
                Some(deadline),
            ))),
        }
    }

    /// Same values, but never cancelled.
    ///
    /// Used for cleanup that must run even after the request was abandoned.
    pub fn without_cancel(&self) -> Self {
        Self {
            values: self.values.clone(),
            cancel: None,
        }
    }

    /// Earliest deadline of this context and its ancestors
    pub fn deadline(&self) -> Option<Instant> {
        self.cancel
            .as_ref()?
            .ancestry()
            .filter_map(|s| s.deadline)
            .min()
    }

    /// `Some` once the context is cancelled or past its deadline
    pub fn err(&self) -> Option<Cancelled> {
        self.cancel.as_ref().and_then(|s| s.err())
    }

    pub fn is_cancelled(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves when the context is done. Pending forever for contexts
    /// without a cancellation scope.
    pub async fn done(&self) -> Cancelled {
        let Some(scope) = &self.cancel else {
            return std::future::pending().await;
        };
        if let Some(reason) = self.err() {
            return reason;
        }

        let flags = select_all(scope.ancestry().map(|s| {
            let mut rx = s.flag.subscribe();
            Box::pin(async move {
                if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                    std::future::pending::<()>().await;
                }
            })
        }));

        match self.deadline() {
            Some(deadline) => tokio::select! {
                _ = flags => Cancelled::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Cancelled::DeadlineExceeded,
            },
            None => {
                flags.await;
                Cancelled::Cancelled
            }
        }
    }

    /// Drive `fut` unless the context is done first
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Cancelled> {
        if let Some(reason) = self.err() {
            return Err(reason);
        }
        tokio::select! {
            biased;
            reason = self.done() => Err(reason),
            out = fut => Ok(out),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut values = 0;
        let mut current = self.values.as_deref();
        while let Some(entry) = current {
            values += 1;
            current = entry.parent.as_deref();
        }
        f.debug_struct("Context")
            .field("values", &values)
            .field("deadline", &self.deadline())
            .field("err", &self.err())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RequestId;
    impl ContextKey for RequestId {
        type Value = String;
    }

    struct Attempt;
    impl ContextKey for Attempt {
        type Value = u32;
    }

    #[test]
    fn values_are_scoped_to_children() {
        let root = Context::background();
        let child = root.with_value::<RequestId>("req-1".into());
        let grandchild = child.with_value::<Attempt>(2);

        assert!(root.value::<RequestId>().is_none());
        assert_eq!(child.value::<RequestId>().map(String::as_str), Some("req-1"));
        assert_eq!(grandchild.value::<RequestId>().map(String::as_str), Some("req-1"));
        assert_eq!(grandchild.value::<Attempt>(), Some(&2));
        assert!(child.value::<Attempt>().is_none());
    }

    #[test]
    fn inner_value_shadows_outer() {
        let outer = Context::background().with_value::<Attempt>(1);
        let inner = outer.with_value::<Attempt>(2);
        assert_eq!(inner.value::<Attempt>(), Some(&2));
        assert_eq!(outer.value::<Attempt>(), Some(&1));
    }

    #[test]
    fn shadowed_values_stay_reachable() {
        let ctx = Context::background()
            .with_value::<Attempt>(1)
            .with_value::<RequestId>("req-1".into())
            .with_value::<Attempt>(2);

        let attempts: Vec<u32> = ctx.values::<Attempt>().copied().collect();
        assert_eq!(attempts, vec![2, 1]);
    }

    #[test]
    fn cancel_propagates_to_descendants_only() {
        let root = Context::background();
        let (parent, cancel) = root.with_cancel();
        let child = parent.with_value::<Attempt>(1);

        assert!(!child.is_cancelled());
        cancel.cancel();
        assert_eq!(child.err(), Some(Cancelled::Cancelled));
        assert!(!root.is_cancelled());
        assert!(!child.without_cancel().is_cancelled());
    }

    #[tokio::test]
    async fn done_resolves_on_parent_cancel() {
        let (parent, cancel) = Context::background().with_cancel();
        let (child, _child_cancel) = parent.with_cancel();

        let waiter = tokio::spawn(async move { child.done().await });
        cancel.cancel();
        assert_eq!(waiter.await.unwrap(), Cancelled::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn run_fails_after_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        let result = ctx
            .run(tokio::time::sleep(Duration::from_secs(10)))
            .await;
        assert_eq!(result, Err(Cancelled::DeadlineExceeded));
        assert_eq!(ctx.err(), Some(Cancelled::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn run_completes_before_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_secs(1));
        let result = ctx.run(async { 7 }).await;
        assert_eq!(result, Ok(7));
    }

    #[test]
    fn earliest_deadline_wins() {
        let near = Instant::now() + Duration::from_secs(1);
        let far = near + Duration::from_secs(10);
        let ctx = Context::background().with_deadline(near).with_deadline(far);
        assert_eq!(ctx.deadline(), Some(near));
    }
}
