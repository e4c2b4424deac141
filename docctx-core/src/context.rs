//! Execution context: an immutable chain of scoped bindings
//!
//! A `Context` is passed explicitly down a call tree. Deriving a child never
//! touches the parent, so a binding added for one subtree is invisible to
//! siblings and ancestors. Lookups walk from the child toward the root and
//! the nearest binding wins.
//!
//! Besides typed values, a context carries a cancellation token and the
//! deadlines of every ancestor. Each cancellable context holds a child of
//! its nearest ancestor's token, so the nearest token alone tells whether
//! the context was cancelled.

use std::any::{Any, TypeId};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

#[derive(Clone, Default)]
pub struct Context {
    node: Option<Arc<Node>>,
}

struct Node {
    parent: Option<Arc<Node>>,
    entry: Entry,
}

enum Entry {
    Value {
        key: TypeId,
        value: Arc<dyn Any + Send + Sync>,
    },
    Cancel(CancellationToken),
    Deadline(Instant),
}

impl Context {
    /// Empty root context: no bindings, never cancelled, no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    fn child(&self, entry: Entry) -> Self {
        Self {
            node: Some(Arc::new(Node {
                parent: self.node.clone(),
                entry,
            })),
        }
    }

    /// Derive a context binding `value` under its type.
    ///
    /// A later binding of the same type shadows this one for descendants.
    pub fn with_value<T: Any + Send + Sync>(&self, value: T) -> Self {
        self.child(Entry::Value {
            key: TypeId::of::<T>(),
            value: Arc::new(value),
        })
    }

    /// Nearest binding of type `T`, if any.
    pub fn value<T: Any + Send + Sync>(&self) -> Option<&T> {
        let key = TypeId::of::<T>();
        self.entries().find_map(|entry| match entry {
            Entry::Value { key: k, value } if *k == key => value.downcast_ref::<T>(),
            _ => None,
        })
    }

    /// Derive a cancellable context. Cancelling the returned token cancels
    /// the new context and all of its descendants, never the parent.
    pub fn with_cancel(&self) -> (Self, CancellationToken) {
        let token = match self.token() {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        (self.child(Entry::Cancel(token.clone())), token)
    }

    /// Derive a context that expires at `deadline`. An earlier ancestor
    /// deadline still applies.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        self.child(Entry::Deadline(deadline))
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Earliest deadline in the chain.
    pub fn deadline(&self) -> Option<Instant> {
        self.entries()
            .filter_map(|entry| match entry {
                Entry::Deadline(at) => Some(*at),
                _ => None,
            })
            .min()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token().is_some_and(CancellationToken::is_cancelled)
    }

    /// `Some` once the context is done: `Cancelled` takes precedence over
    /// `DeadlineExceeded`.
    pub fn err(&self) -> Option<Error> {
        if self.is_cancelled() {
            return Some(Error::Cancelled);
        }
        match self.deadline() {
            Some(at) if Instant::now() >= at => Some(Error::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves when any ancestor is cancelled or the earliest deadline
    /// passes. Pending forever on a context with neither.
    pub async fn done(&self) {
        match (self.token(), self.deadline()) {
            (Some(token), Some(at)) => {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep_until(at) => {}
                }
            }
            (Some(token), None) => token.cancelled().await,
            (None, Some(at)) => tokio::time::sleep_until(at).await,
            (None, None) => std::future::pending().await,
        }
    }

    /// Run `fut` under this context, giving up with the context's error if
    /// it is cancelled or its deadline passes first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            _ = self.done() => Err(self.err().unwrap_or(Error::Cancelled)),
            out = fut => out,
        }
    }

    fn entries(&self) -> impl Iterator<Item = &Entry> {
        std::iter::successors(self.node.as_deref(), |node| node.parent.as_deref())
            .map(|node| &node.entry)
    }

    /// Nearest token; it is already linked to every ancestor token.
    fn token(&self) -> Option<&CancellationToken> {
        self.entries().find_map(|entry| match entry {
            Entry::Cancel(token) => Some(token),
            _ => None,
        })
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("depth", &self.entries().count())
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Tenant(&'static str);

    #[derive(Debug, PartialEq)]
    struct Region(&'static str);

    #[test]
    fn background_has_no_values() {
        let ctx = Context::background();
        assert_eq!(ctx.value::<Tenant>(), None);
        assert!(ctx.err().is_none());
        assert!(ctx.deadline().is_none());
    }

    #[test]
    fn child_shadows_parent() {
        let root = Context::background().with_value(Tenant("acme"));
        let child = root.with_value(Tenant("globex"));

        assert_eq!(child.value::<Tenant>(), Some(&Tenant("globex")));
        assert_eq!(root.value::<Tenant>(), Some(&Tenant("acme")));
    }

    #[test]
    fn lookup_walks_past_other_types() {
        let ctx = Context::background()
            .with_value(Tenant("acme"))
            .with_value(Region("eu"));

        assert_eq!(ctx.value::<Tenant>(), Some(&Tenant("acme")));
        assert_eq!(ctx.value::<Region>(), Some(&Region("eu")));
    }

    #[test]
    fn siblings_do_not_see_each_other() {
        let root = Context::background();
        let left = root.with_value(Tenant("left"));
        let right = root.with_value(Region("right"));

        assert_eq!(left.value::<Region>(), None);
        assert_eq!(right.value::<Tenant>(), None);
        assert_eq!(root.value::<Tenant>(), None);
    }

    #[test]
    fn cancel_reaches_descendants_not_parent() {
        let root = Context::background();
        let (cancellable, token) = root.with_cancel();
        let grandchild = cancellable.with_value(Tenant("acme"));

        token.cancel();

        assert_eq!(grandchild.err(), Some(Error::Cancelled));
        assert_eq!(cancellable.err(), Some(Error::Cancelled));
        assert!(root.err().is_none());
    }

    #[test]
    fn nested_cancel_follows_the_chain() {
        let (outer, outer_token) = Context::background().with_cancel();
        let (inner, inner_token) = outer.with_value(Tenant("acme")).with_cancel();
        let (sibling, _) = outer.with_cancel();

        inner_token.cancel();
        assert_eq!(inner.err(), Some(Error::Cancelled));
        assert!(outer.err().is_none());
        assert!(sibling.err().is_none());

        outer_token.cancel();
        assert_eq!(sibling.err(), Some(Error::Cancelled));
    }

    #[tokio::test]
    async fn done_wakes_on_ancestor_cancel() {
        let (outer, token) = Context::background().with_cancel();
        let (inner, _) = outer.with_cancel();
        let inner = inner.with_timeout(Duration::from_secs(3600));

        let waiter = tokio::spawn(async move { inner.done().await });
        tokio::task::yield_now().await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter not woken")
            .expect("task panicked");
    }

    #[tokio::test(start_paused = true)]
    async fn earliest_deadline_wins() {
        let outer = Context::background().with_timeout(Duration::from_secs(5));
        let inner = outer.with_timeout(Duration::from_secs(60));

        assert_eq!(inner.deadline(), outer.deadline());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(inner.err(), Some(Error::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_at_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_millis(50));

        let out = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert_eq!(out, Err(Error::DeadlineExceeded));
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let (ctx, token) = Context::background().with_cancel();
        let canceller = tokio::spawn(async move {
            tokio::task::yield_now().await;
            token.cancel();
        });

        let out: Result<()> = ctx.run(futures::future::pending()).await;

        assert_eq!(out, Err(Error::Cancelled));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn run_passes_result_through() {
        let ctx = Context::background();
        let out = ctx.run(async { Err::<(), _>(Error::not_found("a/b")) }).await;
        assert_eq!(out, Err(Error::not_found("a/b")));
    }
}
