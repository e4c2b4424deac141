//! Transaction-transparent data access
//!
//! Every operation here takes the caller's [`Context`] and decides at call
//! time where to send it:
//!
//! - inside [`run_transaction`], the context carries the attempt's
//!   transaction handle and the call goes to the staged form on that handle;
//! - anywhere else, the call goes to the reference's direct form with the
//!   ambient context (for cancellation and deadline).
//!
//! Semantics and errors are the client's. Nothing is retried, wrapped or
//! translated here.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::client::{
    Client, DocumentRefStream, DocumentStream, Transaction, TransactionOptions, TransactionWork,
};
use crate::context::Context;
use crate::document::{
    CollectionRef, DocumentRef, DocumentSnapshot, Precondition, Query, SetOptions, Update,
};
use crate::error::{Error, Result};

struct ClientSlot(Arc<dyn Client>);

/// Transaction binding for one attempt. `open` is cleared when the attempt's
/// unit of work finishes, so contexts that escape it stop seeing the handle.
struct TransactionSlot {
    tx: Arc<dyn Transaction>,
    open: Arc<AtomicBool>,
    attempt: u32,
}

struct CloseOnDrop(Arc<AtomicBool>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Bind `client` to a derived context. Must happen before any operation
/// that resolves references or opens a transaction.
pub fn attach_client(ctx: &Context, client: Arc<dyn Client>) -> Context {
    ctx.with_value(ClientSlot(client))
}

/// Nearest client bound in the context chain.
pub fn client_of(ctx: &Context) -> Option<Arc<dyn Client>> {
    ctx.value::<ClientSlot>().map(|slot| slot.0.clone())
}

fn require_client(ctx: &Context) -> Result<Arc<dyn Client>> {
    client_of(ctx).ok_or(Error::ClientNotAttached)
}

/// Active transaction handle visible from `ctx`.
pub(crate) fn transaction_of(ctx: &Context) -> Option<Arc<dyn Transaction>> {
    let slot = ctx.value::<TransactionSlot>()?;
    if !slot.open.load(Ordering::SeqCst) {
        warn!(
            attempt = slot.attempt,
            "context outlived its transaction, using direct access"
        );
        return None;
    }
    Some(slot.tx.clone())
}

/// Whether calls made with `ctx` are routed into a transaction.
pub fn in_transaction(ctx: &Context) -> bool {
    transaction_of(ctx).is_some()
}

/// Run `work` inside a transaction opened by the bound client.
///
/// `work` receives a child of `ctx` carrying the transaction handle; pass
/// it to every operation that should join the transaction. The client may
/// call `work` more than once when it retries. The result is exactly what
/// the client's transaction runner returns.
pub async fn run_transaction<'w, F, Fut>(ctx: &Context, work: F) -> Result<()>
where
    F: FnMut(Context) -> Fut + Send + 'w,
    Fut: Future<Output = Result<()>> + Send + 'w,
{
    run_transaction_with(ctx, TransactionOptions::default(), work).await
}

/// [`run_transaction`] with explicit options.
pub async fn run_transaction_with<'w, F, Fut>(
    ctx: &Context,
    options: TransactionOptions,
    mut work: F,
) -> Result<()>
where
    F: FnMut(Context) -> Fut + Send + 'w,
    Fut: Future<Output = Result<()>> + Send + 'w,
{
    let client = require_client(ctx)?;
    let parent = ctx.clone();
    let mut attempt: u32 = 0;

    let bound: TransactionWork<'w> = Box::new(
        move |tx: Arc<dyn Transaction>| -> BoxFuture<'w, Result<()>> {
            attempt += 1;
            let open = Arc::new(AtomicBool::new(true));
            let guard = CloseOnDrop(open.clone());
            let tx_ctx = parent.with_value(TransactionSlot { tx, open, attempt });
            debug!(attempt, "running transaction attempt");
            let fut = work(tx_ctx);
            Box::pin(async move {
                let _guard = guard;
                fut.await
            })
        },
    );

    client.run_transaction(ctx, options, bound).await
}

/// Which form of an operation a call goes to.
enum Route {
    Transaction(Arc<dyn Transaction>),
    Direct,
}

fn route(ctx: &Context, op: &'static str, path: &str) -> Route {
    match transaction_of(ctx) {
        Some(tx) => {
            debug!(op, path, route = "transaction", "dispatch");
            Route::Transaction(tx)
        }
        None => {
            debug!(op, path, route = "direct", "dispatch");
            Route::Direct
        }
    }
}

fn to_value<T: Serialize + ?Sized>(data: &T) -> Result<Value> {
    serde_json::to_value(data).map_err(|e| Error::invalid_argument(e.to_string()))
}

/// Create `doc`; fails if it already exists.
pub async fn create<T: Serialize + ?Sized>(
    ctx: &Context,
    doc: &DocumentRef,
    data: &T,
) -> Result<()> {
    let data = to_value(data)?;
    match route(ctx, "create", doc.path()) {
        Route::Transaction(tx) => tx.create(doc, data),
        Route::Direct => doc.create(ctx, data).await.map(drop),
    }
}

/// Delete `doc`, subject to `preconditions`.
pub async fn delete(ctx: &Context, doc: &DocumentRef, preconditions: &[Precondition]) -> Result<()> {
    match route(ctx, "delete", doc.path()) {
        Route::Transaction(tx) => tx.delete(doc, preconditions),
        Route::Direct => doc.delete(ctx, preconditions).await.map(drop),
    }
}

/// Read `doc`.
pub async fn get(ctx: &Context, doc: &DocumentRef) -> Result<DocumentSnapshot> {
    match route(ctx, "get", doc.path()) {
        Route::Transaction(tx) => tx.get(doc).await,
        Route::Direct => doc.get(ctx).await,
    }
}

/// Write `data` to `doc`, combined with any existing fields per `options`.
pub async fn set<T: Serialize + ?Sized>(
    ctx: &Context,
    doc: &DocumentRef,
    data: &T,
    options: SetOptions,
) -> Result<()> {
    let data = to_value(data)?;
    match route(ctx, "set", doc.path()) {
        Route::Transaction(tx) => tx.set(doc, data, options),
        Route::Direct => doc.set(ctx, data, options).await.map(drop),
    }
}

/// Apply field `updates` to an existing `doc`, subject to `preconditions`.
pub async fn update(
    ctx: &Context,
    doc: &DocumentRef,
    updates: Vec<Update>,
    preconditions: &[Precondition],
) -> Result<()> {
    match route(ctx, "update", doc.path()) {
        Route::Transaction(tx) => tx.update(doc, updates, preconditions),
        Route::Direct => doc.update(ctx, updates, preconditions).await.map(drop),
    }
}

/// Documents matching `query`.
pub fn documents(ctx: &Context, query: &Query) -> DocumentStream {
    match route(ctx, "documents", query.collection().path()) {
        Route::Transaction(tx) => tx.documents(query),
        Route::Direct => query.documents(ctx),
    }
}

/// References to every document under `collection`.
pub fn document_refs(ctx: &Context, collection: &CollectionRef) -> DocumentRefStream {
    match route(ctx, "document_refs", collection.path()) {
        Route::Transaction(tx) => tx.document_refs(collection),
        Route::Direct => collection.document_refs(ctx),
    }
}

/// Resolve a collection path through the bound client.
pub fn collection(ctx: &Context, path: &str) -> Result<CollectionRef> {
    require_client(ctx)?.collection(path)
}

/// Resolve a document path through the bound client.
pub fn doc(ctx: &Context, path: &str) -> Result<DocumentRef> {
    require_client(ctx)?.doc(path)
}
