//! Contract the dispatcher requires from the document database client.
//!
//! `Client` exposes the direct forms of every operation plus the transaction
//! runner; `Transaction` exposes the staged forms. Write semantics,
//! preconditions, consistency and commit/retry policy all live behind these
//! traits.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::context::Context;
use crate::document::{
    CollectionRef, DocumentRef, DocumentSnapshot, Precondition, Query, SetOptions, Update,
    WriteResult,
};
use crate::error::Result;

/// Documents produced by a query, errors surface while iterating
pub type DocumentStream = BoxStream<'static, Result<DocumentSnapshot>>;

/// Document references listed under a collection
pub type DocumentRefStream = BoxStream<'static, Result<DocumentRef>>;

/// Unit of work handed to [`Client::run_transaction`].
///
/// Called once per attempt with that attempt's transaction handle. Returning
/// an error asks the runner to roll back; whether it retries is up to the
/// runner.
pub type TransactionWork<'w> =
    Box<dyn FnMut(Arc<dyn Transaction>) -> BoxFuture<'w, Result<()>> + Send + 'w>;

/// Per-call transaction settings. `None` fields fall back to the client's
/// own defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    pub max_attempts: Option<u32>,
    pub read_only: bool,
}

impl TransactionOptions {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }
}

/// Entry point to the database service.
///
/// Direct forms take the ambient context so the client can honour its
/// cancellation and deadline.
#[async_trait]
pub trait Client: Send + Sync + 'static {
    async fn create(&self, ctx: &Context, doc: &DocumentRef, data: Value) -> Result<WriteResult>;

    async fn delete(
        &self,
        ctx: &Context,
        doc: &DocumentRef,
        preconditions: &[Precondition],
    ) -> Result<WriteResult>;

    async fn get(&self, ctx: &Context, doc: &DocumentRef) -> Result<DocumentSnapshot>;

    async fn set(
        &self,
        ctx: &Context,
        doc: &DocumentRef,
        data: Value,
        options: SetOptions,
    ) -> Result<WriteResult>;

    async fn update(
        &self,
        ctx: &Context,
        doc: &DocumentRef,
        updates: Vec<Update>,
        preconditions: &[Precondition],
    ) -> Result<WriteResult>;

    fn documents(&self, ctx: &Context, query: &Query) -> DocumentStream;

    fn document_refs(&self, ctx: &Context, collection: &CollectionRef) -> DocumentRefStream;

    /// Open a transaction, run `work` against it and commit, applying the
    /// client's own abort and retry policy.
    async fn run_transaction<'w>(
        &self,
        ctx: &Context,
        options: TransactionOptions,
        work: TransactionWork<'w>,
    ) -> Result<()>;
}

impl dyn Client {
    /// Resolve a collection path against this client.
    pub fn collection(self: &Arc<Self>, path: &str) -> Result<CollectionRef> {
        CollectionRef::new(self.clone(), path)
    }

    /// Resolve a document path against this client.
    pub fn doc(self: &Arc<Self>, path: &str) -> Result<DocumentRef> {
        DocumentRef::new(self.clone(), path)
    }
}

/// One open transaction.
///
/// Writes are staged and only take effect when the runner commits; reads
/// go to the database and take part in the transaction's consistency checks.
#[async_trait]
pub trait Transaction: Send + Sync {
    fn create(&self, doc: &DocumentRef, data: Value) -> Result<()>;

    fn delete(&self, doc: &DocumentRef, preconditions: &[Precondition]) -> Result<()>;

    async fn get(&self, doc: &DocumentRef) -> Result<DocumentSnapshot>;

    fn set(&self, doc: &DocumentRef, data: Value, options: SetOptions) -> Result<()>;

    fn update(
        &self,
        doc: &DocumentRef,
        updates: Vec<Update>,
        preconditions: &[Precondition],
    ) -> Result<()>;

    fn documents(&self, query: &Query) -> DocumentStream;

    fn document_refs(&self, collection: &CollectionRef) -> DocumentRefStream;
}
