//! In-process implementation of the document client
//!
//! Direct calls apply immediately under the store lock. Transactions are
//! optimistic and retried on `Aborted` up to the configured attempt limit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use docctx_core::{
    in_transaction, Client, CollectionRef, Context, DocumentRef, DocumentRefStream,
    DocumentSnapshot, DocumentStream, Error, Fields, Precondition, Query, Result, SetOptions,
    Transaction, TransactionOptions, TransactionWork, Update, WriteResult,
};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::MemoryConfig;
use crate::journal::{Call, Journal, Mode, Op};
use crate::store::{Store, StoredDoc, Write};
use crate::transaction::MemoryTransaction;

pub(crate) fn lock_store(store: &Mutex<Store>) -> MutexGuard<'_, Store> {
    store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn into_fields(data: Value) -> Result<Fields> {
    match data {
        Value::Object(fields) => Ok(fields),
        other => Err(Error::invalid_argument(format!(
            "document data must be a map, got {other}"
        ))),
    }
}

pub(crate) fn snapshot(reference: DocumentRef, stored: &StoredDoc) -> DocumentSnapshot {
    DocumentSnapshot {
        reference,
        data: stored.data.clone(),
        create_time: stored.create_time,
        update_time: stored.update_time,
    }
}

/// Document database held in memory. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryClient {
    store: Arc<Mutex<Store>>,
    journal: Journal,
    config: MemoryConfig,
    next_tx: Arc<AtomicU64>,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MemoryConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Every call received so far.
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Stored fields of `path`, read without touching the journal.
    pub fn contents(&self, path: &str) -> Option<Fields> {
        lock_store(&self.store).get(path).map(|doc| doc.data.clone())
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        lock_store(&self.store).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Simulated round trip. Fails with the context's error when it is
    /// cancelled or past its deadline.
    async fn round_trip(&self, ctx: &Context) -> Result<()> {
        let latency = self.config.latency();
        if latency.is_zero() {
            return ctx.err().map_or(Ok(()), Err);
        }
        ctx.run(async {
            tokio::time::sleep(latency).await;
            Ok(())
        })
        .await
    }

    async fn write(&self, ctx: &Context, call: Call, write: Write) -> Result<WriteResult> {
        self.journal.record(call);
        self.round_trip(ctx).await?;
        let update_time = lock_store(&self.store).commit(&[write], Utc::now())?;
        Ok(WriteResult { update_time })
    }
}

#[async_trait]
impl Client for MemoryClient {
    async fn create(&self, ctx: &Context, doc: &DocumentRef, data: Value) -> Result<WriteResult> {
        let call = Call::new(Mode::Direct, Op::Create, doc.path()).with_data(data.clone());
        let write = Write::Create {
            path: doc.path().to_owned(),
            data: into_fields(data)?,
        };
        self.write(ctx, call, write).await
    }

    async fn delete(
        &self,
        ctx: &Context,
        doc: &DocumentRef,
        preconditions: &[Precondition],
    ) -> Result<WriteResult> {
        let call = Call::new(Mode::Direct, Op::Delete, doc.path());
        let write = Write::Delete {
            path: doc.path().to_owned(),
            preconditions: preconditions.to_vec(),
        };
        self.write(ctx, call, write).await
    }

    async fn get(&self, ctx: &Context, doc: &DocumentRef) -> Result<DocumentSnapshot> {
        self.journal
            .record(Call::new(Mode::Direct, Op::Get, doc.path()));
        self.round_trip(ctx).await?;
        match lock_store(&self.store).get(doc.path()) {
            Some(stored) => Ok(snapshot(doc.clone(), stored)),
            None => Err(Error::not_found(doc.path())),
        }
    }

    async fn set(
        &self,
        ctx: &Context,
        doc: &DocumentRef,
        data: Value,
        options: SetOptions,
    ) -> Result<WriteResult> {
        let call = Call::new(Mode::Direct, Op::Set, doc.path()).with_data(data.clone());
        let write = Write::Set {
            path: doc.path().to_owned(),
            data: into_fields(data)?,
            options,
        };
        self.write(ctx, call, write).await
    }

    async fn update(
        &self,
        ctx: &Context,
        doc: &DocumentRef,
        updates: Vec<Update>,
        preconditions: &[Precondition],
    ) -> Result<WriteResult> {
        let call = Call::new(Mode::Direct, Op::Update, doc.path());
        if updates.is_empty() {
            self.journal.record(call);
            return Err(Error::invalid_argument("update needs at least one field"));
        }
        let write = Write::Update {
            path: doc.path().to_owned(),
            updates,
            preconditions: preconditions.to_vec(),
        };
        self.write(ctx, call, write).await
    }

    fn documents(&self, ctx: &Context, query: &Query) -> DocumentStream {
        let collection = query.collection();
        self.journal
            .record(Call::new(Mode::Direct, Op::Documents, collection.path()));
        if let Some(err) = ctx.err() {
            return stream::once(async move { Err(err) }).boxed();
        }

        let store = lock_store(&self.store);
        let limit = query.max_results().unwrap_or(usize::MAX);
        let docs: Vec<_> = store
            .children(collection.path())
            .into_iter()
            .take(limit)
            .map(|(id, stored)| collection.doc(id).map(|doc| snapshot(doc, stored)))
            .collect();
        stream::iter(docs).boxed()
    }

    fn document_refs(&self, ctx: &Context, collection: &CollectionRef) -> DocumentRefStream {
        self.journal
            .record(Call::new(Mode::Direct, Op::DocumentRefs, collection.path()));
        if let Some(err) = ctx.err() {
            return stream::once(async move { Err(err) }).boxed();
        }

        let ids = lock_store(&self.store).child_ids(collection.path());
        let refs: Vec<_> = ids.iter().map(|id| collection.doc(id)).collect();
        stream::iter(refs).boxed()
    }

    async fn run_transaction<'w>(
        &self,
        ctx: &Context,
        options: TransactionOptions,
        mut work: TransactionWork<'w>,
    ) -> Result<()> {
        if in_transaction(ctx) {
            return Err(Error::failed_precondition(
                "nested transactions are not supported",
            ));
        }
        let max_attempts = options
            .max_attempts
            .unwrap_or(self.config.max_attempts)
            .max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.round_trip(ctx).await?;

            let id = self.next_tx.fetch_add(1, Ordering::SeqCst) + 1;
            let tx = Arc::new(MemoryTransaction::new(
                id,
                options.read_only,
                self.store.clone(),
                self.journal.clone(),
            ));
            debug!(tx = id, attempt, "transaction started");

            let handle: Arc<dyn Transaction> = tx.clone();
            let outcome = match work(handle).await {
                Ok(()) => match self.round_trip(ctx).await {
                    Ok(()) => tx.commit(),
                    Err(err) => {
                        tx.rollback();
                        Err(err)
                    }
                },
                Err(err) => {
                    tx.rollback();
                    Err(err)
                }
            };

            match outcome {
                Ok(()) => {
                    info!(tx = id, attempt, "transaction committed");
                    return Ok(());
                }
                Err(err) if err.is_aborted() && attempt < max_attempts => {
                    warn!(tx = id, attempt, error = %err, "transaction aborted, retrying");
                }
                Err(err) => {
                    info!(tx = id, attempt, error = %err, "transaction failed");
                    return Err(err);
                }
            }
        }
    }
}
