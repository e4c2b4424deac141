//! Optimistic transactions over the in-memory store
//!
//! Reads go straight to the store and remember the version they saw.
//! Listings also remember which ids the collection held. Writes are staged.
//! Commit fails with `Aborted` if any document read has changed or any
//! listed collection gained or lost a member since, otherwise it applies
//! the staged writes as one batch.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use docctx_core::{
    CollectionRef, DocumentRef, DocumentRefStream, DocumentSnapshot, DocumentStream, Error,
    Precondition, Query, Result, SetOptions, Transaction, Update,
};
use futures::stream::{self, StreamExt};
use serde_json::Value;

use crate::client::{into_fields, lock_store, snapshot};
use crate::journal::{Call, Journal, Mode, Op};
use crate::store::{Store, Write};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum Listing {
    Documents,
    DocumentRefs,
}

impl Listing {
    fn ids(self, store: &Store, collection: &str) -> BTreeSet<String> {
        match self {
            Listing::Documents => store
                .children(collection)
                .into_iter()
                .map(|(id, _)| id.to_owned())
                .collect(),
            Listing::DocumentRefs => store.child_ids(collection),
        }
    }
}

#[derive(Default)]
struct Pending {
    /// Version observed for every path read
    reads: HashMap<String, u64>,
    /// Members observed for every collection listed
    listings: HashMap<(String, Listing), BTreeSet<String>>,
    writes: Vec<Write>,
}

pub struct MemoryTransaction {
    id: u64,
    read_only: bool,
    store: Arc<Mutex<Store>>,
    journal: Journal,
    pending: Mutex<Pending>,
}

impl MemoryTransaction {
    pub(crate) fn new(id: u64, read_only: bool, store: Arc<Mutex<Store>>, journal: Journal) -> Self {
        Self {
            id,
            read_only,
            store,
            journal,
            pending: Mutex::new(Pending::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, op: Op, target: &str) -> Call {
        Call::new(Mode::Transaction(self.id), op, target)
    }

    fn stage(&self, write: Write) -> Result<()> {
        if self.read_only {
            return Err(Error::invalid_argument(
                "read-only transaction cannot write",
            ));
        }
        self.pending().writes.push(write);
        Ok(())
    }

    fn ensure_no_writes(&self) -> Result<()> {
        if self.pending().writes.is_empty() {
            Ok(())
        } else {
            Err(Error::invalid_argument(
                "transaction reads must happen before any writes",
            ))
        }
    }

    /// Validate reads and apply staged writes.
    pub(crate) fn commit(&self) -> Result<()> {
        self.journal.record(self.record(Op::Commit, ""));
        let pending = std::mem::take(&mut *self.pending());
        let mut store = lock_store(&self.store);

        for (path, seen) in &pending.reads {
            if store.version(path) != *seen {
                return Err(Error::aborted(format!(
                    "'{path}' changed since it was read"
                )));
            }
        }
        for ((collection, listing), seen) in &pending.listings {
            if listing.ids(&store, collection) != *seen {
                return Err(Error::aborted(format!(
                    "'{collection}' changed since it was listed"
                )));
            }
        }
        if pending.writes.is_empty() {
            return Ok(());
        }
        store.commit(&pending.writes, Utc::now()).map(drop)
    }

    /// Discard staged writes.
    pub(crate) fn rollback(&self) {
        self.journal.record(self.record(Op::Rollback, ""));
        *self.pending() = Pending::default();
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    fn create(&self, doc: &DocumentRef, data: Value) -> Result<()> {
        self.journal
            .record(self.record(Op::Create, doc.path()).with_data(data.clone()));
        self.stage(Write::Create {
            path: doc.path().to_owned(),
            data: into_fields(data)?,
        })
    }

    fn delete(&self, doc: &DocumentRef, preconditions: &[Precondition]) -> Result<()> {
        self.journal.record(self.record(Op::Delete, doc.path()));
        self.stage(Write::Delete {
            path: doc.path().to_owned(),
            preconditions: preconditions.to_vec(),
        })
    }

    async fn get(&self, doc: &DocumentRef) -> Result<DocumentSnapshot> {
        self.journal.record(self.record(Op::Get, doc.path()));
        self.ensure_no_writes()?;

        let store = lock_store(&self.store);
        self.pending()
            .reads
            .insert(doc.path().to_owned(), store.version(doc.path()));
        match store.get(doc.path()) {
            Some(stored) => Ok(snapshot(doc.clone(), stored)),
            None => Err(Error::not_found(doc.path())),
        }
    }

    fn set(&self, doc: &DocumentRef, data: Value, options: SetOptions) -> Result<()> {
        self.journal
            .record(self.record(Op::Set, doc.path()).with_data(data.clone()));
        self.stage(Write::Set {
            path: doc.path().to_owned(),
            data: into_fields(data)?,
            options,
        })
    }

    fn update(
        &self,
        doc: &DocumentRef,
        updates: Vec<Update>,
        preconditions: &[Precondition],
    ) -> Result<()> {
        self.journal.record(self.record(Op::Update, doc.path()));
        if updates.is_empty() {
            return Err(Error::invalid_argument("update needs at least one field"));
        }
        self.stage(Write::Update {
            path: doc.path().to_owned(),
            updates,
            preconditions: preconditions.to_vec(),
        })
    }

    fn documents(&self, query: &Query) -> DocumentStream {
        let collection = query.collection();
        self.journal
            .record(self.record(Op::Documents, collection.path()));
        if let Err(err) = self.ensure_no_writes() {
            return stream::once(async move { Err(err) }).boxed();
        }

        let store = lock_store(&self.store);
        let mut pending = self.pending();
        pending.listings.insert(
            (collection.path().to_owned(), Listing::Documents),
            Listing::Documents.ids(&store, collection.path()),
        );
        let mut docs = Vec::new();
        for (id, stored) in store.children(collection.path()) {
            if query.max_results().is_some_and(|limit| docs.len() >= limit) {
                break;
            }
            pending.reads.insert(format!("{}/{id}", collection.path()), stored.version);
            docs.push(collection.doc(id).map(|doc| snapshot(doc, stored)));
        }
        stream::iter(docs).boxed()
    }

    fn document_refs(&self, collection: &CollectionRef) -> DocumentRefStream {
        self.journal
            .record(self.record(Op::DocumentRefs, collection.path()));
        if let Err(err) = self.ensure_no_writes() {
            return stream::once(async move { Err(err) }).boxed();
        }

        let ids = lock_store(&self.store).child_ids(collection.path());
        let refs: Vec<_> = ids.iter().map(|id| collection.doc(id)).collect();
        self.pending()
            .listings
            .insert((collection.path().to_owned(), Listing::DocumentRefs), ids);
        stream::iter(refs).boxed()
    }
}
