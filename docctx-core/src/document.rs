//! Opaque handles into the document database.
//!
//! References identify a location; they hold the client they were resolved
//! from so their direct (non-transactional) forms can run without a context
//! lookup. Equality, hashing and `Debug` only consider the path.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::client::{Client, DocumentRefStream, DocumentStream};
use crate::context::Context;
use crate::error::{Error, Result};

/// Field map of a stored document
pub type Fields = Map<String, Value>;

fn split_path(path: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = path.split('/').collect();
    if path.is_empty() || segments.iter().any(|s| s.is_empty()) {
        return Err(Error::invalid_argument(format!(
            "malformed path '{path}'"
        )));
    }
    Ok(segments)
}

/// Reference to a collection (odd number of path segments)
#[derive(Clone)]
pub struct CollectionRef {
    client: Arc<dyn Client>,
    path: String,
}

impl CollectionRef {
    pub(crate) fn new(client: Arc<dyn Client>, path: &str) -> Result<Self> {
        if split_path(path)?.len() % 2 == 0 {
            return Err(Error::invalid_argument(format!(
                "'{path}' is a document path, not a collection path"
            )));
        }
        Ok(Self {
            client,
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Last path segment
    pub fn id(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Document this collection is nested under, `None` at the top level.
    pub fn parent(&self) -> Option<DocumentRef> {
        let (parent, _) = self.path.rsplit_once('/')?;
        Some(DocumentRef {
            client: self.client.clone(),
            path: parent.to_owned(),
        })
    }

    /// Child document with the given id.
    pub fn doc(&self, id: &str) -> Result<DocumentRef> {
        if id.is_empty() || id.contains('/') {
            return Err(Error::invalid_argument(format!(
                "invalid document id '{id}'"
            )));
        }
        Ok(DocumentRef {
            client: self.client.clone(),
            path: format!("{}/{id}", self.path),
        })
    }

    /// Child document with a freshly generated id.
    pub fn new_doc(&self) -> DocumentRef {
        DocumentRef {
            client: self.client.clone(),
            path: format!("{}/{}", self.path, Uuid::new_v4().simple()),
        }
    }

    /// Query over every document of this collection.
    pub fn query(&self) -> Query {
        Query {
            collection: self.clone(),
            limit: None,
        }
    }

    pub fn limit(&self, limit: usize) -> Query {
        self.query().limit(limit)
    }

    /// Direct form: every document of the collection.
    pub fn documents(&self, ctx: &Context) -> DocumentStream {
        self.query().documents(ctx)
    }

    /// Direct form: references to every document of the collection,
    /// including ones that only exist as parents of subcollections.
    pub fn document_refs(&self, ctx: &Context) -> DocumentRefStream {
        self.client.document_refs(ctx, self)
    }

    pub(crate) fn client(&self) -> &Arc<dyn Client> {
        &self.client
    }
}

/// Reference to a document (even number of path segments)
#[derive(Clone)]
pub struct DocumentRef {
    client: Arc<dyn Client>,
    path: String,
}

impl DocumentRef {
    pub(crate) fn new(client: Arc<dyn Client>, path: &str) -> Result<Self> {
        if split_path(path)?.len() % 2 != 0 {
            return Err(Error::invalid_argument(format!(
                "'{path}' is a collection path, not a document path"
            )));
        }
        Ok(Self {
            client,
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn id(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Collection holding this document.
    pub fn parent(&self) -> CollectionRef {
        let parent = self
            .path
            .rsplit_once('/')
            .map(|(parent, _)| parent)
            .unwrap_or_default();
        CollectionRef {
            client: self.client.clone(),
            path: parent.to_owned(),
        }
    }

    /// Subcollection under this document.
    pub fn collection(&self, id: &str) -> Result<CollectionRef> {
        if id.is_empty() || id.contains('/') {
            return Err(Error::invalid_argument(format!(
                "invalid collection id '{id}'"
            )));
        }
        Ok(CollectionRef {
            client: self.client.clone(),
            path: format!("{}/{id}", self.path),
        })
    }

    pub async fn create(&self, ctx: &Context, data: Value) -> Result<WriteResult> {
        self.client.create(ctx, self, data).await
    }

    pub async fn delete(
        &self,
        ctx: &Context,
        preconditions: &[Precondition],
    ) -> Result<WriteResult> {
        self.client.delete(ctx, self, preconditions).await
    }

    pub async fn get(&self, ctx: &Context) -> Result<DocumentSnapshot> {
        self.client.get(ctx, self).await
    }

    pub async fn set(&self, ctx: &Context, data: Value, options: SetOptions) -> Result<WriteResult> {
        self.client.set(ctx, self, data, options).await
    }

    pub async fn update(
        &self,
        ctx: &Context,
        updates: Vec<Update>,
        preconditions: &[Precondition],
    ) -> Result<WriteResult> {
        self.client.update(ctx, self, updates, preconditions).await
    }
}

/// Read over a collection. Only the result size can be narrowed here;
/// filtering and ordering belong to the client.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Query {
    collection: CollectionRef,
    limit: Option<usize>,
}

impl Query {
    pub fn collection(&self) -> &CollectionRef {
        &self.collection
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn max_results(&self) -> Option<usize> {
        self.limit
    }

    /// Direct form: run the query outside any transaction.
    pub fn documents(&self, ctx: &Context) -> DocumentStream {
        self.collection.client().documents(ctx, self)
    }
}

macro_rules! path_identity {
    ($ty:ident) => {
        impl PartialEq for $ty {
            fn eq(&self, other: &Self) -> bool {
                self.path == other.path
            }
        }

        impl Eq for $ty {}

        impl Hash for $ty {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.path.hash(state);
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($ty)).field(&self.path).finish()
            }
        }
    };
}

path_identity!(CollectionRef);
path_identity!(DocumentRef);

/// Contents of an existing document at read time
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    pub reference: DocumentRef,
    pub data: Fields,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl DocumentSnapshot {
    /// Value at a dotted field path (`address.city`).
    pub fn field(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = self.data.get(parts.next()?)?;
        parts.try_fold(first, |value, part| value.as_object()?.get(part))
    }

    /// Decode the document into `T`.
    pub fn data_to<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.data.clone()))
    }
}

/// Outcome of a committed write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    pub update_time: DateTime<Utc>,
}

/// Condition checked by the client before a delete or update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// The document must exist
    Exists,
    /// The document must have been last written at exactly this time
    UpdateTime(DateTime<Utc>),
}

/// How `set` combines the payload with an existing document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SetOptions {
    /// Replace the whole document
    #[default]
    Overwrite,
    /// Merge every field of the payload, recursing into maps
    MergeAll,
    /// Only write the listed dotted field paths from the payload
    Merge(Vec<String>),
}

/// One field change applied by `update`
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    /// Dotted field path
    pub field: String,
    pub change: FieldChange,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldChange {
    Set(Value),
    Delete,
}

impl Update {
    pub fn set(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            change: FieldChange::Set(value.into()),
        }
    }

    pub fn delete(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            change: FieldChange::Delete,
        }
    }
}
