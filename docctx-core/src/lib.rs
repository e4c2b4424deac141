//! docctx-core: transaction-transparent document access
//!
//! Application code reads and writes documents through the functions in
//! [`dispatch`], passing a [`Context`]. Inside [`run_transaction`] the same
//! calls join the transaction; outside it they run directly against the
//! database. The database itself is reached through the [`Client`] and
//! [`Transaction`] traits.

pub mod client;
pub mod context;
pub mod dispatch;
pub mod document;
pub mod error;

pub use client::{
    Client, DocumentRefStream, DocumentStream, Transaction, TransactionOptions, TransactionWork,
};
pub use context::Context;
pub use dispatch::{
    attach_client, client_of, collection, create, delete, doc, document_refs, documents, get,
    in_transaction, run_transaction, run_transaction_with, set, update,
};
pub use document::{
    CollectionRef, DocumentRef, DocumentSnapshot, FieldChange, Fields, Precondition, Query,
    SetOptions, Update, WriteResult,
};
pub use error::{Error, Result};
pub use tokio_util::sync::CancellationToken;
