//! docctx-memory: in-process document database
//!
//! Implements the `docctx_core` client contract entirely in memory, for
//! tests and local development. Every call is written to a [`Journal`] so
//! callers can check which form (direct or transactional) was used.

pub mod client;
pub mod config;
pub mod journal;
mod store;
pub mod transaction;

pub use client::MemoryClient;
pub use config::MemoryConfig;
pub use journal::{Call, Journal, Mode, Op};
pub use transaction::MemoryTransaction;
