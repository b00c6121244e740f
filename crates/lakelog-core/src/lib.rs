//! Core engine for a transactional, log-structured table format.
//!
//! A table is a directory of immutable data files plus an append-only log of
//! numbered commits under `_table_log/`. Each commit adds and removes file
//! references, replaces metadata or protocol, and records an audit entry;
//! replaying commits `0..=v` yields the table at version `v`.
//!
//! - `storage` / `layout`: the underlying store and the on-disk layout.
//! - `schema`: logical schemas and the schema evolution rules.
//! - `data`: row values and the built-in JSON-lines data file format.
//! - `transaction_log`: commit records, the log store and snapshots.
//! - `transaction`: optimistic, multi-writer commits.
//! - `merge`: copy-on-write upserts of a source batch.
//! - `maintenance`: small-file compaction and retention-based vacuum.
//! - `table`: the user-facing [`table::Table`] API.
//!
//! Front ends such as the `lakelog` CLI are expected to depend on this crate
//! rather than re-implementing the log and commit logic.
#![deny(missing_docs)]
pub mod data;
pub mod layout;
pub mod maintenance;
pub mod merge;
pub mod schema;
pub mod storage;
pub mod table;
pub mod transaction;
pub mod transaction_log;

pub use table::{Table, error::TableError};
