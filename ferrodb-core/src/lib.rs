// ferrodb-core/src/lib.rs
// FerroDB engine: document store, B-tree secondary indexes, WAL-backed
// transactions with lock-based isolation, and a MongoDB-flavored query
// pipeline behind a framed binary command surface.

#![allow(clippy::too_many_arguments)]
#![allow(clippy::result_large_err)]
#![cfg_attr(test, allow(dead_code))]

pub mod batch;
pub mod btree;
pub mod catalog;
pub mod config;
pub mod cursor;
pub mod database;
pub mod document;
pub mod error;
pub mod index;
pub mod lock;
pub mod logging;
pub mod protocol;
pub mod query;
pub mod router;
pub mod store;
pub mod transaction;
pub mod update;
pub mod value_utils;
pub mod wal;

// Public exports
pub use batch::{BulkOp, BulkOptions, BulkReport};
pub use config::Config;
pub use cursor::{CursorManager, CursorReply};
pub use database::Database;
pub use document::{Document, DocumentId, DocumentMeta};
pub use error::{FerroError, Result};
pub use index::{IndexDefinition, IndexDirection, IndexField, IndexKey, IndexKind, IndexStats};
pub use lock::{CancellationToken, LockManager, LockMode, ResourceId, ResourceKind};
pub use protocol::{Frame, MessageType};
pub use query::{FilterExpr, Projection, Query};
pub use router::{AllowAll, CommandRouter, RequireAuth, SecurityContext, Session};
pub use store::{DocumentStore, WriteFailure};
pub use transaction::{
    IsolationLevel, Transaction, TransactionId, TransactionManager, TransactionState,
};
pub use wal::{WalManager, WalRecord, WalRecordKind};
