// forgetx-core/src/lib.rs
// Client-side engine for multi-document ACID transactions over a
// distributed key-value store with xattrs, sub-document mutations and
// CAS-based optimistic concurrency.
//
// The engine stages every mutation in document xattrs, coordinates the
// commit through an Active Transaction Record (ATR), and repairs
// transactions abandoned by crashed clients with two background cleanup
// subsystems. Readers outside a transaction never observe a partially
// applied commit.

#![cfg_attr(test, allow(dead_code))]

pub mod atr;
pub mod atr_ids;
pub mod attempt_context;
pub mod attempt_state;
pub mod cleanup;
pub mod config;
pub mod document;
pub mod error;
pub mod fields;
pub mod forward_compat;
pub mod hooks;
pub mod kv;
pub mod logging;
pub mod staged_mutation;
pub mod transaction_context;
pub mod transactions;
pub mod uid;
pub mod util;

// Public exports
pub use attempt_context::AttemptContext;
pub use attempt_state::AttemptState;
pub use cleanup::{AtrCleanupQueue, LostAttemptsCleanup, TransactionsCleanup};
pub use config::{DurabilityLevel, TransactionConfig};
pub use document::{DocId, DocumentMetadata, TransactionGetResult, TransactionLinks};
pub use error::{
    CauseKind, ClientError, ErrorClass, FinalErrorKind, OperationFailed, TransactionError,
};
pub use kv::{KvClient, KvError, MemoryCluster};
pub use logging::{set_log_level, set_target_level, LogLevel, LogTarget};
pub use staged_mutation::{StagedMutation, StagedMutationQueue, StagedMutationType};
pub use transaction_context::{TransactionAttempt, TransactionContext, TransactionResult};
pub use transactions::Transactions;
