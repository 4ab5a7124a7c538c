// error.rs
//! Error taxonomy and classification for the transaction engine
//!
//! Every backend failure is classified into an [`ErrorClass`] before any
//! control-flow decision is made. Inside the engine, failures travel as
//! [`OperationFailed`] values carrying explicit retry / rollback /
//! final-outcome flags; the driver consumes the flags and translates them
//! into one of the public [`TransactionError`] variants. Operations never
//! surface raw backend errors.

use thiserror::Error;

use crate::kv::KvError;
use crate::transaction_context::TransactionResult;

/// Result alias used throughout the protocol layer
pub type OpResult<T> = std::result::Result<T, OperationFailed>;

/// Internal classification of a backend failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Temporary condition; the operation (or attempt) can be retried
    Transient,
    /// The mutation may or may not have been applied (timeout, durability
    /// ambiguity)
    Ambiguous,
    /// Document does not exist
    DocNotFound,
    /// Document already exists
    DocAlreadyExists,
    /// Sub-document path does not exist
    PathNotFound,
    /// Sub-document path already exists
    PathAlreadyExists,
    /// Optimistic concurrency check failed
    CasMismatch,
    /// Transaction budget exhausted
    Expiry,
    /// The ATR document cannot hold another entry
    AtrFull,
    /// Unrecoverable failure; never rolled back, never retried. Reserved
    /// for test injection.
    Hard,
    /// Another transaction's staged write blocks this document
    WriteWriteConflict,
    /// Everything else
    Other,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "FAIL_TRANSIENT",
            ErrorClass::Ambiguous => "FAIL_AMBIGUOUS",
            ErrorClass::DocNotFound => "FAIL_DOC_NOT_FOUND",
            ErrorClass::DocAlreadyExists => "FAIL_DOC_ALREADY_EXISTS",
            ErrorClass::PathNotFound => "FAIL_PATH_NOT_FOUND",
            ErrorClass::PathAlreadyExists => "FAIL_PATH_ALREADY_EXISTS",
            ErrorClass::CasMismatch => "FAIL_CAS_MISMATCH",
            ErrorClass::Expiry => "FAIL_EXPIRY",
            ErrorClass::AtrFull => "FAIL_ATR_FULL",
            ErrorClass::Hard => "FAIL_HARD",
            ErrorClass::WriteWriteConflict => "FAIL_WRITE_WRITE_CONFLICT",
            ErrorClass::Other => "FAIL_OTHER",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a backend call was a read or a mutation. Timeouts classify
/// differently: a timed-out mutation may have landed (ambiguous), a
/// timed-out read definitely has no side effect (transient).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Mutation,
}

/// Classify a raw KV error
pub fn classify(err: &KvError, kind: OpKind) -> ErrorClass {
    match err {
        KvError::DocumentNotFound => ErrorClass::DocNotFound,
        KvError::DocumentExists => ErrorClass::DocAlreadyExists,
        KvError::CasMismatch => ErrorClass::CasMismatch,
        KvError::PathNotFound => ErrorClass::PathNotFound,
        KvError::PathExists => ErrorClass::PathAlreadyExists,
        KvError::ValueTooLarge => ErrorClass::AtrFull,
        KvError::DurabilityAmbiguous(_) => ErrorClass::Ambiguous,
        KvError::Timeout => match kind {
            OpKind::Mutation => ErrorClass::Ambiguous,
            OpKind::Read => ErrorClass::Transient,
        },
        KvError::Transient(_) => ErrorClass::Transient,
        KvError::Internal(_) => ErrorClass::Other,
    }
}

/// A backend failure after classification. This is the error the protocol
/// code matches on; each call site decides per class whether to retry the
/// operation, retry the attempt, roll back, or fail hard.
#[derive(Debug, Clone, Error)]
#[error("{class}: {message}")]
pub struct ClientError {
    class: ErrorClass,
    message: String,
}

impl ClientError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        ClientError {
            class,
            message: message.into(),
        }
    }

    /// Classify and wrap a raw KV error
    pub fn from_kv(err: KvError, kind: OpKind) -> Self {
        let class = classify(&err, kind);
        ClientError {
            class,
            message: err.to_string(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.class
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Final outcome flag carried by [`OperationFailed`]; decides which public
/// error (if any) the driver raises once retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalErrorKind {
    /// Rolled back; data untouched
    Failed,
    /// Transaction budget exceeded
    Expired,
    /// Commit is durable but unstaging did not finish; not an error for
    /// the caller, cleanup finishes the job
    FailedPostCommit,
    /// Commit may or may not have persisted
    Ambiguous,
}

/// External cause vocabulary surfaced on terminal errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CauseKind {
    Unknown,
    PreviousOperationFailed,
    DocumentExists,
    DocumentNotFound,
    AtrNotFound,
    AtrEntryNotFound,
    AtrFull,
    ForwardCompatibilityFailure,
    CasMismatch,
}

fn cause_from_class(class: ErrorClass) -> CauseKind {
    match class {
        ErrorClass::DocAlreadyExists => CauseKind::DocumentExists,
        ErrorClass::DocNotFound => CauseKind::DocumentNotFound,
        ErrorClass::AtrFull => CauseKind::AtrFull,
        ErrorClass::CasMismatch => CauseKind::CasMismatch,
        _ => CauseKind::Unknown,
    }
}

/// Every failure inside an attempt is, or is converted to, one of these.
/// The driver consumes the flags to decide between retrying the
/// transaction, rolling back, or synthesizing a terminal error.
///
/// Flags are set through the builder methods; `retry` defaults to false,
/// `rollback` to true, the final outcome to [`FinalErrorKind::Failed`].
#[derive(Debug, Clone, Error)]
#[error("transaction operation failed ({class}): {message}")]
pub struct OperationFailed {
    class: ErrorClass,
    message: String,
    retry: bool,
    rollback: bool,
    to_raise: FinalErrorKind,
    cause: CauseKind,
}

impl OperationFailed {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        OperationFailed {
            class,
            message: message.into(),
            retry: false,
            rollback: true,
            to_raise: FinalErrorKind::Failed,
            cause: cause_from_class(class),
        }
    }

    /// Wrap a classified backend failure
    pub fn from_client(err: ClientError) -> Self {
        Self::new(err.class(), err.message().to_string())
    }

    /// Retry is false by default, this makes it true
    pub fn retry(mut self) -> Self {
        self.retry = true;
        self.validate();
        self
    }

    /// Rollback defaults to true, this sets it to false
    pub fn no_rollback(mut self) -> Self {
        self.rollback = false;
        self.validate();
        self
    }

    /// Defaults to Failed, this sets Expired
    pub fn expired(mut self) -> Self {
        self.to_raise = FinalErrorKind::Expired;
        self
    }

    /// Defaults to Failed, this sets FailedPostCommit
    pub fn failed_post_commit(mut self) -> Self {
        self.to_raise = FinalErrorKind::FailedPostCommit;
        self
    }

    /// Defaults to Failed, this sets Ambiguous
    pub fn ambiguous(mut self) -> Self {
        self.to_raise = FinalErrorKind::Ambiguous;
        self
    }

    pub fn cause(mut self, cause: CauseKind) -> Self {
        self.cause = cause;
        self
    }

    pub fn error_class(&self) -> ErrorClass {
        self.class
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn should_retry(&self) -> bool {
        self.retry
    }

    pub fn should_rollback(&self) -> bool {
        self.rollback
    }

    pub fn final_kind(&self) -> FinalErrorKind {
        self.to_raise
    }

    pub fn cause_kind(&self) -> CauseKind {
        self.cause
    }

    /// Translate into the public terminal error. FailedPostCommit does not
    /// map to an error: the commit is durable and the caller gets a normal
    /// result with `unstaging_complete = false`.
    pub fn into_terminal(self, result: TransactionResult) -> Option<TransactionError> {
        match self.to_raise {
            FinalErrorKind::FailedPostCommit => None,
            FinalErrorKind::Expired => Some(TransactionError::Expired {
                message: self.message,
                cause: self.cause,
                result,
            }),
            FinalErrorKind::Ambiguous => Some(TransactionError::CommitAmbiguous {
                message: self.message,
                cause: self.cause,
                result,
            }),
            FinalErrorKind::Failed => Some(TransactionError::Failed {
                message: self.message,
                cause: self.cause,
                result,
            }),
        }
    }

    // A retryable error implies rollback of the current attempt first.
    fn validate(&self) {
        debug_assert!(!(self.retry && !self.rollback));
    }
}

/// Terminal, user-visible outcome of a transaction that did not succeed
#[derive(Debug, Error)]
pub enum TransactionError {
    /// Rolled back; data untouched
    #[error("transaction failed: {message}")]
    Failed {
        message: String,
        cause: CauseKind,
        result: TransactionResult,
    },
    /// Budget exceeded; rollback was attempted
    #[error("transaction expired: {message}")]
    Expired {
        message: String,
        cause: CauseKind,
        result: TransactionResult,
    },
    /// The commit may or may not have persisted
    #[error("transaction commit ambiguous: {message}")]
    CommitAmbiguous {
        message: String,
        cause: CauseKind,
        result: TransactionResult,
    },
}

impl TransactionError {
    pub fn result(&self) -> &TransactionResult {
        match self {
            TransactionError::Failed { result, .. } => result,
            TransactionError::Expired { result, .. } => result,
            TransactionError::CommitAmbiguous { result, .. } => result,
        }
    }

    pub fn cause(&self) -> CauseKind {
        match self {
            TransactionError::Failed { cause, .. } => *cause,
            TransactionError::Expired { cause, .. } => *cause,
            TransactionError::CommitAmbiguous { cause, .. } => *cause,
        }
    }
}
