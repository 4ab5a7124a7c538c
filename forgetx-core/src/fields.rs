// fields.rs
// Field names used in the Active Transaction Records and in the `txn`
// xattr block of documents under transactional mutation. These are kept
// as brief as possible: reducing the chance of a document overflowing
// matters more than human debuggability.

/// Map of attempt-id to entry inside an ATR document
pub const ATR_FIELD_ATTEMPTS: &str = "attempts";
/// Entry state
pub const ATR_FIELD_STATUS: &str = "st";
/// Start timestamp (written via the CAS macro)
pub const ATR_FIELD_START_TIMESTAMP: &str = "tst";
/// Expiration budget in ms
pub const ATR_FIELD_EXPIRES_AFTER_MSECS: &str = "exp";
/// Commit-start timestamp
pub const ATR_FIELD_START_COMMIT: &str = "tsc";
/// Commit-complete timestamp
pub const ATR_FIELD_TIMESTAMP_COMPLETE: &str = "tsco";
/// Rollback-start timestamp
pub const ATR_FIELD_TIMESTAMP_ROLLBACK_START: &str = "tsrs";
/// Rollback-complete timestamp
pub const ATR_FIELD_TIMESTAMP_ROLLBACK_COMPLETE: &str = "tsrc";
/// Transaction id, nested under the entry as `id.txn`
pub const ATR_FIELD_TRANSACTION_ID: &str = "id.txn";
/// Docs staged as inserts
pub const ATR_FIELD_DOCS_INSERTED: &str = "ins";
/// Docs staged as replaces
pub const ATR_FIELD_DOCS_REPLACED: &str = "rep";
/// Docs staged as removes
pub const ATR_FIELD_DOCS_REMOVED: &str = "rem";
/// Forward-compatibility directives on the entry
pub const ATR_FIELD_FORWARD_COMPAT: &str = "fc";
/// Collision marker inserted by cleanup before removing a PENDING entry
pub const ATR_FIELD_PENDING_SENTINEL: &str = "p";

// Per-document records inside ins/rep/rem
pub const ATR_FIELD_PER_DOC_ID: &str = "id";
pub const ATR_FIELD_PER_DOC_CAS: &str = "cas";
pub const ATR_FIELD_PER_DOC_BUCKET: &str = "bkt";
pub const ATR_FIELD_PER_DOC_SCOPE: &str = "scp";
pub const ATR_FIELD_PER_DOC_COLLECTION: &str = "col";

// Fields inside regular docs that are part of a transaction
pub const TXN_PREFIX_ONLY: &str = "txn";
pub const TXN_ID: &str = "txn.id.txn";
pub const TXN_ATTEMPT_ID: &str = "txn.id.atmpt";
pub const TXN_ATR_ID: &str = "txn.atr_id";
pub const TXN_ATR_BUCKET_NAME: &str = "txn.atr_bkt";
/// Holds "scope.collection" of the owning ATR
pub const TXN_ATR_COLL_NAME: &str = "txn.atr_coll";
pub const TXN_STAGED_DATA: &str = "txn.staged";
pub const TXN_OP_TYPE: &str = "txn.op.type";
pub const TXN_RESTORE_PREFIX_ONLY: &str = "txn.restore";
pub const TXN_RESTORE_CAS: &str = "txn.restore.CAS";
pub const TXN_RESTORE_REVID: &str = "txn.restore.revid";
pub const TXN_RESTORE_EXPTIME: &str = "txn.restore.exptime";
pub const TXN_CRC32_OF_STAGING: &str = "txn.crc32_staging";
pub const TXN_FORWARD_COMPAT: &str = "txn.fc";

/// Sentinel staged content marking a staged remove
pub const STAGED_DATA_REMOVED_VALUE: &str = "<<REMOVED>>";

// Operation type values stored at TXN_OP_TYPE
pub const OP_TYPE_INSERT: &str = "insert";
pub const OP_TYPE_REPLACE: &str = "replace";
pub const OP_TYPE_REMOVE: &str = "remove";

// Virtual xattrs resolved server-side
pub const VATTR_DOCUMENT: &str = "$document";
pub const VATTR_VBUCKET: &str = "$vbucket";

// The per-bucket client record used by lost-attempts cleanup
pub const CLIENT_RECORD_DOC_ID: &str = "_txn:client-record";
pub const FIELD_RECORDS: &str = "records";
pub const FIELD_CLIENTS: &str = "records.clients";
pub const FIELD_HEARTBEAT: &str = "heartbeat_ms";
pub const FIELD_EXPIRES: &str = "expires_ms";
pub const FIELD_NUM_ATRS: &str = "num_atrs";
pub const FIELD_OVERRIDE: &str = "override";
pub const FIELD_OVERRIDE_ENABLED: &str = "enabled";
pub const FIELD_OVERRIDE_EXPIRES: &str = "expires";
