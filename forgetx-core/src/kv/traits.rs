// kv/traits.rs
//! KV backend abstraction for the transaction engine
//!
//! The engine is written against this trait and nothing else: connection
//! pooling, the wire protocol and per-RPC retry are a backend concern. The
//! trait is the whole vocabulary the protocol needs - plain get, one
//! sub-document lookup, one sub-document mutation, insert and remove.
//!
//! # Architecture
//!
//! ```text
//! KvClient trait (unified interface)
//!   ├── MemoryCluster (testing, in-memory DashMap)
//!   └── Production backends (wire protocol clients)
//! ```

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::config::DurabilityLevel;
use crate::document::DocId;

/// Backend failure before classification
#[derive(Debug, Clone, Error)]
pub enum KvError {
    #[error("document not found")]
    DocumentNotFound,
    #[error("document already exists")]
    DocumentExists,
    #[error("CAS mismatch")]
    CasMismatch,
    #[error("sub-document path not found")]
    PathNotFound,
    #[error("sub-document path already exists")]
    PathExists,
    #[error("value too large")]
    ValueTooLarge,
    #[error("durability requirement ambiguous: {0}")]
    DurabilityAmbiguous(String),
    #[error("operation timed out")]
    Timeout,
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type KvResult<T> = std::result::Result<T, KvError>;

/// One path of a sub-document lookup
#[derive(Debug, Clone)]
pub struct LookupInSpec {
    path: String,
    xattr: bool,
}

impl LookupInSpec {
    /// Fetch the value at `path`
    pub fn get(path: impl Into<String>) -> Self {
        LookupInSpec {
            path: path.into(),
            xattr: false,
        }
    }

    /// Fetch the whole document body
    pub fn full_document() -> Self {
        LookupInSpec {
            path: String::new(),
            xattr: false,
        }
    }

    /// Mark the path as an extended attribute
    pub fn xattr(mut self) -> Self {
        self.xattr = true;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_xattr(&self) -> bool {
        self.xattr
    }

    pub fn is_full_document(&self) -> bool {
        !self.xattr && self.path.is_empty()
    }
}

/// Sub-document operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutateOp {
    /// Create or overwrite the path
    Upsert,
    /// Create the path; fails with PathExists if present
    Insert,
    /// Remove the path; fails with PathNotFound if absent
    Remove,
    /// Replace the whole document body
    SetDoc,
}

/// Server-side macro expansions available for xattr values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutateMacro {
    /// `${Mutation.CAS}`: the CAS this very mutation is assigned,
    /// rendered as the server's little-endian hex string
    Cas,
    /// `${Mutation.value_crc32c}`: CRC32-C of the document value after
    /// this mutation
    ValueCrc32c,
}

/// One spec of a sub-document mutation
#[derive(Debug, Clone)]
pub struct MutateInSpec {
    op: MutateOp,
    path: String,
    value: Value,
    xattr: bool,
    create_path: bool,
    expand_macro: Option<MutateMacro>,
}

impl MutateInSpec {
    pub fn upsert(path: impl Into<String>, value: Value) -> Self {
        MutateInSpec {
            op: MutateOp::Upsert,
            path: path.into(),
            value,
            xattr: false,
            create_path: false,
            expand_macro: None,
        }
    }

    pub fn insert(path: impl Into<String>, value: Value) -> Self {
        MutateInSpec {
            op: MutateOp::Insert,
            path: path.into(),
            value,
            xattr: false,
            create_path: false,
            expand_macro: None,
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        MutateInSpec {
            op: MutateOp::Remove,
            path: path.into(),
            value: Value::Null,
            xattr: false,
            create_path: false,
            expand_macro: None,
        }
    }

    /// Replace the whole document body with `value`
    pub fn set_doc(value: Value) -> Self {
        MutateInSpec {
            op: MutateOp::SetDoc,
            path: String::new(),
            value,
            xattr: false,
            create_path: false,
            expand_macro: None,
        }
    }

    pub fn xattr(mut self) -> Self {
        self.xattr = true;
        self
    }

    pub fn create_path(mut self) -> Self {
        self.create_path = true;
        self
    }

    pub fn expand(mut self, mac: MutateMacro) -> Self {
        self.expand_macro = Some(mac);
        self
    }

    pub fn op(&self) -> MutateOp {
        self.op
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn is_xattr(&self) -> bool {
        self.xattr
    }

    pub fn creates_path(&self) -> bool {
        self.create_path
    }

    pub fn macro_expansion(&self) -> Option<MutateMacro> {
        self.expand_macro
    }
}

/// Store semantics of a whole mutate_in operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreSemantics {
    /// Document must exist
    #[default]
    Replace,
    /// Create if missing
    Upsert,
    /// Document must not exist
    Insert,
}

/// Options of a sub-document lookup
#[derive(Debug, Clone, Default)]
pub struct LookupInOptions {
    /// Allow reading tombstoned documents
    pub access_deleted: bool,
    pub timeout: Option<Duration>,
}

/// Options of a sub-document mutation
#[derive(Debug, Clone)]
pub struct MutateInOptions {
    /// 0 means no optimistic check
    pub cas: u64,
    pub durability: DurabilityLevel,
    /// Allow mutating tombstoned documents
    pub access_deleted: bool,
    /// Materialize a new document in tombstone state
    pub create_as_deleted: bool,
    pub store_semantics: StoreSemantics,
    pub timeout: Option<Duration>,
}

impl Default for MutateInOptions {
    fn default() -> Self {
        MutateInOptions {
            cas: 0,
            durability: DurabilityLevel::None,
            access_deleted: false,
            create_as_deleted: false,
            store_semantics: StoreSemantics::Replace,
            timeout: None,
        }
    }
}

/// Result of a plain get
#[derive(Debug, Clone)]
pub struct GetResult {
    pub cas: u64,
    pub content: Value,
}

/// One field of a lookup_in result. A missing path is a per-field miss,
/// not a whole-operation failure.
#[derive(Debug, Clone)]
pub struct SubdocField {
    value: Option<Value>,
}

/// Result of a sub-document lookup
#[derive(Debug, Clone)]
pub struct LookupInResult {
    cas: u64,
    is_deleted: bool,
    fields: Vec<SubdocField>,
}

impl LookupInResult {
    pub fn new(cas: u64, is_deleted: bool, values: Vec<Option<Value>>) -> Self {
        LookupInResult {
            cas,
            is_deleted,
            fields: values.into_iter().map(|value| SubdocField { value }).collect(),
        }
    }

    pub fn cas(&self) -> u64 {
        self.cas
    }

    /// Whether the document is a tombstone
    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    pub fn value(&self, idx: usize) -> Option<&Value> {
        self.fields.get(idx).and_then(|f| f.value.as_ref())
    }

    pub fn exists(&self, idx: usize) -> bool {
        self.fields.get(idx).map(|f| f.value.is_some()).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Result of a sub-document mutation
#[derive(Debug, Clone)]
pub struct MutateInResult {
    pub cas: u64,
}

/// The backend operations the engine consumes. Implementations must be
/// safe to share across the driver thread and the cleanup workers.
pub trait KvClient: Send + Sync {
    /// Plain full-document read. Never observes tombstones.
    fn get(&self, id: &DocId, timeout: Option<Duration>) -> KvResult<GetResult>;

    /// Sub-document lookup of one or more paths
    fn lookup_in(
        &self,
        id: &DocId,
        specs: &[LookupInSpec],
        opts: &LookupInOptions,
    ) -> KvResult<LookupInResult>;

    /// Sub-document mutation of one or more paths in a single atomic step
    fn mutate_in(
        &self,
        id: &DocId,
        specs: &[MutateInSpec],
        opts: &MutateInOptions,
    ) -> KvResult<MutateInResult>;

    /// Full-document insert; fails with DocumentExists on a live document
    fn insert(
        &self,
        id: &DocId,
        content: &Value,
        durability: DurabilityLevel,
        timeout: Option<Duration>,
    ) -> KvResult<MutateInResult>;

    /// Full-document remove with optimistic check (0 = unconditional)
    fn remove(
        &self,
        id: &DocId,
        cas: u64,
        durability: DurabilityLevel,
        timeout: Option<Duration>,
    ) -> KvResult<()>;

    /// Buckets reachable through this client; drives per-bucket cleanup
    fn bucket_names(&self) -> Vec<String>;
}
