// kv/memory.rs
//! In-memory KV backend for fast testing
//!
//! Implements the full semantics the engine depends on: xattr trees,
//! tombstones (`create_as_deleted` / `access_deleted`), CAS as an HLC
//! reading in nanoseconds, `${Mutation.CAS}` and `${Mutation.value_crc32c}`
//! macro expansion, and the `$document` / `$vbucket` virtual xattrs.
//!
//! # Architecture
//!
//! ```text
//! MemoryCluster (KvClient implementation)
//!      ↓
//! DashMap<DocId, StoredDoc> (body + xattr tree + cas + tombstone flag)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{Map, Value};

use crate::config::DurabilityLevel;
use crate::document::DocId;
use crate::util::{crc32_hex, mutation_cas_macro, now_ns};

use super::traits::{
    GetResult, KvClient, KvError, KvResult, LookupInOptions, LookupInResult, LookupInSpec,
    MutateInOptions, MutateInResult, MutateInSpec, MutateMacro, MutateOp, StoreSemantics,
};

#[derive(Debug, Clone)]
struct StoredDoc {
    /// None models an empty body (metadata-only docs, tombstones)
    body: Option<Value>,
    /// Xattr tree, always an object
    xattrs: Value,
    cas: u64,
    revid: u64,
    /// Tombstone: invisible to plain gets, reachable with access_deleted
    tombstone: bool,
}

impl StoredDoc {
    fn body_bytes(&self) -> Vec<u8> {
        match &self.body {
            Some(value) => serde_json::to_vec(value).unwrap_or_default(),
            None => Vec::new(),
        }
    }

    fn document_vattr(&self) -> Value {
        serde_json::json!({
            "CAS": format!("0x{:016x}", self.cas),
            "revid": self.revid.to_string(),
            "exptime": 0,
            "value_crc32c": crc32_hex(&self.body_bytes()),
        })
    }
}

/// In-memory cluster used by the test suite. Safe to share across the
/// driver thread and the cleanup workers.
pub struct MemoryCluster {
    buckets: Vec<String>,
    docs: DashMap<DocId, StoredDoc>,
    clock: AtomicU64,
}

impl MemoryCluster {
    pub fn new(buckets: Vec<String>) -> Self {
        MemoryCluster {
            buckets,
            docs: DashMap::new(),
            clock: AtomicU64::new(0),
        }
    }

    /// Single-bucket cluster, the common test fixture
    pub fn single_bucket(bucket: impl Into<String>) -> Self {
        MemoryCluster::new(vec![bucket.into()])
    }

    /// Next CAS: a monotonically increasing HLC reading in ns
    fn next_cas(&self) -> u64 {
        let now = now_ns();
        self.clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .map(|last| now.max(last + 1))
            .unwrap_or(now)
    }

    fn vbucket_vattr(&self) -> Value {
        let now_secs = now_ns() / 1_000_000_000;
        serde_json::json!({ "HLC": { "now": now_secs.to_string() } })
    }

    /// Number of documents currently stored, tombstones included
    pub fn doc_count(&self) -> usize {
        self.docs.len()
    }
}

// ============================================================================
// XATTR PATH NAVIGATION (dot-separated object paths)
// ============================================================================

fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    value.as_object_mut().expect("just set to object")
}

/// Walk to the parent of the final segment, creating intermediate objects
/// when `create` is set. Errors with PathNotFound otherwise.
fn walk_to_parent<'a>(
    root: &'a mut Value,
    path: &str,
    create: bool,
) -> KvResult<(&'a mut Map<String, Value>, String)> {
    let mut parts: Vec<&str> = path.split('.').collect();
    let last = parts.pop().expect("path is never empty here").to_string();
    let mut current = root;
    for part in parts {
        let map = ensure_object(current);
        if !map.contains_key(part) {
            if !create {
                return Err(KvError::PathNotFound);
            }
            map.insert(part.to_string(), Value::Object(Map::new()));
        }
        current = map.get_mut(part).expect("inserted above");
    }
    Ok((ensure_object(current), last))
}

fn set_path(root: &mut Value, path: &str, value: Value, create: bool) -> KvResult<()> {
    let (parent, last) = walk_to_parent(root, path, create)?;
    parent.insert(last, value);
    Ok(())
}

fn insert_path(root: &mut Value, path: &str, value: Value, create: bool) -> KvResult<()> {
    let (parent, last) = walk_to_parent(root, path, create)?;
    if parent.contains_key(&last) {
        return Err(KvError::PathExists);
    }
    parent.insert(last, value);
    Ok(())
}

fn remove_path(root: &mut Value, path: &str) -> KvResult<()> {
    let mut parts: Vec<&str> = path.split('.').collect();
    let last = parts.pop().expect("path is never empty here");
    let mut current = root;
    for part in parts {
        current = current
            .as_object_mut()
            .and_then(|m| m.get_mut(part))
            .ok_or(KvError::PathNotFound)?;
    }
    current
        .as_object_mut()
        .and_then(|m| m.remove(last))
        .ok_or(KvError::PathNotFound)?;
    Ok(())
}

// ============================================================================
// MUTATION APPLICATION
// ============================================================================

/// Apply the spec list to a working copy of the document. Errors leave the
/// stored document untouched (the caller only commits on success).
fn apply_specs(doc: &mut StoredDoc, specs: &[MutateInSpec], new_cas: u64) -> KvResult<()> {
    // Body first: the crc macro reflects the value after this mutation
    for spec in specs {
        if spec.op() == MutateOp::SetDoc {
            doc.body = Some(spec.value().clone());
            doc.tombstone = false;
        }
    }
    let crc = crc32_hex(&doc.body_bytes());

    for spec in specs {
        if spec.op() == MutateOp::SetDoc {
            continue;
        }
        if !spec.is_xattr() {
            return Err(KvError::Internal(
                "non-xattr sub-document paths are not supported".to_string(),
            ));
        }
        let value = match spec.macro_expansion() {
            Some(MutateMacro::Cas) => Value::String(mutation_cas_macro(new_cas)),
            Some(MutateMacro::ValueCrc32c) => Value::String(crc.clone()),
            None => spec.value().clone(),
        };
        match spec.op() {
            MutateOp::Upsert => set_path(&mut doc.xattrs, spec.path(), value, spec.creates_path())?,
            MutateOp::Insert => {
                insert_path(&mut doc.xattrs, spec.path(), value, spec.creates_path())?
            }
            MutateOp::Remove => remove_path(&mut doc.xattrs, spec.path())?,
            MutateOp::SetDoc => unreachable!(),
        }
    }

    doc.cas = new_cas;
    doc.revid += 1;
    Ok(())
}

fn empty_xattrs(xattrs: &Value) -> bool {
    xattrs.as_object().map(|m| m.is_empty()).unwrap_or(true)
}

impl KvClient for MemoryCluster {
    fn get(&self, id: &DocId, _timeout: Option<Duration>) -> KvResult<GetResult> {
        let doc = self.docs.get(id).ok_or(KvError::DocumentNotFound)?;
        if doc.tombstone {
            return Err(KvError::DocumentNotFound);
        }
        Ok(GetResult {
            cas: doc.cas,
            content: doc.body.clone().unwrap_or(Value::Null),
        })
    }

    fn lookup_in(
        &self,
        id: &DocId,
        specs: &[LookupInSpec],
        opts: &LookupInOptions,
    ) -> KvResult<LookupInResult> {
        let doc = self.docs.get(id).ok_or(KvError::DocumentNotFound)?;
        if doc.tombstone && !opts.access_deleted {
            return Err(KvError::DocumentNotFound);
        }
        let values = specs
            .iter()
            .map(|spec| {
                if spec.is_full_document() {
                    doc.body.clone()
                } else if spec.path() == crate::fields::VATTR_DOCUMENT {
                    Some(doc.document_vattr())
                } else if spec.path() == crate::fields::VATTR_VBUCKET {
                    Some(self.vbucket_vattr())
                } else {
                    get_path(&doc.xattrs, spec.path()).cloned()
                }
            })
            .collect();
        Ok(LookupInResult::new(doc.cas, doc.tombstone, values))
    }

    fn mutate_in(
        &self,
        id: &DocId,
        specs: &[MutateInSpec],
        opts: &MutateInOptions,
    ) -> KvResult<MutateInResult> {
        let new_cas = self.next_cas();
        match self.docs.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get();
                if existing.tombstone
                    && !opts.access_deleted
                    && opts.store_semantics != StoreSemantics::Insert
                {
                    return Err(KvError::DocumentNotFound);
                }
                match opts.store_semantics {
                    StoreSemantics::Insert => {
                        // Overwriting an existing doc with insert semantics
                        // is only allowed as a CAS-carrying tombstone
                        // overwrite
                        if opts.cas == 0 {
                            return Err(KvError::DocumentExists);
                        }
                        if opts.cas != existing.cas {
                            return Err(KvError::CasMismatch);
                        }
                    }
                    StoreSemantics::Replace | StoreSemantics::Upsert => {
                        if opts.cas != 0 && opts.cas != existing.cas {
                            return Err(KvError::CasMismatch);
                        }
                    }
                }
                let mut working = existing.clone();
                if opts.store_semantics == StoreSemantics::Insert {
                    // Staged-insert overwrite of a tombstone starts from a
                    // clean xattr tree
                    working.xattrs = Value::Object(Map::new());
                    working.tombstone = opts.create_as_deleted || working.tombstone;
                }
                apply_specs(&mut working, specs, new_cas)?;
                if working.tombstone && empty_xattrs(&working.xattrs) {
                    // Nothing left to keep the tombstone alive for
                    occupied.remove();
                } else {
                    occupied.insert(working);
                }
                Ok(MutateInResult { cas: new_cas })
            }
            Entry::Vacant(vacant) => {
                if opts.store_semantics == StoreSemantics::Replace {
                    return Err(KvError::DocumentNotFound);
                }
                if opts.cas != 0 {
                    return Err(KvError::DocumentNotFound);
                }
                let mut working = StoredDoc {
                    body: None,
                    xattrs: Value::Object(Map::new()),
                    cas: 0,
                    revid: 0,
                    tombstone: opts.create_as_deleted,
                };
                apply_specs(&mut working, specs, new_cas)?;
                if !(working.tombstone && empty_xattrs(&working.xattrs)) {
                    vacant.insert(working);
                }
                Ok(MutateInResult { cas: new_cas })
            }
        }
    }

    fn insert(
        &self,
        id: &DocId,
        content: &Value,
        _durability: DurabilityLevel,
        _timeout: Option<Duration>,
    ) -> KvResult<MutateInResult> {
        let new_cas = self.next_cas();
        match self.docs.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().tombstone {
                    return Err(KvError::DocumentExists);
                }
                // Insert over a tombstone resurrects the key with a fresh
                // xattr tree
                occupied.insert(StoredDoc {
                    body: Some(content.clone()),
                    xattrs: Value::Object(Map::new()),
                    cas: new_cas,
                    revid: occupied.get().revid + 1,
                    tombstone: false,
                });
                Ok(MutateInResult { cas: new_cas })
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredDoc {
                    body: Some(content.clone()),
                    xattrs: Value::Object(Map::new()),
                    cas: new_cas,
                    revid: 1,
                    tombstone: false,
                });
                Ok(MutateInResult { cas: new_cas })
            }
        }
    }

    fn remove(
        &self,
        id: &DocId,
        cas: u64,
        _durability: DurabilityLevel,
        _timeout: Option<Duration>,
    ) -> KvResult<()> {
        match self.docs.entry(id.clone()) {
            Entry::Occupied(occupied) => {
                if occupied.get().tombstone {
                    return Err(KvError::DocumentNotFound);
                }
                if cas != 0 && cas != occupied.get().cas {
                    return Err(KvError::CasMismatch);
                }
                occupied.remove();
                Ok(())
            }
            Entry::Vacant(_) => Err(KvError::DocumentNotFound),
        }
    }

    fn bucket_names(&self) -> Vec<String> {
        self.buckets.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cluster() -> MemoryCluster {
        MemoryCluster::single_bucket("default")
    }

    fn doc_id(key: &str) -> DocId {
        DocId::in_default_collection("default", key)
    }

    #[test]
    fn test_insert_get_remove_round_trip() {
        let c = cluster();
        let id = doc_id("a");
        let res = c
            .insert(&id, &json!({"n": 0}), DurabilityLevel::None, None)
            .unwrap();
        assert!(res.cas > 0);

        let got = c.get(&id, None).unwrap();
        assert_eq!(got.content, json!({"n": 0}));
        assert_eq!(got.cas, res.cas);

        c.remove(&id, got.cas, DurabilityLevel::None, None).unwrap();
        assert!(matches!(c.get(&id, None), Err(KvError::DocumentNotFound)));
    }

    #[test]
    fn test_insert_conflict() {
        let c = cluster();
        let id = doc_id("a");
        c.insert(&id, &json!(1), DurabilityLevel::None, None).unwrap();
        assert!(matches!(
            c.insert(&id, &json!(2), DurabilityLevel::None, None),
            Err(KvError::DocumentExists)
        ));
    }

    #[test]
    fn test_remove_cas_mismatch() {
        let c = cluster();
        let id = doc_id("a");
        let res = c.insert(&id, &json!(1), DurabilityLevel::None, None).unwrap();
        assert!(matches!(
            c.remove(&id, res.cas + 1, DurabilityLevel::None, None),
            Err(KvError::CasMismatch)
        ));
    }

    #[test]
    fn test_create_as_deleted_invisible_to_get() {
        let c = cluster();
        let id = doc_id("staged");
        let opts = MutateInOptions {
            store_semantics: StoreSemantics::Insert,
            create_as_deleted: true,
            access_deleted: true,
            ..Default::default()
        };
        c.mutate_in(
            &id,
            &[MutateInSpec::upsert("txn.id.atmpt", json!("a1"))
                .xattr()
                .create_path()],
            &opts,
        )
        .unwrap();

        // Invisible to plain reads
        assert!(matches!(c.get(&id, None), Err(KvError::DocumentNotFound)));
        assert!(matches!(
            c.lookup_in(
                &id,
                &[LookupInSpec::get("txn.id.atmpt").xattr()],
                &LookupInOptions::default()
            ),
            Err(KvError::DocumentNotFound)
        ));

        // Visible with access_deleted
        let res = c
            .lookup_in(
                &id,
                &[LookupInSpec::get("txn.id.atmpt").xattr()],
                &LookupInOptions {
                    access_deleted: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(res.is_deleted());
        assert_eq!(res.value(0), Some(&json!("a1")));
    }

    #[test]
    fn test_tombstone_purged_when_last_xattr_removed() {
        let c = cluster();
        let id = doc_id("staged");
        let opts = MutateInOptions {
            store_semantics: StoreSemantics::Insert,
            create_as_deleted: true,
            access_deleted: true,
            ..Default::default()
        };
        c.mutate_in(
            &id,
            &[MutateInSpec::upsert("txn.staged", json!({"x": 1}))
                .xattr()
                .create_path()],
            &opts,
        )
        .unwrap();
        assert_eq!(c.doc_count(), 1);

        c.mutate_in(
            &id,
            &[MutateInSpec::remove("txn").xattr()],
            &MutateInOptions {
                access_deleted: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(c.doc_count(), 0);
    }

    #[test]
    fn test_macro_expansion_cas() {
        let c = cluster();
        let id = doc_id("atr-1");
        let res = c
            .mutate_in(
                &id,
                &[MutateInSpec::upsert("attempts.a1.tst", json!(null))
                    .xattr()
                    .create_path()
                    .expand(MutateMacro::Cas)],
                &MutateInOptions {
                    store_semantics: StoreSemantics::Upsert,
                    ..Default::default()
                },
            )
            .unwrap();

        let looked = c
            .lookup_in(
                &id,
                &[LookupInSpec::get("attempts.a1.tst").xattr()],
                &LookupInOptions::default(),
            )
            .unwrap();
        let rendered = looked.value(0).unwrap().as_str().unwrap().to_string();
        assert_eq!(
            crate::util::parse_mutation_cas(&rendered),
            res.cas / 1_000_000
        );
    }

    #[test]
    fn test_subdoc_insert_path_exists() {
        let c = cluster();
        let id = doc_id("atr-1");
        let opts = MutateInOptions {
            store_semantics: StoreSemantics::Upsert,
            ..Default::default()
        };
        let spec = |v: u32| {
            MutateInSpec::insert("attempts.a1.st", json!(v))
                .xattr()
                .create_path()
        };
        c.mutate_in(&id, &[spec(1)], &opts).unwrap();
        assert!(matches!(
            c.mutate_in(&id, &[spec(2)], &opts),
            Err(KvError::PathExists)
        ));
    }

    #[test]
    fn test_set_doc_revives_tombstone() {
        let c = cluster();
        let id = doc_id("staged");
        let opts = MutateInOptions {
            store_semantics: StoreSemantics::Insert,
            create_as_deleted: true,
            access_deleted: true,
            ..Default::default()
        };
        c.mutate_in(
            &id,
            &[MutateInSpec::upsert("txn.staged", json!({"x": 1}))
                .xattr()
                .create_path()],
            &opts,
        )
        .unwrap();

        c.mutate_in(
            &id,
            &[
                MutateInSpec::remove("txn").xattr(),
                MutateInSpec::set_doc(json!({"x": 1})),
            ],
            &MutateInOptions {
                access_deleted: true,
                ..Default::default()
            },
        )
        .unwrap();

        let got = c.get(&id, None).unwrap();
        assert_eq!(got.content, json!({"x": 1}));
    }

    #[test]
    fn test_document_vattr_reports_crc() {
        let c = cluster();
        let id = doc_id("a");
        c.insert(&id, &json!({"n": 7}), DurabilityLevel::None, None)
            .unwrap();
        let res = c
            .lookup_in(
                &id,
                &[LookupInSpec::get("$document").xattr()],
                &LookupInOptions::default(),
            )
            .unwrap();
        let meta = res.value(0).unwrap();
        let expected = crc32_hex(&serde_json::to_vec(&json!({"n": 7})).unwrap());
        assert_eq!(meta.get("value_crc32c").unwrap().as_str().unwrap(), expected);
    }

    #[test]
    fn test_cas_monotonic() {
        let c = cluster();
        let id = doc_id("a");
        let first = c.insert(&id, &json!(1), DurabilityLevel::None, None).unwrap();
        let second = c
            .mutate_in(
                &id,
                &[MutateInSpec::upsert("meta.touch", json!(true))
                    .xattr()
                    .create_path()],
                &MutateInOptions::default(),
            )
            .unwrap();
        assert!(second.cas > first.cas);
    }
}
