// atr_ids.rs
//! The fixed ATR namespace
//!
//! Every document key hashes to one of 1024 vbuckets; each vbucket owns
//! one ATR document. The mapping is deterministic and identical across
//! clients, so lost-attempts cleanup can enumerate every ATR that any
//! client may ever have used.

use lazy_static::lazy_static;

/// Number of vbuckets, and therefore ATR documents, per bucket
pub const NUM_ATRS: usize = 1024;

lazy_static! {
    static ref ATR_IDS: Vec<String> = (0..NUM_ATRS).map(atr_id_string).collect();
}

// The '#suffix' tail exists to pin the ATR document itself onto the
// vbucket it serves; derived from the vbucket number so the table is
// stable without being carried as 1024 literals.
fn atr_id_string(vbucket: usize) -> String {
    let suffix = crc32fast::hash(vbucket.to_string().as_bytes()) & 0xfff;
    format!("atr-{}-#{:x}", vbucket, suffix)
}

/// vbucket a key lives in
pub fn vbucket_for_key(key: &str) -> usize {
    let digest = crc32fast::hash(key.as_bytes());
    (digest as usize) % NUM_ATRS
}

/// ATR id owning the given vbucket
pub fn atr_id_for_vbucket(vbucket: usize) -> &'static str {
    &ATR_IDS[vbucket % NUM_ATRS]
}

/// ATR id owning the given key
pub fn atr_id_for_key(key: &str) -> &'static str {
    atr_id_for_vbucket(vbucket_for_key(key))
}

/// The full fixed table, in vbucket order
pub fn all() -> &'static [String] {
    &ATR_IDS
}
