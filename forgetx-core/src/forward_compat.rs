// forward_compat.rs
//! Forward-compatibility directives
//!
//! Data written by a newer protocol version can carry, in its `fc` xattr,
//! instructions telling older clients what to do when they meet it at a
//! given protocol stage: proceed, retry the transaction (optionally after
//! a delay), or fail fast. The directive map is keyed by short stage
//! codes; each value lists requirements against the protocol version and
//! extension set this client supports.

use serde_json::Value;

use crate::error::{CauseKind, ErrorClass, OpResult, OperationFailed};
use crate::logging::LogTarget;
use crate::log_trace;

/// Protocol stages a directive can gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardCompatStage {
    /// Write-write conflict: reading the blocking ATR entry
    WwcReadingAtr,
    /// Write-write conflict during replace
    WwcReplacing,
    /// Write-write conflict during remove
    WwcRemoving,
    /// Write-write conflict during insert
    WwcInserting,
    /// Fetch of the existing doc while staging an insert
    WwcInsertingGet,
    /// Plain transactional get
    Gets,
    /// Get that had to read the writer's ATR entry
    GetsReadingAtr,
    /// Cleanup handling an ATR entry
    CleanupEntry,
}

impl ForwardCompatStage {
    /// Short code used as the key in the `fc` map
    pub fn key(&self) -> &'static str {
        match self {
            ForwardCompatStage::WwcReadingAtr => "WW_R",
            ForwardCompatStage::WwcReplacing => "WW_RP",
            ForwardCompatStage::WwcRemoving => "WW_RM",
            ForwardCompatStage::WwcInserting => "WW_I",
            ForwardCompatStage::WwcInsertingGet => "WW_IG",
            ForwardCompatStage::Gets => "G",
            ForwardCompatStage::GetsReadingAtr => "G_A",
            ForwardCompatStage::CleanupEntry => "CL_E",
        }
    }
}

// What this client speaks
const PROTOCOL_MAJOR: u64 = 2;
const PROTOCOL_MINOR: u64 = 0;
const EXTENSIONS: &[&str] = &["TI", "RC", "BF3787"];

fn parse_protocol(requirement: &str) -> Option<(u64, u64)> {
    let (major, minor) = requirement.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// True when this client does not satisfy the requirement
fn requirement_triggers(item: &Value) -> bool {
    if let Some(ext) = item.get("e").and_then(|v| v.as_str()) {
        return !EXTENSIONS.contains(&ext);
    }
    if let Some(proto) = item.get("p").and_then(|v| v.as_str()) {
        return match parse_protocol(proto) {
            Some((major, minor)) => {
                major > PROTOCOL_MAJOR || (major == PROTOCOL_MAJOR && minor > PROTOCOL_MINOR)
            }
            // Unparseable requirement: assume the writer is newer
            None => true,
        };
    }
    false
}

fn failure() -> OperationFailed {
    OperationFailed::new(ErrorClass::Other, "forward compatibility failure")
        .cause(CauseKind::ForwardCompatibilityFailure)
}

/// Evaluate the directives of `fc` (if any) for the given stage. Returns
/// an error flagged for retry or fail-fast when a requirement triggers.
pub fn check(stage: ForwardCompatStage, fc: Option<&Value>) -> OpResult<()> {
    let Some(fc) = fc else {
        return Ok(());
    };
    let Some(items) = fc.get(stage.key()).and_then(|v| v.as_array()) else {
        return Ok(());
    };
    for item in items {
        if !requirement_triggers(item) {
            continue;
        }
        let behavior = item.get("b").and_then(|v| v.as_str()).unwrap_or("f");
        match behavior {
            "r" => {
                log_trace!(LogTarget::Txn, "forward compatibility RETRY_TXN at {}", stage.key());
                if let Some(delay_ms) = item.get("ra").and_then(|v| v.as_u64()) {
                    std::thread::sleep(std::time::Duration::from_millis(delay_ms));
                }
                return Err(failure().retry());
            }
            _ => {
                log_trace!(LogTarget::Txn, "forward compatibility FAIL_FAST_TXN at {}", stage.key());
                return Err(failure());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_no_directives_continue() {
        assert!(check(ForwardCompatStage::Gets, None).is_ok());
        assert!(check(ForwardCompatStage::Gets, Some(&json!({}))).is_ok());
        assert!(check(ForwardCompatStage::Gets, Some(&json!({"CL_E": []}))).is_ok());
    }

    #[test]
    fn test_known_extension_continues() {
        let fc = json!({"G": [{"e": "TI", "b": "f"}]});
        assert!(check(ForwardCompatStage::Gets, Some(&fc)).is_ok());
    }

    #[test]
    fn test_unknown_extension_fails_fast() {
        let fc = json!({"G": [{"e": "XX", "b": "f"}]});
        let err = check(ForwardCompatStage::Gets, Some(&fc)).unwrap_err();
        assert!(!err.should_retry());
        assert_eq!(err.cause_kind(), CauseKind::ForwardCompatibilityFailure);
    }

    #[test]
    fn test_unknown_extension_retries() {
        let fc = json!({"CL_E": [{"e": "XX", "b": "r"}]});
        let err = check(ForwardCompatStage::CleanupEntry, Some(&fc)).unwrap_err();
        assert!(err.should_retry());
    }

    #[test]
    fn test_retry_with_delay() {
        let fc = json!({"G": [{"e": "XX", "b": "r", "ra": 5}]});
        let started = std::time::Instant::now();
        let err = check(ForwardCompatStage::Gets, Some(&fc)).unwrap_err();
        assert!(err.should_retry());
        assert!(started.elapsed() >= std::time::Duration::from_millis(5));
    }

    #[test]
    fn test_newer_protocol_triggers() {
        let fc = json!({"G": [{"p": "3.0", "b": "f"}]});
        assert!(check(ForwardCompatStage::Gets, Some(&fc)).is_err());

        let fc = json!({"G": [{"p": "2.0", "b": "f"}]});
        assert!(check(ForwardCompatStage::Gets, Some(&fc)).is_ok());

        let fc = json!({"G": [{"p": "2.1", "b": "f"}]});
        assert!(check(ForwardCompatStage::Gets, Some(&fc)).is_err());
    }

    #[test]
    fn test_only_matching_stage_consulted() {
        let fc = json!({"WW_R": [{"e": "XX", "b": "f"}]});
        assert!(check(ForwardCompatStage::Gets, Some(&fc)).is_ok());
        assert!(check(ForwardCompatStage::WwcReadingAtr, Some(&fc)).is_err());
    }
}
