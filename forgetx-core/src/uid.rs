// uid.rs
// Identifier generation for transactions, attempts and cleanup clients.
// A single seam so tests can reason about where ids come from.

use uuid::Uuid;

/// Next unique identifier (UUID v4, hyphenated)
pub fn next_id() -> String {
    Uuid::new_v4().to_string()
}
