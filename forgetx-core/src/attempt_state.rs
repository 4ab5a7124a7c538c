// attempt_state.rs
//! Attempt lifecycle states
//!
//! ```text
//! NOT_STARTED ──first mutation──▶ PENDING ──commit──▶ COMMITTED ──unstage──▶ COMPLETED
//!                                    │
//!                                    └──rollback──▶ ABORTED ──revert──▶ ROLLED_BACK
//! ```

/// State of one attempt, as tracked locally and in its ATR entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// Nothing written anywhere yet
    NotStarted,
    /// ATR entry exists; mutations are being staged
    Pending,
    /// The ATR entry says committed; unstaging may still be in flight
    Committed,
    /// Terminal: all mutations unstaged, ATR entry removed
    Completed,
    /// The ATR entry says aborted; reverting may still be in flight
    Aborted,
    /// Terminal: every staged mutation reverted
    RolledBack,
}

impl AttemptState {
    /// Wire name stored in the ATR `st` field
    pub fn name(&self) -> &'static str {
        match self {
            AttemptState::NotStarted => "NOT_STARTED",
            AttemptState::Pending => "PENDING",
            AttemptState::Committed => "COMMITTED",
            AttemptState::Completed => "COMPLETED",
            AttemptState::Aborted => "ABORTED",
            AttemptState::RolledBack => "ROLLED_BACK",
        }
    }

    pub fn parse(s: &str) -> Option<AttemptState> {
        match s {
            "NOT_STARTED" => Some(AttemptState::NotStarted),
            "PENDING" => Some(AttemptState::Pending),
            "COMMITTED" => Some(AttemptState::Committed),
            "COMPLETED" => Some(AttemptState::Completed),
            "ABORTED" => Some(AttemptState::Aborted),
            "ROLLED_BACK" => Some(AttemptState::RolledBack),
            _ => None,
        }
    }

    /// Terminal states need no cleanup
    pub fn is_final(&self) -> bool {
        matches!(self, AttemptState::Completed | AttemptState::RolledBack)
    }
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_parse_round_trip() {
        for state in [
            AttemptState::NotStarted,
            AttemptState::Pending,
            AttemptState::Committed,
            AttemptState::Completed,
            AttemptState::Aborted,
            AttemptState::RolledBack,
        ] {
            assert_eq!(AttemptState::parse(state.name()), Some(state));
        }
        assert_eq!(AttemptState::parse("BOGUS"), None);
    }

    #[test]
    fn test_final_states() {
        assert!(AttemptState::Completed.is_final());
        assert!(AttemptState::RolledBack.is_final());
        assert!(!AttemptState::Pending.is_final());
        assert!(!AttemptState::Committed.is_final());
        assert!(!AttemptState::Aborted.is_final());
    }
}
