use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Which negative or closing outcome a "seen" flag tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SeenKind {
    Cancellation,
    Rejection,
    NotSelected,
    Completion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SeenState {
    #[default]
    Unset,
    Unseen,
    Seen,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeenFlags(BTreeMap<SeenKind, SeenState>);

impl SeenFlags {
    pub fn get(&self, kind: SeenKind) -> SeenState {
        self.0.get(&kind).copied().unwrap_or_default()
    }

    /// Raised when the counterpart has something new to look at.
    pub fn raise(&mut self, kind: SeenKind) {
        self.0.insert(kind, SeenState::Unseen);
    }

    /// Unseen becomes seen; unset and seen flags are left alone.
    pub fn acknowledge(&mut self, kind: SeenKind) -> SeenState {
        if self.get(kind) == SeenState::Unseen {
            self.0.insert(kind, SeenState::Seen);
        }
        self.get(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::{SeenFlags, SeenKind, SeenState};

    #[test]
    fn flags_start_unset() {
        let flags = SeenFlags::default();
        assert_eq!(flags.get(SeenKind::Cancellation), SeenState::Unset);
    }

    #[test]
    fn acknowledge_is_idempotent() {
        let mut flags = SeenFlags::default();
        flags.raise(SeenKind::Rejection);
        assert_eq!(flags.acknowledge(SeenKind::Rejection), SeenState::Seen);
        assert_eq!(flags.acknowledge(SeenKind::Rejection), SeenState::Seen);
    }

    #[test]
    fn acknowledging_an_unset_flag_keeps_it_unset() {
        let mut flags = SeenFlags::default();
        assert_eq!(flags.acknowledge(SeenKind::NotSelected), SeenState::Unset);
    }
}
