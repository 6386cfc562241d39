#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical timestamp, monotone within one runtime.
///
/// Epochs are assigned when a snapshot is registered and when a commit
/// advances the clock. Two values are reserved:
///
/// - [`Epoch::SENTINEL`] (`0`) means "before any valid entry" / "no lower
///   bound"; real epochs start at [`Epoch::ONE`].
/// - [`Epoch::OPEN`] (`u64::MAX`) is the upper bound of the newest history
///   entry, i.e. "valid until further notice".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Epoch(pub u64);

impl Epoch {
    pub const SENTINEL: Self = Self(0);
    pub const ONE: Self = Self(1);
    pub const OPEN: Self = Self(u64::MAX);

    /// The next epoch in sequence (saturating).
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    #[must_use]
    pub fn is_sentinel(self) -> bool {
        self == Self::SENTINEL
    }

    #[must_use]
    pub fn is_open(self) -> bool {
        self == Self::OPEN
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_open() {
            write!(f, "open")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Identity of one versioned object within a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "o{}", self.0)
    }
}

/// Identity of one live snapshot within a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub u64);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Lifecycle state of a snapshot.
///
/// `Restarting` covers the window in which a snapshot is being migrated to a
/// newer epoch (after a commit attempt, or explicitly).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotStatus {
    Uninitialized,
    Initialized,
    Restarting,
    Committing,
    Committed,
    Failed,
}

impl SnapshotStatus {
    /// Whether the last commit attempt finished (in either direction).
    #[must_use]
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Committed | Self::Failed)
    }
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::Initialized => "INITIALIZED",
            Self::Restarting => "RESTARTING",
            Self::Committing => "COMMITTING",
            Self::Committed => "COMMITTED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_ordering_and_reserved_values() {
        assert!(Epoch::SENTINEL < Epoch::ONE);
        assert!(Epoch::ONE < Epoch(2));
        assert!(Epoch(u64::MAX - 1) < Epoch::OPEN);
        assert_eq!(Epoch::SENTINEL.next(), Epoch::ONE);
        assert_eq!(Epoch::OPEN.next(), Epoch::OPEN);
    }

    #[test]
    fn epoch_display() {
        assert_eq!(Epoch(42).to_string(), "42");
        assert_eq!(Epoch::SENTINEL.to_string(), "0");
        assert_eq!(Epoch::OPEN.to_string(), "open");
    }

    #[test]
    fn id_display() {
        assert_eq!(ObjectId(7).to_string(), "o7");
        assert_eq!(SnapshotId(9).to_string(), "s9");
    }

    #[test]
    fn status_display_and_settled() {
        assert_eq!(SnapshotStatus::Committing.to_string(), "COMMITTING");
        assert!(SnapshotStatus::Committed.is_settled());
        assert!(SnapshotStatus::Failed.is_settled());
        assert!(!SnapshotStatus::Initialized.is_settled());
    }
}
