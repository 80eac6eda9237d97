use serde::{Deserialize, Serialize};
use std::fmt;

/// Lock modes of the multi-granularity protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    #[serde(rename = "IS")]
    IntentShared,
    #[serde(rename = "IX")]
    IntentExclusive,
    #[serde(rename = "S")]
    Shared,
    #[serde(rename = "U")]
    Update,
    #[serde(rename = "X")]
    Exclusive,
}

use LockMode::*;

impl LockMode {
    pub const ALL: [LockMode; 5] = [IntentShared, IntentExclusive, Shared, Update, Exclusive];

    /// Whether `requested` may be granted while `self` is the granted mode.
    ///
    /// Rows are the granted mode, columns the requested one:
    ///
    /// ```text
    ///        IS  IX  S   U   X
    ///   IS   y   y   y   y   n
    ///   IX   y   y   n   n   n
    ///   S    y   n   y   y   n
    ///   U    y   n   y   n   n
    ///   X    n   n   n   n   n
    /// ```
    pub fn compatible(self, requested: LockMode) -> bool {
        match (self, requested) {
            (Exclusive, _) | (_, Exclusive) => false,
            (IntentShared, _) | (_, IntentShared) => true,
            (IntentExclusive, IntentExclusive) => true,
            (IntentExclusive, _) | (_, IntentExclusive) => false,
            (Shared, Shared) | (Shared, Update) | (Update, Shared) => true,
            (Update, Update) => false,
        }
    }

    /// Whether holding `self` already implies holding `other`.
    pub fn covers(self, other: LockMode) -> bool {
        match self {
            Exclusive => true,
            Update => matches!(other, Update | Shared | IntentShared),
            Shared => matches!(other, Shared | IntentShared),
            IntentExclusive => matches!(other, IntentExclusive | IntentShared),
            IntentShared => other == IntentShared,
        }
    }

    /// The least restrictive mode covering both. S and U have no common
    /// upper bound with IX other than X.
    pub fn join(self, other: LockMode) -> LockMode {
        if self.covers(other) {
            self
        } else if other.covers(self) {
            other
        } else {
            Exclusive
        }
    }

    /// Intent mode an ancestor must hold before `self` is granted below it.
    pub fn intent(self) -> LockMode {
        match self {
            IntentShared | Shared => IntentShared,
            IntentExclusive | Update | Exclusive => IntentExclusive,
        }
    }

    pub fn is_intent(self) -> bool {
        matches!(self, IntentShared | IntentExclusive)
    }

    pub fn short_name(self) -> &'static str {
        match self {
            IntentShared => "IS",
            IntentExclusive => "IX",
            Shared => "S",
            Update => "U",
            Exclusive => "X",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}
