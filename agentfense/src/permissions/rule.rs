//! Permission rule types: the four-tier permission, pattern kind, and the
//! rule tuple itself.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// The four-tier access level a rule grants over a path.
///
/// Total order: `None < View < Read < Write`, matching spec's integer
/// encoding (0..3) used for "minimum permission" comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    None = 0,
    View = 1,
    Read = 2,
    Write = 3,
}

impl Permission {
    /// True if this permission satisfies at least `minimum`.
    pub fn satisfies(self, minimum: Permission) -> bool {
        self >= minimum
    }
}

impl Default for Permission {
    fn default() -> Self {
        Permission::None
    }
}

/// How a rule's `pattern` string should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// Shell-style glob: `*`, `**`, `?`, character classes.
    Glob,
    /// Matches the exact directory and all descendants.
    Directory,
    /// Matches the exact path only.
    File,
}

/// A single permission rule: `(pattern, pattern_kind, permission, priority)`.
///
/// Rule sets are immutable for the lifetime of a sandbox (spec §3); the
/// `order` field records insertion order so the engine can apply the
/// "earlier wins" final tie-break deterministically regardless of how
/// the caller's rule set is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    pub pattern: String,
    pub pattern_kind: PatternKind,
    pub permission: Permission,
    pub priority: i64,
    /// Zero-based position in the rule set as supplied by the caller.
    #[serde(default)]
    pub order: usize,
}

impl PermissionRule {
    pub fn new(pattern: impl Into<String>, pattern_kind: PatternKind, permission: Permission, priority: i64) -> Self {
        Self {
            pattern: pattern.into(),
            pattern_kind,
            permission,
            priority,
            order: 0,
        }
    }

    pub fn glob(pattern: impl Into<String>, permission: Permission, priority: i64) -> Self {
        Self::new(pattern, PatternKind::Glob, permission, priority)
    }

    pub fn directory(pattern: impl Into<String>, permission: Permission, priority: i64) -> Self {
        Self::new(pattern, PatternKind::Directory, permission, priority)
    }

    pub fn file(pattern: impl Into<String>, permission: Permission, priority: i64) -> Self {
        Self::new(pattern, PatternKind::File, permission, priority)
    }
}

/// A matching rule plus its resolved specificity, used internally by the
/// engine to pick a winner among several candidates for the same path.
#[derive(Debug, Clone)]
pub(crate) struct Candidate<'a> {
    pub rule: &'a PermissionRule,
    pub specificity: u32,
}

impl<'a> Candidate<'a> {
    /// Compare two candidates under the spec's tie-break order: higher
    /// specificity wins; then higher caller priority; then earlier
    /// insertion order.
    pub fn cmp_preference(&self, other: &Self) -> Ordering {
        self.specificity
            .cmp(&other.specificity)
            .then_with(|| self.rule.priority.cmp(&other.rule.priority))
            .then_with(|| other.rule.order.cmp(&self.rule.order))
    }
}
