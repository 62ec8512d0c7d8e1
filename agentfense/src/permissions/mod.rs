//! Pattern matching, rule types, and the effective-permission engine.

mod engine;
mod pattern;
mod rule;

pub use engine::{Operation, PermissionEngine, RuleSet};
pub use rule::{Permission, PatternKind, PermissionRule};
