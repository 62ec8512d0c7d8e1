//! The permission engine: rule-set compilation, effective-permission
//! resolution, directory-listing filtering, and operation checks (spec §4.2).

use super::pattern::{self, validate_pattern};
use super::rule::{Candidate, Permission, PermissionRule};
use crate::errors::{AgentFenseError, AgentFenseResult};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

/// Filesystem-level operation an overlay call performs, each requiring a
/// minimum [`Permission`] (spec §4.2 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Stat,
    ListDirectory,
    ReadBytes,
    Write,
    Delete,
    RenameSource,
    RenameDestination,
}

impl Operation {
    pub fn minimum_permission(self) -> Permission {
        match self {
            Operation::Stat | Operation::ListDirectory => Permission::View,
            Operation::ReadBytes => Permission::Read,
            Operation::Write
            | Operation::Delete
            | Operation::RenameSource
            | Operation::RenameDestination => Permission::Write,
        }
    }
}

/// A rule set bound to a sandbox's permission engine. Rules are normalized
/// once at construction: `order` is stamped with insertion index and every
/// glob pattern is validated, realizing the "rule sets are validated once,
/// up front" contract from §4.1.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<PermissionRule>,
}

impl RuleSet {
    pub fn new(mut rules: Vec<PermissionRule>) -> AgentFenseResult<Self> {
        for (index, rule) in rules.iter_mut().enumerate() {
            rule.order = index;
            validate_pattern(rule)?;
        }
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[PermissionRule] {
        &self.rules
    }
}

/// Resolves effective permissions for a fixed rule set, with a bounded LRU
/// memoization cache (spec §4.2, §9 "Permission memoisation"): one instance
/// per sandbox, dropped (and thus invalidated) only at sandbox destruction,
/// since rules never change during a sandbox's life.
pub struct PermissionEngine {
    rule_set: RuleSet,
    cache: Mutex<LruCache<String, Permission>>,
}

impl PermissionEngine {
    pub fn new(rule_set: RuleSet, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            rule_set,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Resolve the effective permission for a codebase-relative path.
    ///
    /// Deterministic for a fixed `(rule_set, path)` pair (invariant 1):
    /// repeated calls with the same path always return the same result,
    /// memoization included.
    pub fn effective(&self, path: &str) -> Permission {
        let normalized = normalize_path(path);
        if let Some(hit) = self.cache.lock().get(&normalized).copied() {
            return hit;
        }
        let resolved = self.resolve_uncached(&normalized);
        self.cache.lock().put(normalized, resolved);
        resolved
    }

    fn resolve_uncached(&self, path: &str) -> Permission {
        let mut best: Option<Candidate<'_>> = None;
        for rule in self.rule_set.rules() {
            if !pattern::matches(rule, path) {
                continue;
            }
            let candidate = Candidate {
                rule,
                specificity: pattern::specificity(rule),
            };
            best = Some(match best {
                Some(current) if current.cmp_preference(&candidate) != std::cmp::Ordering::Less => current,
                _ => candidate,
            });
        }
        let resolved = best.map(|c| c.rule.permission).unwrap_or(Permission::None);
        tracing::trace!(path, ?resolved, "resolved effective permission");
        resolved
    }

    /// Filter directory entries by their effective permission, dropping
    /// `none` entries and annotating survivors with their permission so the
    /// overlay can decide view-vs-full-stat presentation.
    pub fn list_filter<'a>(&self, entries: impl IntoIterator<Item = &'a str>) -> Vec<(&'a str, Permission)> {
        entries
            .into_iter()
            .filter_map(|entry| {
                let perm = self.effective(entry);
                (perm != Permission::None).then_some((entry, perm))
            })
            .collect()
    }

    /// Check whether `operation` is permitted on `path`, returning the
    /// error variant the overlay should surface on refusal (spec §4.4: a
    /// `none` path reports not-found rather than permission-denied, to
    /// avoid leaking existence).
    pub fn check(&self, path: &str, operation: Operation) -> AgentFenseResult<()> {
        let effective = self.effective(path);
        let minimum = operation.minimum_permission();
        if effective.satisfies(minimum) {
            return Ok(());
        }
        if effective == Permission::None {
            Err(AgentFenseError::not_found(path))
        } else {
            Err(AgentFenseError::permission_denied(path, operation_name(operation)))
        }
    }
}

fn operation_name(operation: Operation) -> &'static str {
    match operation {
        Operation::Stat => "stat",
        Operation::ListDirectory => "list",
        Operation::ReadBytes => "read",
        Operation::Write => "write",
        Operation::Delete => "delete",
        Operation::RenameSource => "rename (source)",
        Operation::RenameDestination => "rename (destination)",
    }
}

fn normalize_path(path: &str) -> String {
    path.trim_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::rule::PatternKind;

    fn engine(rules: Vec<PermissionRule>) -> PermissionEngine {
        PermissionEngine::new(RuleSet::new(rules).unwrap(), 100)
    }

    fn scenario_rules() -> Vec<PermissionRule> {
        vec![
            PermissionRule::glob("TKT-001*", Permission::Write, 0),
            PermissionRule::glob("TKT-002*", Permission::Read, 0),
            PermissionRule::glob("TKT-003*", Permission::View, 0),
            PermissionRule::glob("secret*", Permission::None, 0),
        ]
    }

    #[test]
    fn scenario_1_list_filter_hides_secret() {
        let e = engine(scenario_rules());
        let entries = ["TKT-001.txt", "TKT-002.txt", "TKT-003.txt", "secret.txt"];
        let visible: Vec<&str> = e.list_filter(entries).into_iter().map(|(n, _)| n).collect();
        assert_eq!(visible, vec!["TKT-001.txt", "TKT-002.txt", "TKT-003.txt"]);
    }

    #[test]
    fn scenario_2_read_then_write() {
        let e = engine(scenario_rules());
        assert!(e.check("TKT-002.txt", Operation::ReadBytes).is_ok());
        assert!(matches!(
            e.check("TKT-002.txt", Operation::Write),
            Err(AgentFenseError::PermissionDenied(_))
        ));
    }

    #[test]
    fn scenario_3_view_blocks_read() {
        let e = engine(scenario_rules());
        assert!(e.check("TKT-003.txt", Operation::Stat).is_ok());
        assert!(matches!(
            e.check("TKT-003.txt", Operation::ReadBytes),
            Err(AgentFenseError::PermissionDenied(_))
        ));
    }

    #[test]
    fn scenario_4_none_is_not_found() {
        let e = engine(scenario_rules());
        assert!(matches!(e.check("secret.txt", Operation::Stat), Err(AgentFenseError::NotFound(_))));
    }

    #[test]
    fn scenario_7_priority_breaks_specificity_tie() {
        let rules = vec![
            PermissionRule::glob("**/*.log", Permission::Read, 1),
            PermissionRule::glob("secrets/**", Permission::None, 10),
        ];
        let e = engine(rules);
        assert_eq!(e.effective("secrets/app.log"), Permission::None);
    }

    #[test]
    fn specificity_ordering_invariant() {
        let rules = vec![
            PermissionRule::glob("**/*.txt", Permission::View, 0),
            PermissionRule::file("docs/readme.txt", Permission::Write, 0),
        ];
        let e = engine(rules);
        assert_eq!(e.effective("docs/readme.txt"), Permission::Write);
    }

    #[test]
    fn determinism_across_repeated_lookups() {
        let e = engine(scenario_rules());
        let first = e.effective("TKT-001.txt");
        let second = e.effective("TKT-001.txt");
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_glob_rejected_at_construction() {
        let rules = vec![PermissionRule::new("a/[bad", PatternKind::Glob, Permission::Read, 0)];
        assert!(RuleSet::new(rules).is_err());
    }

    #[test]
    fn no_matching_rule_is_none() {
        let e = engine(scenario_rules());
        assert_eq!(e.effective("unmentioned.txt"), Permission::None);
    }
}
