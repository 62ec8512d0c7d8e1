//! Resource-limit newtypes and the engine-wide configuration surface.
//!
//! Grounded on the teacher's `runtime::types` newtype style (`Bytes`,
//! `Seconds`) and `runtime::layout::FsLayoutConfig` options struct: a small
//! set of `Copy` wrappers around primitives, plus one config struct with
//! `with_*`/builder-style constructors and sane `Default`s for embedding.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// A byte quantity, displayed with a human-friendly unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Bytes(pub u64);

impl Bytes {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn mib(count: u64) -> Self {
        Self(count * 1024 * 1024)
    }

    pub const fn gib(count: u64) -> Self {
        Self(count * 1024 * 1024 * 1024)
    }
}

impl std::fmt::Display for Bytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
        let mut value = self.0 as f64;
        let mut unit = 0;
        while value >= 1024.0 && unit < UNITS.len() - 1 {
            value /= 1024.0;
            unit += 1;
        }
        if unit == 0 {
            write!(f, "{}{}", self.0, UNITS[0])
        } else {
            write!(f, "{:.1}{}", value, UNITS[unit])
        }
    }
}

/// Relative CPU scheduling weight, passed opaquely to the runtime launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct CpuShares(pub u32);

/// CPU quota expressed in millicores (1000 = one full core).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct CpuQuota(pub u32);

impl CpuQuota {
    pub const fn millicores(value: u32) -> Self {
        Self(value)
    }

    pub const fn cores(count: u32) -> Self {
        Self(count * 1000)
    }
}

/// Maximum number of live processes/threads a sandbox's runtime may spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct PidsLimit(pub u32);

/// Resource limits bundled per sandbox, passed opaquely to the runtime
/// launcher (spec: "the manager itself does not enforce CPU/memory, only
/// PID caps indirectly via the runtime").
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ResourceLimits {
    pub memory: Bytes,
    pub cpu_shares: CpuShares,
    pub cpu_quota: CpuQuota,
    pub pids: PidsLimit,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: Bytes::mib(512),
            cpu_shares: CpuShares(1024),
            cpu_quota: CpuQuota::cores(1),
            pids: PidsLimit(256),
        }
    }
}

/// Engine-wide configuration for embedding `SandboxEngine`.
///
/// There is no external config file format here (no CLI to parse one for);
/// this is a programmatic options struct in the style of the teacher's
/// `BoxliteOptions`, constructed directly by the embedding process.
#[derive(Debug, Clone)]
pub struct SandboxEngineOptions {
    /// Root directory under which per-sandbox scratch (delta store) and
    /// codebase blob directories live.
    home_dir: PathBuf,
    /// Resource limits applied to a sandbox when the caller doesn't supply
    /// its own.
    default_limits: ResourceLimits,
    /// How long an idle session may sit unused before the session registry
    /// garbage-collects it.
    session_idle_timeout: Duration,
    /// How often the TTL scheduler scans for expired sandboxes.
    ttl_scan_interval: Duration,
    /// Maximum number of `(rule_set_id, path)` entries cached per sandbox's
    /// permission engine.
    permission_cache_capacity: usize,
}

impl SandboxEngineOptions {
    /// Start from a given home directory, with every other field defaulted.
    pub fn new(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            home_dir: home_dir.into(),
            default_limits: ResourceLimits::default(),
            session_idle_timeout: Duration::from_secs(600),
            ttl_scan_interval: Duration::from_secs(1),
            permission_cache_capacity: 4096,
        }
    }

    pub fn with_default_limits(mut self, limits: ResourceLimits) -> Self {
        self.default_limits = limits;
        self
    }

    pub fn with_session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.session_idle_timeout = timeout;
        self
    }

    pub fn with_ttl_scan_interval(mut self, interval: Duration) -> Self {
        self.ttl_scan_interval = interval;
        self
    }

    pub fn with_permission_cache_capacity(mut self, capacity: usize) -> Self {
        self.permission_cache_capacity = capacity.max(1);
        self
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn default_limits(&self) -> ResourceLimits {
        self.default_limits
    }

    pub fn session_idle_timeout(&self) -> Duration {
        self.session_idle_timeout
    }

    pub fn ttl_scan_interval(&self) -> Duration {
        self.ttl_scan_interval
    }

    pub fn permission_cache_capacity(&self) -> usize {
        self.permission_cache_capacity
    }

    /// Directory holding per-codebase blob trees: `<home>/files/<codebase_id>/`.
    pub fn files_dir(&self) -> PathBuf {
        self.home_dir.join("files")
    }

    /// Directory holding per-codebase JSON metadata records.
    pub fn metadata_dir(&self) -> PathBuf {
        self.home_dir.join("metadata")
    }

    /// Directory under which per-sandbox scratch (delta store) directories
    /// are created.
    pub fn scratch_dir(&self) -> PathBuf {
        self.home_dir.join("scratch")
    }
}

impl Default for SandboxEngineOptions {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("agentfense"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_formats_with_units() {
        assert_eq!(Bytes::new(512).to_string(), "512B");
        assert_eq!(Bytes::mib(1).to_string(), "1.0MiB");
        assert_eq!(Bytes::gib(2).to_string(), "2.0GiB");
    }

    #[test]
    fn options_builder_overrides_defaults() {
        let opts = SandboxEngineOptions::new("/tmp/agentfense-test")
            .with_permission_cache_capacity(10)
            .with_session_idle_timeout(Duration::from_secs(30));
        assert_eq!(opts.permission_cache_capacity(), 10);
        assert_eq!(opts.session_idle_timeout(), Duration::from_secs(30));
        assert_eq!(opts.scratch_dir(), PathBuf::from("/tmp/agentfense-test/scratch"));
    }

    #[test]
    fn zero_capacity_clamped_to_one() {
        let opts = SandboxEngineOptions::new("/tmp/x").with_permission_cache_capacity(0);
        assert_eq!(opts.permission_cache_capacity(), 1);
    }
}
