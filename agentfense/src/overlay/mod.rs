//! The userspace overlay filesystem presented to a sandbox's runtime.

mod fs;
mod mount;
mod path;

pub use fs::{DirEntry, OverlayFilesystem, Stat};
pub use mount::{CapabilityReport, OverlayMount};
pub use path::sanitize_rel_path;
