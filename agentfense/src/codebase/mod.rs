//! Codebases: immutable, content-addressed file collections shared by one
//! or more sandboxes.

mod registry;
mod source;

pub use registry::{Codebase, CodebaseMetadata, CodebaseRegistry};
pub use source::{sha256_hex, CodebaseSource, FsCodebaseStore, InMemoryCodebaseStore, LowerEntry};
