//! Long-lived exec sessions: persisted cwd/env across calls into a
//! sandbox's runtime.

mod registry;

pub use registry::{ExecOutcome, ExecRequest, ExecResult, ExitInfo, OutputChunk, Session, SessionRegistry};
