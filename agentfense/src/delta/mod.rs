//! The copy-on-write delta (upper) layer.

mod store;

pub use store::{DeltaStore, SharedDeltaStore, UpperLookup};
