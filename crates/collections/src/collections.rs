//! Fast collection types shared across the workspace.
//!
//! `FxHashMap`/`FxHashSet` for small keys (session and request ids), plus an
//! insertion-ordered `IndexMap` keyed with FxHash.

pub use rustc_hash::{FxBuildHasher, FxHashMap, FxHashSet};
pub use std::collections::*;

/// Insertion-ordered hash map with FxHash.
pub type IndexMap<K, V> = indexmap::IndexMap<K, V, FxBuildHasher>;
