//! Collection types with a fast, non-cryptographic hasher.
//!
//! [`foldhash`] is used as the underlying hash implementation.

use std::collections::HashMap;

/// [`BuildHasher`][std::hash::BuildHasher] used by every collection in this module.
pub type FastBuildHasher = foldhash::quality::RandomState;

/// A hash map based on the standard library's [`HashMap`] using [`FastBuildHasher`].
pub type FastHashMap<K, V> = HashMap<K, V, FastBuildHasher>;

/// A hash map with stable insertion order based on `indexmap` ([`IndexMap`][indexmap::IndexMap]) using
/// [`FastBuildHasher`].
pub type FastIndexMap<K, V> = indexmap::IndexMap<K, V, FastBuildHasher>;
