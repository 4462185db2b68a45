//! Delta merge rules.
//!
//! The meaning of a delta belongs to the business layer; the reconciler only
//! guarantees arrival order. [`DeepMerge`] is the default and is the same
//! merge the settings loader uses for user overrides.

use serde_json::{Map, Value};

/// Applies a delta patch to a cached value.
pub trait MergeRule: Send + Sync {
    /// Value a delta is applied to when the key has no value yet.
    fn baseline(&self) -> Value {
        Value::Object(Map::new())
    }

    /// Merge `patch` into `base`.
    fn merge(&self, base: Value, patch: Value) -> Value;
}

/// Recursive object merge; see [`deep_merge`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DeepMerge;

impl MergeRule for DeepMerge {
    fn merge(&self, base: Value, patch: Value) -> Value {
        deep_merge(base, patch)
    }
}

/// Treats every delta as a replacement.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReplaceMerge;

impl MergeRule for ReplaceMerge {
    fn merge(&self, _base: Value, patch: Value) -> Value {
        patch
    }
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}
