//! Recursive state diffing.

use serde_json::Value;
use serde::{Deserialize, Serialize};

/// Dotted key paths that changed between two states.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDiff {
    /// Paths present in the new state only.
    pub added: Vec<String>,
    /// Paths present in both but with different values.
    pub modified: Vec<String>,
    /// Paths present in the old state only.
    pub removed: Vec<String>,
}

impl StateDiff {
    /// Whether the two states were identical.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

/// Computes added/modified/removed key paths between two JSON states,
/// recursing into nested objects. Leaf equality is value equality.
pub fn diff(old: &Value, new: &Value) -> StateDiff {
    let mut out = StateDiff::default();
    walk(old, new, String::new(), &mut out);
    out.added.sort();
    out.modified.sort();
    out.removed.sort();
    out
}

fn walk(old: &Value, new: &Value, prefix: String, out: &mut StateDiff) {
    match (old.as_object(), new.as_object()) {
        (Some(old_map), Some(new_map)) => {
            for (key, old_value) in old_map {
                let path = join(&prefix, key);
                match new_map.get(key) {
                    Some(new_value) => walk(old_value, new_value, path, out),
                    None => out.removed.push(path),
                }
            }
            for key in new_map.keys() {
                if !old_map.contains_key(key) {
                    out.added.push(join(&prefix, key));
                }
            }
        }
        _ => {
            if old != new {
                out.modified.push(prefix);
            }
        }
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identical_states_produce_empty_diff() {
        let state = json!({"a": 1, "b": {"c": true}});
        assert!(diff(&state, &state).is_empty());
    }

    #[test]
    fn flat_changes() {
        let old = json!({"a": 1, "b": 2});
        let new = json!({"a": 1, "b": 3, "c": 4});
        let d = diff(&old, &new);
        assert_eq!(d.added, vec!["c"]);
        assert_eq!(d.modified, vec!["b"]);
        assert!(d.removed.is_empty());
    }

    #[test]
    fn nested_changes_use_dotted_paths() {
        let old = json!({"user": {"profile": {"name": "ada", "age": 36}}});
        let new = json!({"user": {"profile": {"name": "grace"}}});
        let d = diff(&old, &new);
        assert_eq!(d.modified, vec!["user.profile.name"]);
        assert_eq!(d.removed, vec!["user.profile.age"]);
        assert!(d.added.is_empty());
    }

    #[test]
    fn object_replaced_by_scalar_is_a_modification() {
        let old = json!({"a": {"b": 1}});
        let new = json!({"a": 2});
        let d = diff(&old, &new);
        assert_eq!(d.modified, vec!["a"]);
    }
}
