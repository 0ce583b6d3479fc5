//! Dotted-path accessors over JSON values.

use serde_json::{Map, Value};

/// Resolves a dotted path (e.g. `"user.profile.name"`) against a value.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Writes a value at a dotted path, creating intermediate objects as needed.
/// Any non-object encountered along the path is replaced by an object.
pub fn set_path(target: &mut Value, path: &str, value: Value) {
    let mut current = target;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        // Normalize before borrowing the map.
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        if i == segments.len() - 1 {
            map.insert((*segment).to_string(), value);
            return;
        }
        current = map
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_nested_path() {
        let value = json!({"user": {"profile": {"name": "ada"}}});
        assert_eq!(
            get_path(&value, "user.profile.name"),
            Some(&json!("ada"))
        );
        assert_eq!(get_path(&value, "user.profile"), Some(&json!({"name": "ada"})));
        assert!(get_path(&value, "user.missing.name").is_none());
        assert!(get_path(&value, "user.profile.name.deeper").is_none());
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut value = json!({});
        set_path(&mut value, "user.profile.name", json!("ada"));
        assert_eq!(value, json!({"user": {"profile": {"name": "ada"}}}));
    }

    #[test]
    fn set_overwrites_scalar_on_path() {
        let mut value = json!({"user": 42});
        set_path(&mut value, "user.name", json!("ada"));
        assert_eq!(value, json!({"user": {"name": "ada"}}));
    }

    #[test]
    fn set_overwrites_scalar_mid_path() {
        let mut value = json!({"a": {"b": 1}});
        set_path(&mut value, "a.b.c", json!(true));
        assert_eq!(value, json!({"a": {"b": {"c": true}}}));

        let mut scalar = json!("not an object");
        set_path(&mut scalar, "x.y", json!(9));
        assert_eq!(scalar, json!({"x": {"y": 9}}));
    }

    #[test]
    fn set_top_level_key() {
        let mut value = json!({"a": 1});
        set_path(&mut value, "b", json!(2));
        assert_eq!(value, json!({"a": 1, "b": 2}));
    }
}
