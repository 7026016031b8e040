//! JSON-pointer helpers used by the conversion steps.
//!
//! Reads go through `serde_json::Value::pointer`. Writes create missing
//! intermediate containers: a numeric segment creates an array, anything else
//! an object.

use serde_json::{Map, Value};

fn unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

fn segments(pointer: &str) -> Option<Vec<String>> {
    if pointer.is_empty() {
        return Some(Vec::new());
    }
    let rest = pointer.strip_prefix('/')?;
    Some(rest.split('/').map(unescape).collect())
}

pub fn get<'a>(root: &'a Value, pointer: &str) -> Option<&'a Value> {
    root.pointer(pointer)
}

/// Writes `value` at `pointer`, creating intermediate objects/arrays.
/// Returns false when the pointer is malformed or crosses a scalar.
pub fn set(root: &mut Value, pointer: &str, value: Value) -> bool {
    let Some(parts) = segments(pointer) else {
        return false;
    };
    if parts.is_empty() {
        *root = value;
        return true;
    }

    let mut current = root;
    for (i, part) in parts.iter().enumerate() {
        let last = i == parts.len() - 1;
        let next_is_index = parts
            .get(i + 1)
            .map(|p| p.parse::<usize>().is_ok())
            .unwrap_or(false);

        if current.is_null() {
            *current = if part.parse::<usize>().is_ok() {
                Value::Array(Vec::new())
            } else {
                Value::Object(Map::new())
            };
        }

        current = match current {
            Value::Object(map) => {
                if last {
                    map.insert(part.clone(), value);
                    return true;
                }
                map.entry(part.clone()).or_insert_with(|| container(next_is_index))
            }
            Value::Array(items) => {
                let index = if part == "-" {
                    items.len()
                } else {
                    match part.parse::<usize>() {
                        Ok(i) => i,
                        Err(_) => return false,
                    }
                };
                while items.len() <= index {
                    items.push(Value::Null);
                }
                if last {
                    items[index] = value;
                    return true;
                }
                if items[index].is_null() {
                    items[index] = container(next_is_index);
                }
                &mut items[index]
            }
            _ => return false,
        };
    }
    false
}

fn container(array: bool) -> Value {
    if array {
        Value::Array(Vec::new())
    } else {
        Value::Object(Map::new())
    }
}

/// Removes the value at `pointer`. Missing paths are not an error.
pub fn remove(root: &mut Value, pointer: &str) -> Option<Value> {
    let parts = segments(pointer)?;
    let (last, parents) = parts.split_last()?;
    let mut current = root;
    for part in parents {
        current = match current {
            Value::Object(map) => map.get_mut(part)?,
            Value::Array(items) => items.get_mut(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    match current {
        Value::Object(map) => map.remove(last),
        Value::Array(items) => {
            let index = last.parse::<usize>().ok()?;
            (index < items.len()).then(|| items.remove(index))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_creates_nested_objects() {
        let mut v = json!({});
        assert!(set(&mut v, "/options/temperature", json!(0.2)));
        assert_eq!(v, json!({"options": {"temperature": 0.2}}));
    }

    #[test]
    fn test_set_creates_arrays_for_numeric_segments() {
        let mut v = json!({});
        assert!(set(&mut v, "/choices/0/message/content", json!("hi")));
        assert_eq!(v, json!({"choices": [{"message": {"content": "hi"}}]}));
    }

    #[test]
    fn test_set_rejects_scalar_parent() {
        let mut v = json!({"model": "m1"});
        assert!(!set(&mut v, "/model/name", json!("x")));
        assert_eq!(v, json!({"model": "m1"}));
    }

    #[test]
    fn test_set_escaped_segment() {
        let mut v = json!({});
        assert!(set(&mut v, "/a~1b", json!(1)));
        assert_eq!(get(&v, "/a~1b"), Some(&json!(1)));
    }

    #[test]
    fn test_remove() {
        let mut v = json!({"a": {"b": 1, "c": 2}, "list": [1, 2, 3]});
        assert_eq!(remove(&mut v, "/a/b"), Some(json!(1)));
        assert_eq!(remove(&mut v, "/list/1"), Some(json!(2)));
        assert_eq!(remove(&mut v, "/missing/x"), None);
        assert_eq!(v, json!({"a": {"c": 2}, "list": [1, 3]}));
    }
}
