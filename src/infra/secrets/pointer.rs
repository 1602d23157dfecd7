//! RFC6901 JSON pointer codec.
//!
//! Pointers address values inside the decrypted secrets payload and are the
//! `id` form of file secret references. Escape order matters on encode
//! (`~` before `/`) and decode (`~1` before `~0`).

use anyhow::{bail, Result};
use serde_json::Value;

/// Behavior of [`read_json_pointer`] when the pointer does not resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnMissing {
    /// A missing value is an error.
    Fail,
    /// A missing value is reported as `None`.
    Absent,
}

/// Escape one reference token: `~` → `~0`, `/` → `~1`.
pub fn escape_pointer_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Split a pointer into unescaped reference tokens.
///
/// The empty pointer addresses the root and yields no tokens. Any other
/// pointer must start with `/`.
pub fn parse_json_pointer(pointer: &str) -> Result<Vec<String>> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = pointer.strip_prefix('/') else {
        bail!("Invalid JSON pointer \"{pointer}\": must be empty or start with \"/\"");
    };
    rest.split('/').map(unescape_pointer_token).collect()
}

fn unescape_pointer_token(token: &str) -> Result<String> {
    if !token.contains('~') {
        return Ok(token.to_string());
    }
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars();
    while let Some(c) = chars.next() {
        if c != '~' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('0') => out.push('~'),
            Some('1') => out.push('/'),
            _ => bail!(
                "Invalid JSON pointer token \"{token}\": \"~\" must be followed by 0 or 1"
            ),
        }
    }
    Ok(out)
}

/// Read the value a pointer addresses inside `root`.
///
/// Objects are traversed by key; arrays by decimal index. Traversal through
/// a scalar, an unknown key, or an out-of-range index counts as missing.
pub fn read_json_pointer<'a>(
    root: &'a Value,
    pointer: &str,
    on_missing: OnMissing,
) -> Result<Option<&'a Value>> {
    let tokens = parse_json_pointer(pointer)?;
    let mut current = root;
    for token in &tokens {
        let next = match current {
            Value::Object(map) => map.get(token),
            Value::Array(items) => token
                .parse::<usize>()
                .ok()
                .and_then(|idx| items.get(idx)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => {
                if on_missing == OnMissing::Fail {
                    bail!("JSON pointer \"{pointer}\" does not resolve to a value");
                }
                return Ok(None);
            }
        }
    }
    Ok(Some(current))
}

/// Set the value a pointer addresses inside `root`, creating intermediate
/// objects where missing. Replacing a non-object intermediate is an error,
/// as is setting the root itself.
pub fn set_json_pointer(root: &mut Value, pointer: &str, value: Value) -> Result<()> {
    let tokens = parse_json_pointer(pointer)?;
    let Some((last, parents)) = tokens.split_last() else {
        bail!("Cannot set the root of a document through an empty JSON pointer");
    };

    let mut current = root;
    for token in parents {
        let map = match current {
            Value::Object(map) => map,
            _ => bail!(
                "JSON pointer \"{pointer}\" traverses a non-object value at \"{token}\""
            ),
        };
        current = map
            .entry(token.clone())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if !current.is_object() {
            bail!("JSON pointer \"{pointer}\" traverses a non-object value at \"{token}\"");
        }
    }

    match current {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        _ => bail!("JSON pointer \"{pointer}\" addresses a member of a non-object value"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn escape_round_trip() {
        assert_eq!(escape_pointer_token("a/b~c"), "a~1b~0c");
        assert_eq!(unescape_pointer_token("a~1b~0c").unwrap(), "a/b~c");
    }

    #[test]
    fn parse_rejects_relative_pointer() {
        assert!(parse_json_pointer("providers/openai").is_err());
        assert!(parse_json_pointer(" ").is_err());
    }

    #[test]
    fn parse_empty_pointer_is_root() {
        assert!(parse_json_pointer("").unwrap().is_empty());
        let doc = json!({"a": 1});
        let value = read_json_pointer(&doc, "", OnMissing::Fail).unwrap();
        assert_eq!(value, Some(&doc));
    }

    #[test]
    fn parse_rejects_bad_escape() {
        assert!(parse_json_pointer("/a~2b").is_err());
        assert!(parse_json_pointer("/a~").is_err());
    }

    #[test]
    fn read_nested_object() {
        let doc = json!({"providers": {"openai": {"apiKey": "sk-test"}}});
        let value = read_json_pointer(&doc, "/providers/openai/apiKey", OnMissing::Fail)
            .unwrap()
            .unwrap();
        assert_eq!(value, "sk-test");
    }

    #[test]
    fn read_escaped_tokens() {
        let doc = json!({"a/b": {"c~d": 7}});
        let value = read_json_pointer(&doc, "/a~1b/c~0d", OnMissing::Fail)
            .unwrap()
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn read_array_index() {
        let doc = json!({"items": ["x", "y"]});
        let value = read_json_pointer(&doc, "/items/1", OnMissing::Fail)
            .unwrap()
            .unwrap();
        assert_eq!(value, "y");
    }

    #[test]
    fn read_missing_fails_or_returns_none() {
        let doc = json!({"a": {"b": 1}});
        assert!(read_json_pointer(&doc, "/a/x", OnMissing::Fail).is_err());
        assert_eq!(
            read_json_pointer(&doc, "/a/x", OnMissing::Absent).unwrap(),
            None
        );
        // Traversal through a scalar is missing too.
        assert_eq!(
            read_json_pointer(&doc, "/a/b/c", OnMissing::Absent).unwrap(),
            None
        );
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut doc = json!({});
        set_json_pointer(&mut doc, "/auth-profiles/main/openai/key", json!("sk-x")).unwrap();
        assert_eq!(doc["auth-profiles"]["main"]["openai"]["key"], "sk-x");
    }

    #[test]
    fn set_replaces_existing_value() {
        let mut doc = json!({"a": {"b": 1}});
        set_json_pointer(&mut doc, "/a/b", json!(2)).unwrap();
        assert_eq!(doc["a"]["b"], 2);
    }

    #[test]
    fn set_rejects_non_object_intermediate() {
        let mut doc = json!({"a": "scalar"});
        assert!(set_json_pointer(&mut doc, "/a/b", json!(1)).is_err());
    }

    #[test]
    fn set_rejects_empty_pointer() {
        let mut doc = json!({});
        assert!(set_json_pointer(&mut doc, "", json!(1)).is_err());
    }
}
