use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

/// `{{dotted.path}}` 占位符
static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([^{}\s]+)\s*\}\}").expect("placeholder pattern must compile")
});

/// Looks up a dotted path in `doc`. Numeric segments index into arrays.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Text form used when a placeholder is substituted inside a larger string.
fn render(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Binds every placeholder found in the string leaves of `args`.
///
/// Each placeholder resolves `prefix + path` against `doc`. Unresolved
/// placeholders are left in place unless `clear_unresolved` is set, in which
/// case they become blank. The engine calls this twice per step: once against
/// the root with an empty prefix, then with the thread path and clearing on.
pub fn bind_vars(prefix: &str, args: &mut Map<String, Value>, doc: &Value, clear_unresolved: bool) {
    for value in args.values_mut() {
        bind_value(prefix, value, doc, clear_unresolved);
    }
}

pub fn bind_value(prefix: &str, value: &mut Value, doc: &Value, clear_unresolved: bool) {
    match value {
        Value::Object(map) => bind_vars(prefix, map, doc, clear_unresolved),
        Value::Array(items) => {
            for item in items.iter_mut() {
                bind_value(prefix, item, doc, clear_unresolved);
            }
        }
        Value::String(text) => {
            if let Some(bound) = bind_text(prefix, text, doc, clear_unresolved) {
                *value = bound;
            }
        }
        _ => {}
    }
}

fn bind_text(prefix: &str, text: &str, doc: &Value, clear_unresolved: bool) -> Option<Value> {
    if !text.contains("{{") {
        return None;
    }

    // a lone placeholder keeps the structure of whatever it points at
    if let Some(captures) = PLACEHOLDER.captures(text) {
        let whole = captures.get(0).map(|m| m.as_str().len()) == Some(text.len());
        if whole {
            let path = format!("{prefix}{}", &captures[1]);
            if let Some(found @ (Value::Object(_) | Value::Array(_))) = lookup(doc, &path) {
                return Some(found.clone());
            }
        }
    }

    let mut changed = false;
    let bound = PLACEHOLDER.replace_all(text, |captures: &regex::Captures<'_>| {
        let path = format!("{prefix}{}", &captures[1]);
        match lookup(doc, &path).and_then(render) {
            Some(resolved) if !resolved.is_empty() => {
                changed = true;
                resolved
            }
            _ if clear_unresolved => {
                changed = true;
                String::new()
            }
            _ => captures[0].to_string(),
        }
    });

    changed.then(|| Value::String(bound.into_owned()))
}
