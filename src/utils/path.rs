use serde_json::{Map, Value};

/// Writes `value` at a dotted path, creating intermediate objects. A
/// non-container found on the way is replaced by an object.
pub fn assign(doc: &mut Value, path: &str, value: Value) {
    let mut segments = path.split('.').peekable();
    let mut current = doc;
    while let Some(segment) = segments.next() {
        let last = segments.peek().is_none();
        let index = match &*current {
            Value::Array(items) => segment.parse::<usize>().ok().filter(|i| *i < items.len()),
            _ => None,
        };
        if let Some(index) = index {
            let Value::Array(items) = current else {
                return;
            };
            if last {
                items[index] = value;
                return;
            }
            current = &mut items[index];
            continue;
        }
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        if last {
            map.insert(segment.to_string(), value);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Removes and returns the value at a dotted path.
pub fn remove(doc: &mut Value, path: &str) -> Option<Value> {
    let (parent, leaf) = match path.rsplit_once('.') {
        Some((parent, leaf)) => (lookup_mut(doc, parent)?, leaf),
        None => (doc, path),
    };
    match parent {
        Value::Object(map) => map.remove(leaf),
        Value::Array(items) => {
            let index = leaf.parse::<usize>().ok().filter(|i| *i < items.len())?;
            Some(items.remove(index))
        }
        _ => None,
    }
}

/// Appends to the list at `path`; a missing or non-list value starts a new list.
pub fn append(doc: &mut Value, path: &str, value: Value) {
    match lookup_mut(doc, path) {
        Some(Value::Array(items)) => items.push(value),
        _ => assign(doc, path, Value::Array(vec![value])),
    }
}

pub fn lookup_mut<'a>(doc: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get_mut(segment)?,
            Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
