//! Conversion between JSON values and Automerge objects.
//!
//! Records are stored as nested maps so that concurrent edits to different
//! fields of one record both survive a merge. List writes keep existing
//! elements in place whenever the record id still matches, which preserves
//! element identity across devices.

use automerge::transaction::Transactable;
use automerge::{AutoCommit, AutomergeError, ObjId, ObjType, ReadDoc, ScalarValue, Value};
use serde_json::{Map, Number, Value as JsonValue};

/// Reads `obj` (a map, list or text object) as JSON.
pub fn read_object(doc: &AutoCommit, obj: &ObjId) -> Result<JsonValue, AutomergeError> {
    match doc.object_type(obj)? {
        ObjType::Map | ObjType::Table => {
            let mut map = Map::new();
            for key in doc.keys(obj) {
                if let Some((value, id)) = doc.get(obj, key.as_str())? {
                    map.insert(key, value_to_json(doc, &value, &id)?);
                }
            }
            Ok(JsonValue::Object(map))
        }
        ObjType::List => {
            let length = doc.length(obj);
            let mut items = Vec::with_capacity(length);
            for index in 0..length {
                if let Some((value, id)) = doc.get(obj, index)? {
                    items.push(value_to_json(doc, &value, &id)?);
                }
            }
            Ok(JsonValue::Array(items))
        }
        ObjType::Text => Ok(JsonValue::String(doc.text(obj)?)),
    }
}

fn value_to_json(doc: &AutoCommit, value: &Value, id: &ObjId) -> Result<JsonValue, AutomergeError> {
    match value {
        Value::Object(_) => read_object(doc, id),
        Value::Scalar(scalar) => Ok(scalar_to_json(scalar.as_ref())),
    }
}

fn scalar_to_json(scalar: &ScalarValue) -> JsonValue {
    match scalar {
        ScalarValue::Str(s) => JsonValue::String(s.to_string()),
        ScalarValue::Int(i) => JsonValue::Number((*i).into()),
        ScalarValue::Uint(u) => JsonValue::Number((*u).into()),
        ScalarValue::Timestamp(t) => JsonValue::Number((*t).into()),
        ScalarValue::F64(f) => Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        ScalarValue::Boolean(b) => JsonValue::Bool(*b),
        _ => JsonValue::Null,
    }
}

fn json_to_scalar(value: &JsonValue) -> ScalarValue {
    match value {
        JsonValue::Bool(b) => ScalarValue::Boolean(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                ScalarValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                ScalarValue::Uint(u)
            } else {
                ScalarValue::F64(n.as_f64().unwrap_or_default())
            }
        }
        JsonValue::String(s) => ScalarValue::from(s.as_str()),
        _ => ScalarValue::Null,
    }
}

/// Writes `value` under `key` of map `obj`, replacing whatever was there.
pub fn put_value(
    doc: &mut AutoCommit,
    obj: &ObjId,
    key: &str,
    value: &JsonValue,
) -> Result<(), AutomergeError> {
    match value {
        JsonValue::Object(map) => {
            let child = doc.put_object(obj, key, ObjType::Map)?;
            fill_map(doc, &child, map)
        }
        JsonValue::Array(items) => {
            let child = doc.put_object(obj, key, ObjType::List)?;
            fill_list(doc, &child, items)
        }
        scalar => doc.put(obj, key, json_to_scalar(scalar)),
    }
}

/// Inserts `value` into list `obj` at `index`.
pub fn insert_value(
    doc: &mut AutoCommit,
    obj: &ObjId,
    index: usize,
    value: &JsonValue,
) -> Result<(), AutomergeError> {
    match value {
        JsonValue::Object(map) => {
            let child = doc.insert_object(obj, index, ObjType::Map)?;
            fill_map(doc, &child, map)
        }
        JsonValue::Array(items) => {
            let child = doc.insert_object(obj, index, ObjType::List)?;
            fill_list(doc, &child, items)
        }
        scalar => doc.insert(obj, index, json_to_scalar(scalar)),
    }
}

fn fill_map(
    doc: &mut AutoCommit,
    obj: &ObjId,
    map: &Map<String, JsonValue>,
) -> Result<(), AutomergeError> {
    for (key, value) in map {
        put_value(doc, obj, key, value)?;
    }
    Ok(())
}

fn fill_list(doc: &mut AutoCommit, obj: &ObjId, items: &[JsonValue]) -> Result<(), AutomergeError> {
    for (index, value) in items.iter().enumerate() {
        insert_value(doc, obj, index, value)?;
    }
    Ok(())
}

enum Existing {
    Map(ObjId),
    Json(JsonValue),
}

/// Updates map `obj` to equal `map`, touching only fields that changed.
pub fn update_map(
    doc: &mut AutoCommit,
    obj: &ObjId,
    map: &Map<String, JsonValue>,
) -> Result<(), AutomergeError> {
    let stale: Vec<String> = doc.keys(obj).filter(|key| !map.contains_key(key)).collect();
    for key in stale {
        doc.delete(obj, key.as_str())?;
    }

    for (key, value) in map {
        let existing = match doc.get(obj, key.as_str())? {
            Some((Value::Object(ObjType::Map), id)) => Some(Existing::Map(id)),
            Some((value, id)) => Some(Existing::Json(value_to_json(doc, &value, &id)?)),
            None => None,
        };

        match (existing, value) {
            (Some(Existing::Map(child)), JsonValue::Object(fields)) => {
                update_map(doc, &child, fields)?;
            }
            (Some(Existing::Json(current)), value) if current == *value => {}
            _ => put_value(doc, obj, key, value)?,
        }
    }
    Ok(())
}

/// Id of the record at `index` of list `obj`, if it is a map with an id.
pub fn record_id_at(
    doc: &AutoCommit,
    obj: &ObjId,
    index: usize,
) -> Result<Option<String>, AutomergeError> {
    let record = match doc.get(obj, index)? {
        Some((Value::Object(ObjType::Map), record)) => record,
        _ => return Ok(None),
    };
    match doc.get(&record, "id")? {
        Some((Value::Scalar(scalar), _)) => match scalar.as_ref() {
            ScalarValue::Str(s) => Ok(Some(s.to_string())),
            _ => Ok(None),
        },
        _ => Ok(None),
    }
}

fn record_ids(doc: &AutoCommit, obj: &ObjId) -> Result<Vec<Option<String>>, AutomergeError> {
    (0..doc.length(obj))
        .map(|index| record_id_at(doc, obj, index))
        .collect()
}

fn json_id(value: &JsonValue) -> Option<&str> {
    value.get("id").and_then(JsonValue::as_str)
}

fn update_at(
    doc: &mut AutoCommit,
    obj: &ObjId,
    index: usize,
    value: &JsonValue,
) -> Result<(), AutomergeError> {
    let record = match doc.get(obj, index)? {
        Some((Value::Object(ObjType::Map), record)) => Some(record),
        _ => None,
    };
    match (record, value) {
        (Some(record), JsonValue::Object(fields)) => update_map(doc, &record, fields),
        _ => {
            doc.delete(obj, index)?;
            insert_value(doc, obj, index, value)
        }
    }
}

/// Appends `value` to list `obj`.
pub fn list_push(doc: &mut AutoCommit, obj: &ObjId, value: &JsonValue) -> Result<(), AutomergeError> {
    let end = doc.length(obj);
    insert_value(doc, obj, end, value)
}

/// Updates the record with the same id in place, or appends it.
pub fn list_upsert(
    doc: &mut AutoCommit,
    obj: &ObjId,
    value: &JsonValue,
) -> Result<(), AutomergeError> {
    let Some(id) = json_id(value) else {
        return list_push(doc, obj, value);
    };
    let ids = record_ids(doc, obj)?;
    match ids.iter().position(|existing| existing.as_deref() == Some(id)) {
        Some(index) => update_at(doc, obj, index, value),
        None => list_push(doc, obj, value),
    }
}

/// Deletes every record with `id`. Returns how many were removed.
pub fn list_remove(doc: &mut AutoCommit, obj: &ObjId, id: &str) -> Result<usize, AutomergeError> {
    let ids = record_ids(doc, obj)?;
    let mut removed = 0;
    for (index, existing) in ids.iter().enumerate().rev() {
        if existing.as_deref() == Some(id) {
            doc.delete(obj, index)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Appends every value whose id list `obj` does not hold yet. Values
/// without an id are always appended. Returns how many were added.
pub fn list_append_missing(
    doc: &mut AutoCommit,
    obj: &ObjId,
    values: &[JsonValue],
) -> Result<usize, AutomergeError> {
    let mut present: std::collections::HashSet<String> =
        record_ids(doc, obj)?.into_iter().flatten().collect();
    let mut added = 0;
    for value in values {
        if let Some(id) = json_id(value) {
            if !present.insert(id.to_string()) {
                continue;
            }
        }
        list_push(doc, obj, value)?;
        added += 1;
    }
    Ok(added)
}

/// Makes list `obj` hold exactly `values`, in order.
///
/// Records whose id is still present are updated field by field instead of
/// being re-created; records that vanished are deleted.
pub fn list_replace(
    doc: &mut AutoCommit,
    obj: &ObjId,
    values: &[JsonValue],
) -> Result<(), AutomergeError> {
    let wanted: std::collections::HashSet<&str> = values.iter().filter_map(json_id).collect();

    // Drop records that are gone, duplicated or have no id.
    let ids = record_ids(doc, obj)?;
    let mut seen = std::collections::HashSet::new();
    let mut doomed = Vec::new();
    for (index, id) in ids.iter().enumerate() {
        let keep = match id.as_deref() {
            Some(id) => wanted.contains(id) && seen.insert(id.to_string()),
            None => false,
        };
        if !keep {
            doomed.push(index);
        }
    }
    for index in doomed.into_iter().rev() {
        doc.delete(obj, index)?;
    }

    for (index, value) in values.iter().enumerate() {
        let id = json_id(value);
        let length = doc.length(obj);
        if index < length && id.is_some() && record_id_at(doc, obj, index)?.as_deref() == id {
            update_at(doc, obj, index, value)?;
            continue;
        }

        if let Some(id) = id {
            let mut moved_from = None;
            for later in index + 1..length {
                if record_id_at(doc, obj, later)?.as_deref() == Some(id) {
                    moved_from = Some(later);
                    break;
                }
            }
            if let Some(later) = moved_from {
                doc.delete(obj, later)?;
            }
        }
        insert_value(doc, obj, index, value)?;
    }

    while doc.length(obj) > values.len() {
        doc.delete(obj, values.len())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use automerge::ROOT;
    use serde_json::json;

    fn doc_with_list() -> (AutoCommit, ObjId) {
        let mut doc = AutoCommit::new();
        let list = doc.put_object(ROOT, "items", ObjType::List).unwrap();
        (doc, list)
    }

    #[test]
    fn test_nested_values_round_trip() {
        let mut doc = AutoCommit::new();
        let value = json!({
            "id": "r1",
            "dosageAmount": 2.5,
            "count": 3,
            "flag": true,
            "missing": null,
            "schedule": {"type": "daily", "times": ["08:00", "20:00"]}
        });
        put_value(&mut doc, &ROOT, "record", &value).unwrap();

        let read = read_object(&doc, &ROOT).unwrap();
        assert_eq!(read["record"], value);
    }

    #[test]
    fn test_upsert_updates_in_place() {
        let (mut doc, list) = doc_with_list();
        list_push(&mut doc, &list, &json!({"id": "a", "n": 1})).unwrap();
        list_push(&mut doc, &list, &json!({"id": "b", "n": 2})).unwrap();

        list_upsert(&mut doc, &list, &json!({"id": "a", "n": 10})).unwrap();
        list_upsert(&mut doc, &list, &json!({"id": "c", "n": 3})).unwrap();

        assert_eq!(
            read_object(&doc, &list).unwrap(),
            json!([{"id": "a", "n": 10}, {"id": "b", "n": 2}, {"id": "c", "n": 3}])
        );
    }

    #[test]
    fn test_update_map_removes_dropped_fields() {
        let (mut doc, list) = doc_with_list();
        list_push(&mut doc, &list, &json!({"id": "a", "notes": "x", "n": 1})).unwrap();
        list_upsert(&mut doc, &list, &json!({"id": "a", "n": 1})).unwrap();
        assert_eq!(read_object(&doc, &list).unwrap(), json!([{"id": "a", "n": 1}]));
    }

    #[test]
    fn test_remove_deletes_duplicates() {
        let (mut doc, list) = doc_with_list();
        list_push(&mut doc, &list, &json!({"id": "a"})).unwrap();
        list_push(&mut doc, &list, &json!({"id": "b"})).unwrap();
        list_push(&mut doc, &list, &json!({"id": "a"})).unwrap();

        assert_eq!(list_remove(&mut doc, &list, "a").unwrap(), 2);
        assert_eq!(read_object(&doc, &list).unwrap(), json!([{"id": "b"}]));
    }

    #[test]
    fn test_replace_reorders_and_prunes() {
        let (mut doc, list) = doc_with_list();
        for id in ["a", "b", "c", "b"] {
            list_push(&mut doc, &list, &json!({"id": id})).unwrap();
        }

        let next = vec![json!({"id": "c", "v": 1}), json!({"id": "d"}), json!({"id": "a"})];
        list_replace(&mut doc, &list, &next).unwrap();

        assert_eq!(read_object(&doc, &list).unwrap(), JsonValue::Array(next));
    }

    #[test]
    fn test_append_missing_leaves_existing_untouched() {
        let (mut doc, list) = doc_with_list();
        list_push(&mut doc, &list, &json!({"id": "a", "extra": "kept"})).unwrap();

        let incoming = vec![
            json!({"id": "a", "n": 1}),
            json!({"id": "b", "n": 2.5}),
            json!({"id": "b", "n": 3}),
            json!({"note": "no id"}),
        ];
        assert_eq!(list_append_missing(&mut doc, &list, &incoming).unwrap(), 2);
        assert_eq!(
            read_object(&doc, &list).unwrap(),
            json!([{"id": "a", "extra": "kept"}, {"id": "b", "n": 2.5}, {"note": "no id"}])
        );
    }

    #[test]
    fn test_replace_with_empty_clears() {
        let (mut doc, list) = doc_with_list();
        list_push(&mut doc, &list, &json!({"id": "a"})).unwrap();
        list_replace(&mut doc, &list, &[]).unwrap();
        assert_eq!(doc.length(&list), 0);
    }

    #[test]
    fn test_record_id_at_ignores_scalars() {
        let (mut doc, list) = doc_with_list();
        doc.insert(&list, 0, "plain").unwrap();
        assert_eq!(record_id_at(&doc, &list, 0).unwrap(), None);
        assert_eq!(record_id_at(&doc, &list, 5).unwrap(), None);
    }
}
