//! Merging several rows into one editable buffer, and diffing buffers.
//!
//! Where the source rows disagree the buffer holds [`Merged::Multiple`] instead
//! of a value. Plain objects are merged key by key, so a disagreement deep in
//! a nested object only marks that leaf. Lists are compared as whole values.

use std::collections::BTreeMap;

use ballotdesk_core::field_value::{FieldValue, Fields};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Merged {
    Concrete(FieldValue),
    /// The selected rows disagree here.
    Multiple,
    /// Objects that disagree below this key. A key missing from the map leaves
    /// each row's own value in place when the buffer is written back.
    Nested(BTreeMap<String, Merged>),
}

pub fn is_multiple(value: &Merged) -> bool {
    matches!(value, Merged::Multiple)
}

impl Merged {
    /// True unless the value is the same concrete value for every row.
    pub fn contains_multiple(&self) -> bool {
        !matches!(self, Merged::Concrete(_))
    }

    pub fn as_concrete(&self) -> Option<&FieldValue> {
        match self {
            Merged::Concrete(v) => Some(v),
            _ => None,
        }
    }

    /// Turn this buffer value into a concrete write for one row whose current
    /// value is `base`. `Multiple` keeps the row's value; `None` means leave the
    /// key out of the write.
    pub fn resolve_against(&self, base: Option<&FieldValue>) -> Option<FieldValue> {
        match self {
            Merged::Concrete(v) => Some(v.clone()),
            Merged::Multiple => base.cloned(),
            Merged::Nested(map) => {
                let mut object = base
                    .and_then(FieldValue::as_object)
                    .cloned()
                    .unwrap_or_default();
                for (key, child) in map {
                    if let Some(v) = child.resolve_against(object.get(key)) {
                        object.insert(key.clone(), v);
                    }
                }
                Some(FieldValue::Object(object))
            }
        }
    }
}

/// Top-level keys whose buffer values changed, carrying the edited value.
pub type Changes = BTreeMap<String, Merged>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    fields: BTreeMap<String, Merged>,
}

impl Buffer {
    pub fn get(&self, key: &str) -> Option<&Merged> {
        self.fields.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Merged)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn set(&mut self, key: &str, value: FieldValue) {
        self.fields.insert(key.to_string(), Merged::Concrete(value));
    }

    /// Set one leaf inside nested objects, e.g. `["Motion", "Result"]`.
    pub fn set_path(&mut self, path: &[&str], value: FieldValue) {
        let Some((head, rest)) = path.split_first() else {
            return;
        };
        let slot = self
            .fields
            .entry(head.to_string())
            .or_insert(Merged::Concrete(FieldValue::Null));
        set_merged_path(slot, rest, value);
    }

    pub fn has_multiple(&self) -> bool {
        self.fields.values().any(Merged::contains_multiple)
    }

    /// The plain field map, or `None` if any field is not concrete.
    pub fn into_fields(self) -> Option<Fields> {
        self.fields
            .into_iter()
            .map(|(k, m)| match m {
                Merged::Concrete(v) => Some((k, v)),
                _ => None,
            })
            .collect()
    }
}

fn set_merged_path(slot: &mut Merged, path: &[&str], value: FieldValue) {
    let Some((head, rest)) = path.split_first() else {
        *slot = Merged::Concrete(value);
        return;
    };
    match slot {
        Merged::Concrete(FieldValue::Object(map)) => set_value_path(map, path, value),
        Merged::Concrete(_) => {
            let mut map = BTreeMap::new();
            set_value_path(&mut map, path, value);
            *slot = Merged::Concrete(FieldValue::Object(map));
        }
        Merged::Multiple => {
            let mut map = BTreeMap::new();
            let mut child = Merged::Multiple;
            set_merged_path(&mut child, rest, value);
            map.insert(head.to_string(), child);
            *slot = Merged::Nested(map);
        }
        Merged::Nested(map) => {
            let child = map.entry(head.to_string()).or_insert(Merged::Multiple);
            set_merged_path(child, rest, value);
        }
    }
}

fn set_value_path(map: &mut BTreeMap<String, FieldValue>, path: &[&str], value: FieldValue) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };
    if rest.is_empty() {
        map.insert(head.to_string(), value);
        return;
    }
    let child = map
        .entry(head.to_string())
        .or_insert_with(|| FieldValue::Object(BTreeMap::new()));
    if !matches!(child, FieldValue::Object(_)) {
        *child = FieldValue::Object(BTreeMap::new());
    }
    if let FieldValue::Object(inner) = child {
        set_value_path(inner, rest, value);
    }
}

/// Merge the field maps of the selected rows. A single row merges to itself.
pub fn merge_tagged(rows: &[Fields]) -> Buffer {
    let mut keys: Vec<&String> = rows.iter().flat_map(|r| r.keys()).collect();
    keys.sort();
    keys.dedup();

    let mut fields = BTreeMap::new();
    for key in keys {
        let values: Vec<Option<&FieldValue>> = rows.iter().map(|r| r.get(key)).collect();
        if let Some(merged) = merge_values(&values) {
            fields.insert(key.clone(), merged);
        }
    }
    Buffer { fields }
}

fn merge_values(values: &[Option<&FieldValue>]) -> Option<Merged> {
    if values.iter().all(Option::is_none) {
        return None;
    }
    let present: Vec<&FieldValue> = values.iter().flatten().copied().collect();
    if present.len() < values.len() {
        return Some(Merged::Multiple);
    }
    let first = present[0];
    if present.iter().all(|v| *v == first) {
        return Some(Merged::Concrete(first.clone()));
    }

    let objects: Option<Vec<&BTreeMap<String, FieldValue>>> =
        present.iter().map(|v| v.as_object()).collect();
    let Some(objects) = objects else {
        return Some(Merged::Multiple);
    };

    let mut keys: Vec<&String> = objects.iter().flat_map(|o| o.keys()).collect();
    keys.sort();
    keys.dedup();
    let mut nested = BTreeMap::new();
    for key in keys {
        let inner: Vec<Option<&FieldValue>> = objects.iter().map(|o| o.get(key)).collect();
        if let Some(merged) = merge_values(&inner) {
            nested.insert(key.clone(), merged);
        }
    }
    Some(Merged::Nested(nested))
}

pub fn diff(saved: &Buffer, edited: &Buffer) -> Changes {
    edited
        .fields
        .iter()
        .filter(|(key, value)| saved.fields.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Concrete counterpart of [`diff`] that also reports removed keys: every key
/// whose value differs between the two maps, carrying the value in `to`
/// (`None` where `to` lacks the key).
pub fn diff_fields(from: &Fields, to: &Fields) -> BTreeMap<String, Option<FieldValue>> {
    let mut changes = BTreeMap::new();
    for (key, value) in to {
        if from.get(key) != Some(value) {
            changes.insert(key.clone(), Some(value.clone()));
        }
    }
    for key in from.keys() {
        if !to.contains_key(key) {
            changes.insert(key.clone(), None);
        }
    }
    changes
}

/// Resolve a change-set into a concrete write for one row.
pub fn resolve_changes(changes: &Changes, base: &Fields) -> Fields {
    changes
        .iter()
        .filter_map(|(key, merged)| {
            merged
                .resolve_against(base.get(key))
                .map(|value| (key.clone(), value))
        })
        .collect()
}
