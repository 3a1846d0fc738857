//! Runtime-typed records and the on-disk record codec.
//!
//! A record is an insertion-ordered mapping from field name to [`Value`].
//! On disk each record is stored as a UTF-8 JSON object; field order is
//! preserved across encode/decode so an in-place rewrite of an unchanged
//! record is byte-identical.

use serde_json::Map;
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
/// Value stored in a record field.
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Floating-point value.
    Float(f64),
    /// Text value.
    Str(String),
}

impl Value {
    /// True for `Int` and `Float`.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    /// Numeric coercion: integers and floats as-is, booleans as 0/1,
    /// numeric text parsed. Returns `None` for everything else.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Str(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            Value::Null => None,
        }
    }

    /// Equality with numeric coercion: when either side is numeric both
    /// sides are compared as numbers, otherwise structurally.
    pub fn loose_eq(&self, other: &Value) -> bool {
        if self.is_numeric() || other.is_numeric() {
            match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => return a == b,
                _ => return false,
            }
        }
        self == other
    }

    /// Deterministic total order used by sorting and index keys:
    /// null < number < string < bool; numbers compare numerically and
    /// strings lexicographically.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Int(_) | Value::Float(_) => 1,
                Value::Str(_) => 2,
                Value::Bool(_) => 3,
            }
        }
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (a, b) if rank(a) == 1 && rank(b) == 1 => {
                let a = a.as_number().unwrap_or(f64::NAN);
                let b = b.as_number().unwrap_or(f64::NAN);
                a.total_cmp(&b)
            }
            (a, b) => rank(a).cmp(&rank(b)),
        }
    }

    /// Canonical string form used for hash-join buckets and GROUP BY keys.
    /// Whole floats collapse to their integer form so `1` and `1.0` land in
    /// the same bucket.
    pub fn key_string(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(n) => {
                if n.is_finite() && n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                    (*n as i64).to_string()
                } else {
                    n.to_string()
                }
            }
            Value::Str(s) => s.clone(),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Float(n) => serde_json::Value::from(*n),
            Value::Str(s) => serde_json::Value::String(s.clone()),
        }
    }

    fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::Str(s.clone()),
            // Nested arrays/objects are outside the value model; keep their
            // textual form so the record survives a round trip.
            other => Value::Str(other.to_string()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
/// An insertion-ordered field → value map.
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    /// Create an empty record.
    pub fn new() -> Self {
        Record { fields: Vec::new() }
    }

    /// Build a record from field/value pairs.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (impl Into<String>, Value)>) -> Self {
        let mut record = Record::new();
        for (key, value) in pairs {
            record.insert(key.into(), value);
        }
        record
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    /// True when the field is present, even with a null value.
    pub fn contains_field(&self, key: &str) -> bool {
        self.fields.iter().any(|(name, _)| name == key)
    }

    /// Set a field. An existing field keeps its position; a new field is
    /// appended.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        match self.fields.iter_mut().find(|(name, _)| *name == key) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let idx = self.fields.iter().position(|(name, _)| name == key)?;
        Some(self.fields.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    /// Serialize to the UTF-8 JSON object stored on a heap page.
    pub fn to_json_vec(&self) -> Vec<u8> {
        serde_json::to_vec(&self.to_json_value()).unwrap_or_else(|_| b"{}".to_vec())
    }

    /// Canonical JSON text, used for structural deduplication.
    pub fn to_json_string(&self) -> String {
        String::from_utf8(self.to_json_vec()).unwrap_or_default()
    }

    /// Decode a record from its JSON byte run. Fails when the bytes are not
    /// a JSON object.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let top: serde_json::Value = serde_json::from_slice(bytes)?;
        Self::from_json_value(&top)
            .ok_or_else(|| serde::de::Error::custom("record is not a JSON object"))
    }

    pub(crate) fn to_json_value(&self) -> serde_json::Value {
        let mut map = Map::with_capacity(self.fields.len());
        for (name, value) in &self.fields {
            map.insert(name.clone(), value.to_json());
        }
        serde_json::Value::Object(map)
    }

    pub(crate) fn from_json_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Object(map) => {
                let mut record = Record::new();
                for (name, value) in map {
                    record.insert(name.clone(), Value::from_json(value));
                }
                Some(record)
            }
            _ => None,
        }
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        let mut record = Record::new();
        for (key, value) in iter {
            record.insert(key, value);
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_round_trip_preserves_field_order() {
        let record = Record::from_pairs([
            ("id", Value::Int(7)),
            ("name", Value::Str("gamelan".into())),
            ("weight", Value::Float(2.5)),
            ("active", Value::Bool(true)),
            ("note", Value::Null),
        ]);
        let bytes = record.to_json_vec();
        let decoded = Record::from_json_slice(&bytes).unwrap();
        assert_eq!(record, decoded);
        let names: Vec<&str> = decoded.field_names().collect();
        assert_eq!(names, vec!["id", "name", "weight", "active", "note"]);
    }

    #[test]
    fn insert_keeps_position_of_existing_field() {
        let mut record = Record::from_pairs([("a", Value::Int(1)), ("b", Value::Int(2))]);
        record.insert("a", Value::Int(9));
        let names: Vec<&str> = record.field_names().collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(record.get("a"), Some(&Value::Int(9)));
    }

    #[test]
    fn loose_eq_coerces_numbers() {
        assert!(Value::Int(1).loose_eq(&Value::Float(1.0)));
        assert!(Value::Int(5).loose_eq(&Value::Str("5".into())));
        assert!(!Value::Int(5).loose_eq(&Value::Str("x".into())));
        assert!(!Value::Str("a".into()).loose_eq(&Value::Str("b".into())));
        assert!(Value::Str("a".into()).loose_eq(&Value::Str("a".into())));
    }

    #[test]
    fn total_order_ranks_types_deterministically() {
        let mut values = vec![
            Value::Str("a".into()),
            Value::Bool(false),
            Value::Int(3),
            Value::Null,
            Value::Float(1.5),
        ];
        values.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Float(1.5),
                Value::Int(3),
                Value::Str("a".into()),
                Value::Bool(false),
            ]
        );
    }

    #[test]
    fn key_string_collapses_whole_floats() {
        assert_eq!(Value::Int(1).key_string(), Value::Float(1.0).key_string());
        assert_ne!(Value::Float(1.5).key_string(), Value::Int(1).key_string());
    }

    #[test]
    fn malformed_bytes_fail_to_decode() {
        assert!(Record::from_json_slice(b"{not json").is_err());
        assert!(Record::from_json_slice(b"[1,2]").is_err());
    }
}
