//! Fetch request shape shared by contexts and loaders.

use crate::model::entity::Attributes;
use crate::model::predicate::Predicate;
use rusqlite::types::Value as SqlValue;
use serde_json::Value;
use std::cmp::Ordering;

/// Sorts results by one top-level attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortDescriptor {
    pub key: String,
    pub ascending: bool,
}

impl SortDescriptor {
    pub fn ascending(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ascending: true,
        }
    }

    pub fn descending(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ascending: false,
        }
    }
}

/// Describes one fetch against an entity kind.
///
/// `fetch_limit == 0` means unlimited.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub entity: String,
    pub predicate: Option<Predicate>,
    pub sort: Vec<SortDescriptor>,
    pub fetch_limit: usize,
    pub fetch_offset: usize,
}

impl FetchRequest {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            predicate: None,
            sort: Vec::new(),
            fetch_limit: 0,
            fetch_offset: 0,
        }
    }

    pub fn with_predicate(mut self, predicate: Option<Predicate>) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn with_sort(mut self, sort: SortDescriptor) -> Self {
        self.sort.push(sort);
        self
    }

    pub fn with_limit(mut self, fetch_limit: usize) -> Self {
        self.fetch_limit = fetch_limit;
        self
    }

    /// Compares two attribute objects by this request's sort descriptors.
    ///
    /// Mirrors SQLite ordering of `json_extract` results: null, then
    /// numbers and booleans, then text. Ties compare equal so a stable
    /// sort keeps the store order.
    pub(crate) fn compare(&self, left: &Attributes, right: &Attributes) -> Ordering {
        for descriptor in &self.sort {
            let ordering = compare_sort_values(left.get(&descriptor.key), right.get(&descriptor.key));
            let ordering = if descriptor.ascending {
                ordering
            } else {
                ordering.reverse()
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Appends `ORDER BY ... LIMIT ... OFFSET ...` for the union query.
    pub(crate) fn write_tail(&self, sql: &mut String, binds: &mut Vec<SqlValue>) {
        sql.push_str(" ORDER BY ");
        for descriptor in &self.sort {
            sql.push_str("json_extract(attributes, ?) ");
            sql.push_str(if descriptor.ascending { "ASC, " } else { "DESC, " });
            binds.push(SqlValue::Text(format!(
                "$.\"{}\"",
                descriptor.key.replace('"', "\\\"")
            )));
        }
        sql.push_str("created_at ASC, id ASC");

        let limit = if self.fetch_limit == 0 {
            -1
        } else {
            i64::try_from(self.fetch_limit).unwrap_or(i64::MAX)
        };
        sql.push_str(" LIMIT ? OFFSET ?");
        binds.push(SqlValue::Integer(limit));
        binds.push(SqlValue::Integer(
            i64::try_from(self.fetch_offset).unwrap_or(i64::MAX),
        ));
    }
}

fn compare_sort_values(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    let left = SortValue::from_json(left);
    let right = SortValue::from_json(right);
    match (&left, &right) {
        (SortValue::Integer(a), SortValue::Integer(b)) => a.cmp(b),
        (SortValue::Text(a), SortValue::Text(b)) => a.cmp(b),
        _ if left.class() != right.class() => left.class().cmp(&right.class()),
        _ => left
            .as_f64()
            .partial_cmp(&right.as_f64())
            .unwrap_or(Ordering::Equal),
    }
}

enum SortValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SortValue {
    fn from_json(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => Self::Null,
            Some(Value::Bool(flag)) => Self::Integer(i64::from(*flag)),
            Some(Value::Number(number)) => match number.as_i64() {
                Some(integer) => Self::Integer(integer),
                None => Self::Real(number.as_f64().unwrap_or(f64::NAN)),
            },
            Some(Value::String(text)) => Self::Text(text.clone()),
            // json_extract yields nested values as minified JSON text.
            Some(other) => Self::Text(other.to_string()),
        }
    }

    fn class(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Integer(_) | Self::Real(_) => 1,
            Self::Text(_) => 2,
        }
    }

    fn as_f64(&self) -> f64 {
        match self {
            Self::Integer(integer) => *integer as f64,
            Self::Real(real) => *real,
            Self::Null | Self::Text(_) => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FetchRequest, SortDescriptor};
    use serde_json::{json, Map, Value};
    use std::cmp::Ordering;

    fn attributes(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("test attributes must be an object"),
        }
    }

    #[test]
    fn in_memory_ordering_follows_sqlite_storage_classes() {
        let request = FetchRequest::new("Expense").with_sort(SortDescriptor::ascending("amount"));
        let missing = attributes(json!({}));
        let small = attributes(json!({"amount": 2}));
        let fraction = attributes(json!({"amount": 2.5}));
        let text = attributes(json!({"amount": "10"}));

        assert_eq!(request.compare(&missing, &small), Ordering::Less);
        assert_eq!(request.compare(&small, &fraction), Ordering::Less);
        assert_eq!(request.compare(&fraction, &text), Ordering::Less);
        assert_eq!(request.compare(&small, &small), Ordering::Equal);

        let descending = FetchRequest::new("Expense")
            .with_sort(SortDescriptor::descending("amount"))
            .with_sort(SortDescriptor::ascending("title"));
        let a = attributes(json!({"amount": 5, "title": "a"}));
        let b = attributes(json!({"amount": 5, "title": "b"}));
        let c = attributes(json!({"amount": 9, "title": "c"}));
        assert_eq!(descending.compare(&c, &a), Ordering::Less);
        assert_eq!(descending.compare(&a, &b), Ordering::Less);
    }
}
