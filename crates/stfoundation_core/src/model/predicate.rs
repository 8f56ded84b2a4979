//! Query predicates over record attributes.
//!
//! # Responsibility
//! - Describe record filters independently of where they are evaluated.
//! - Translate filters into SQL over the JSON `attributes` column.
//! - Evaluate the same filters in memory for remote mirror backends.
//!
//! # Invariants
//! - Attribute keys are always bound as JSON path parameters, never spliced
//!   into SQL text.
//! - Comparisons between values of different JSON types never match.
//! - A missing attribute compares as null: `ne` against a value matches it.

use crate::model::entity::{Attributes, EntityId};
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparison {
    fn sql_operator(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
        }
    }
}

/// Filter token passed through to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    /// Matches every record.
    All,
    /// Matches the record with this identifier.
    IdEquals { id: EntityId },
    /// Compares a top-level attribute against a JSON value.
    Compare {
        key: String,
        comparison: Comparison,
        value: Value,
    },
    /// Case-sensitive substring match on a string attribute.
    Contains { key: String, needle: String },
    /// Matches records where the attribute is missing or null.
    IsNull { key: String },
    And { predicates: Vec<Predicate> },
    Or { predicates: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
}

impl Predicate {
    pub fn id(id: EntityId) -> Self {
        Self::IdEquals { id }
    }

    pub fn eq(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(key, Comparison::Eq, value)
    }

    pub fn ne(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(key, Comparison::Ne, value)
    }

    pub fn lt(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(key, Comparison::Lt, value)
    }

    pub fn le(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(key, Comparison::Le, value)
    }

    pub fn gt(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(key, Comparison::Gt, value)
    }

    pub fn ge(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(key, Comparison::Ge, value)
    }

    pub fn compare(key: impl Into<String>, comparison: Comparison, value: impl Into<Value>) -> Self {
        Self::Compare {
            key: key.into(),
            comparison,
            value: value.into(),
        }
    }

    pub fn contains(key: impl Into<String>, needle: impl Into<String>) -> Self {
        Self::Contains {
            key: key.into(),
            needle: needle.into(),
        }
    }

    pub fn is_null(key: impl Into<String>) -> Self {
        Self::IsNull { key: key.into() }
    }

    pub fn and(predicates: Vec<Predicate>) -> Self {
        Self::And { predicates }
    }

    pub fn or(predicates: Vec<Predicate>) -> Self {
        Self::Or { predicates }
    }

    pub fn not(predicate: Predicate) -> Self {
        Self::Not {
            predicate: Box::new(predicate),
        }
    }

    /// Appends the SQL form of this predicate to `sql`, pushing bind values.
    ///
    /// The fragment references the `id` and `attributes` columns of `records`.
    pub(crate) fn write_sql(&self, sql: &mut String, binds: &mut Vec<SqlValue>) {
        match self {
            Self::All => sql.push_str("1 = 1"),
            Self::IdEquals { id } => {
                sql.push_str("id = ?");
                binds.push(SqlValue::Text(id.to_string()));
            }
            Self::Compare {
                key,
                comparison,
                value,
            } => {
                if value.is_null() {
                    match comparison {
                        Comparison::Eq => return Self::is_null(key).write_sql(sql, binds),
                        Comparison::Ne => {
                            return Self::not(Self::is_null(key)).write_sql(sql, binds)
                        }
                        // Ordering against null never matches.
                        _ => return sql.push_str("1 = 0"),
                    }
                }
                // SQLite orders across storage classes; JSON types must match first.
                sql.push('(');
                if *comparison == Comparison::Ne {
                    sql.push_str("coalesce(json_type(attributes, ?), 'null') = 'null' OR ");
                    binds.push(SqlValue::Text(json_path(key)));
                }
                sql.push_str("(json_type(attributes, ?) IN (");
                sql.push_str(sql_json_types(value));
                sql.push_str(") AND json_extract(attributes, ?) ");
                sql.push_str(comparison.sql_operator());
                sql.push_str(" ?))");
                binds.push(SqlValue::Text(json_path(key)));
                binds.push(SqlValue::Text(json_path(key)));
                binds.push(json_to_sql(value));
            }
            Self::Contains { key, needle } => {
                sql.push_str(
                    "(json_type(attributes, ?) = 'text' AND instr(json_extract(attributes, ?), ?) > 0)",
                );
                binds.push(SqlValue::Text(json_path(key)));
                binds.push(SqlValue::Text(json_path(key)));
                binds.push(SqlValue::Text(needle.clone()));
            }
            Self::IsNull { key } => {
                sql.push_str("json_extract(attributes, ?) IS NULL");
                binds.push(SqlValue::Text(json_path(key)));
            }
            Self::And { predicates } => write_group(sql, binds, predicates, " AND ", "1 = 1"),
            Self::Or { predicates } => write_group(sql, binds, predicates, " OR ", "1 = 0"),
            Self::Not { predicate } => {
                // NULL-safe negation: a missing attribute must not swallow the row.
                sql.push_str("NOT coalesce((");
                predicate.write_sql(sql, binds);
                sql.push_str("), 0)");
            }
        }
    }

    /// Evaluates this predicate against one record snapshot.
    pub fn matches(&self, id: EntityId, attributes: &Attributes) -> bool {
        match self {
            Self::All => true,
            Self::IdEquals { id: expected } => *expected == id,
            Self::Compare {
                key,
                comparison,
                value,
            } => {
                let actual = attributes.get(key).unwrap_or(&Value::Null);
                if value.is_null() || actual.is_null() {
                    let both_null = value.is_null() && actual.is_null();
                    return match comparison {
                        Comparison::Eq => both_null,
                        Comparison::Ne => !both_null,
                        _ => false,
                    };
                }
                compare_json(actual, value).is_some_and(|ordering| comparison.accepts(ordering))
            }
            Self::Contains { key, needle } => attributes
                .get(key)
                .and_then(Value::as_str)
                .is_some_and(|text| text.contains(needle.as_str())),
            Self::IsNull { key } => attributes.get(key).map_or(true, Value::is_null),
            Self::And { predicates } => predicates.iter().all(|p| p.matches(id, attributes)),
            Self::Or { predicates } => predicates.iter().any(|p| p.matches(id, attributes)),
            Self::Not { predicate } => !predicate.matches(id, attributes),
        }
    }
}

impl Default for Predicate {
    fn default() -> Self {
        Self::All
    }
}

fn write_group(
    sql: &mut String,
    binds: &mut Vec<SqlValue>,
    predicates: &[Predicate],
    joiner: &str,
    empty: &str,
) {
    if predicates.is_empty() {
        sql.push_str(empty);
        return;
    }
    sql.push('(');
    for (index, predicate) in predicates.iter().enumerate() {
        if index > 0 {
            sql.push_str(joiner);
        }
        sql.push('(');
        predicate.write_sql(sql, binds);
        sql.push(')');
    }
    sql.push(')');
}

fn json_path(key: &str) -> String {
    format!("$.\"{}\"", key.replace('"', "\\\""))
}

/// `json_type` names comparable with `value` in memory.
fn sql_json_types(value: &Value) -> &'static str {
    match value {
        Value::Null => "'null'",
        Value::Bool(_) => "'true', 'false'",
        Value::Number(_) => "'integer', 'real'",
        Value::String(_) => "'text'",
        Value::Array(_) => "'array'",
        Value::Object(_) => "'object'",
    }
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => SqlValue::Integer(integer),
            None => SqlValue::Real(number.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        // json_extract returns nested values as minified JSON text.
        other => SqlValue::Text(other.to_string()),
    }
}

fn compare_json(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            if left == right {
                Some(Ordering::Equal)
            } else {
                Some(left.to_string().cmp(&right.to_string()))
            }
        }
        _ => None,
    }
}
