//! Record interchange shape shared with the validation and API layers.
//!
//! # Responsibility
//! - Define the field-name to value map every core call consumes/returns.
//! - Provide dotted-path helpers (`"dict_field.first_key"`).
//!
//! # Invariants
//! - Keys are kept in sorted order so stored dict/list JSON is canonical.
//! - Versioned rows always carry both interval fields.

pub use serde_json::Value;

/// Ordered map of field name to value.
pub type Record = serde_json::Map<String, Value>;

/// Inclusive lower bound of a versioned row's interval.
pub const VALID_SINCE: &str = "valid_since_revision";
/// Exclusive upper bound of a versioned row's interval.
pub const VALID_UNTIL: &str = "valid_until_revision";
/// `valid_until_revision` sentinel for the currently valid row.
pub const UNBOUNDED: i64 = -1;

/// Expands dotted keys into nested dicts.
///
/// `{"a.b": 1, "c": 2}` becomes `{"a": {"b": 1}, "c": 2}`. A dotted key
/// merges into an existing dict under the same prefix; any non-dict value
/// already there is replaced.
pub fn expand_dotted(input: &Record) -> Record {
    let mut expanded = Record::new();
    // Plain keys first so dotted keys merge into them regardless of order.
    for (key, value) in input.iter().filter(|(key, _)| !key.contains('.')) {
        expanded.insert(key.clone(), value.clone());
    }
    for (key, value) in input.iter().filter(|(key, _)| key.contains('.')) {
        insert_path(&mut expanded, key, value.clone());
    }
    expanded
}

fn insert_path(target: &mut Record, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            target.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let slot = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Record::new()));
            if !slot.is_object() {
                *slot = Value::Object(Record::new());
            }
            if let Value::Object(nested) = slot {
                insert_path(nested, rest, value);
            }
        }
    }
}

/// Resolves a dotted path inside a record.
pub fn lookup<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    match path.split_once('.') {
        None => record.get(path),
        Some((head, rest)) => match record.get(head)? {
            Value::Object(nested) => lookup(nested, rest),
            _ => None,
        },
    }
}

/// Reads an integer interval field (`valid_since_revision`, ...).
pub fn revision_field(record: &Record, field: &str) -> Option<i64> {
    record.get(field).and_then(Value::as_i64)
}

/// Returns whether a versioned row is the currently valid one.
pub fn is_current(record: &Record) -> bool {
    revision_field(record, VALID_UNTIL) == Some(UNBOUNDED)
}

/// Returns whether the row's `[since, until)` interval covers `revision`.
pub fn is_valid_at(record: &Record, revision: i64) -> bool {
    let since = revision_field(record, VALID_SINCE);
    let until = revision_field(record, VALID_UNTIL);
    match (since, until) {
        (Some(since), Some(until)) => {
            since <= revision && (until == UNBOUNDED || until > revision)
        }
        _ => false,
    }
}

/// Copies a record and stamps it with `[since, until)`.
pub fn with_interval(record: &Record, since: i64, until: i64) -> Record {
    let mut stamped = without_interval(record);
    stamped.insert(VALID_SINCE.to_string(), Value::from(since));
    stamped.insert(VALID_UNTIL.to_string(), Value::from(until));
    stamped
}

/// Copies a record without its interval fields.
pub fn without_interval(record: &Record) -> Record {
    record
        .iter()
        .filter(|(key, _)| key.as_str() != VALID_SINCE && key.as_str() != VALID_UNTIL)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Compares two values, treating `1` and `1.0` as equal.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => a.as_f64() == b.as_f64(),
        },
        _ => left == right,
    }
}
