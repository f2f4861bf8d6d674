use std::sync::LazyLock;

use regex::Regex;

use crate::error::StoreError;
use crate::types::RowValues;

// 8-4-4-4-12 hex, version nibble 4, variant nibble 8/9/a/b
static UUID_V4: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$")
});

static IDENTIFIER: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$"));

fn pattern(
    re: &'static LazyLock<Result<Regex, regex::Error>>,
) -> Result<&'static Regex, StoreError> {
    LazyLock::force(re)
        .as_ref()
        .map_err(|e| StoreError::ConfigError(format!("invalid built-in pattern: {e}")))
}

/// Which column an identifier addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionColumn {
    Uuid,
    Id,
}

/// A resolved row identifier: the column to match and the bound value.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: ConditionColumn,
    pub value: RowValues,
}

#[must_use]
pub fn is_uuid_v4(candidate: &str) -> bool {
    pattern(&UUID_V4).is_ok_and(|re| re.is_match(candidate))
}

/// Route an identifier to the uuid column when it has the UUID v4 shape, otherwise to
/// the numeric id column.
///
/// Numeric-looking identifiers bind as integers; anything else binds as text and
/// simply matches nothing on an integer key.
///
/// # Errors
/// Returns `StoreError::ConstraintViolation` for an empty identifier.
pub fn resolve_condition(record: &str) -> Result<Condition, StoreError> {
    let record = record.trim();
    if record.is_empty() {
        return Err(StoreError::ConstraintViolation(
            "record identifier must not be empty".into(),
        ));
    }
    if is_uuid_v4(record) {
        return Ok(Condition {
            column: ConditionColumn::Uuid,
            value: RowValues::Text(record.to_owned()),
        });
    }
    let value = match record.parse::<i64>() {
        Ok(id) => RowValues::Int(id),
        Err(_) => RowValues::Text(record.to_owned()),
    };
    Ok(Condition {
        column: ConditionColumn::Id,
        value,
    })
}

/// # Errors
/// Returns `StoreError::ConstraintViolation` unless `name` is a plain SQL identifier.
pub fn validate_identifier(name: &str) -> Result<(), StoreError> {
    if pattern(&IDENTIFIER)?.is_match(name) {
        Ok(())
    } else {
        Err(StoreError::ConstraintViolation(format!(
            "invalid SQL identifier: {name:?}"
        )))
    }
}
