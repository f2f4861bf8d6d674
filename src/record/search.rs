use crate::error::StoreError;
use crate::types::RowValues;

use super::condition::validate_identifier;

/// Right-hand side of one search condition.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchValue {
    Eq(RowValues),
    /// Matches nothing when empty.
    In(Vec<RowValues>),
}

impl SearchValue {
    pub fn equals(value: impl Into<RowValues>) -> Self {
        SearchValue::Eq(value.into())
    }

    pub fn any_of<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<RowValues>,
    {
        SearchValue::In(values.into_iter().map(Into::into).collect())
    }
}

/// Three-way search result for callers that still branch on match count.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchMatch<T> {
    None,
    One(T),
    Many(Vec<T>),
}

impl<T> SearchMatch<T> {
    pub(crate) fn from_vec(mut rows: Vec<T>) -> Self {
        match rows.len() {
            0 => SearchMatch::None,
            1 => rows.pop().map_or(SearchMatch::None, SearchMatch::One),
            _ => SearchMatch::Many(rows),
        }
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<T> {
        match self {
            SearchMatch::None => Vec::new(),
            SearchMatch::One(row) => vec![row],
            SearchMatch::Many(rows) => rows,
        }
    }
}

/// `SELECT * FROM t WHERE a = ?1 AND b IN (?2, ?3)`; no conditions selects every row.
pub(crate) fn build_search(
    table: &str,
    conditions: &[(&str, SearchValue)],
) -> Result<(String, Vec<RowValues>), StoreError> {
    let mut sql = format!("SELECT * FROM {table}");
    let mut params = Vec::new();
    let mut clauses = Vec::with_capacity(conditions.len());
    for (column, value) in conditions {
        validate_identifier(column)?;
        match value {
            SearchValue::Eq(v) => {
                params.push(v.clone());
                clauses.push(format!("{column} = ?{}", params.len()));
            }
            SearchValue::In(values) if values.is_empty() => clauses.push("0 = 1".to_owned()),
            SearchValue::In(values) => {
                let mut marks = Vec::with_capacity(values.len());
                for v in values {
                    params.push(v.clone());
                    marks.push(format!("?{}", params.len()));
                }
                clauses.push(format!("{column} IN ({})", marks.join(", ")));
            }
        }
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    Ok((sql, params))
}
