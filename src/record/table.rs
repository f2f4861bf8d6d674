use std::fmt::Write as _;

use crate::error::StoreError;
use crate::types::RowValues;

use super::condition::{Condition, ConditionColumn, validate_identifier};

/// Table binding for a [`RecordAccessor`](super::RecordAccessor): the table plus its
/// integer key and public UUID columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    table: String,
    id_column: String,
    uuid_column: String,
}

impl TableSpec {
    /// Table with the conventional `id` / `uuid` columns.
    ///
    /// # Errors
    /// Returns `StoreError::ConfigError` if `table` is not a plain identifier.
    pub fn new(table: impl Into<String>) -> Result<Self, StoreError> {
        Self::with_columns(table, "id", "uuid")
    }

    /// # Errors
    /// Returns `StoreError::ConfigError` if any name is not a plain identifier.
    pub fn with_columns(
        table: impl Into<String>,
        id_column: impl Into<String>,
        uuid_column: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let spec = Self {
            table: table.into(),
            id_column: id_column.into(),
            uuid_column: uuid_column.into(),
        };
        for name in [&spec.table, &spec.id_column, &spec.uuid_column] {
            validate_identifier(name).map_err(|e| StoreError::ConfigError(e.to_string()))?;
        }
        Ok(spec)
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn id_column(&self) -> &str {
        &self.id_column
    }

    #[must_use]
    pub fn uuid_column(&self) -> &str {
        &self.uuid_column
    }

    pub(crate) fn column_for(&self, cond: &Condition) -> &str {
        match cond.column {
            ConditionColumn::Uuid => &self.uuid_column,
            ConditionColumn::Id => &self.id_column,
        }
    }

    pub(crate) fn select_by(&self, cond: &Condition) -> String {
        format!(
            "SELECT * FROM {} WHERE {} = ?1",
            self.table,
            self.column_for(cond)
        )
    }

    pub(crate) fn select_all(&self) -> String {
        format!("SELECT * FROM {}", self.table)
    }

    pub(crate) fn count_all(&self) -> String {
        format!("SELECT COUNT(*) AS n FROM {}", self.table)
    }

    pub(crate) fn insert_returning(&self, columns: &[&str]) -> Result<String, StoreError> {
        let mut cols = vec![self.uuid_column.as_str()];
        for col in columns {
            validate_identifier(col)?;
            if *col == self.uuid_column {
                return Err(StoreError::ConstraintViolation(format!(
                    "{col} is generated and cannot be supplied"
                )));
            }
            cols.push(col);
        }
        let placeholders = (1..=cols.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        Ok(format!(
            "INSERT INTO {} ({}) VALUES ({placeholders}) RETURNING *",
            self.table,
            cols.join(", ")
        ))
    }

    /// `UPDATE .. SET a = ?1, b = ?2 WHERE key = ?3 RETURNING *`
    pub(crate) fn update_returning(
        &self,
        columns: &[&str],
        cond: &Condition,
    ) -> Result<String, StoreError> {
        if columns.is_empty() {
            return Err(StoreError::ConstraintViolation(
                "update needs at least one field".into(),
            ));
        }
        let mut sql = format!("UPDATE {} SET ", self.table);
        for (i, col) in columns.iter().enumerate() {
            validate_identifier(col)?;
            if i > 0 {
                sql.push_str(", ");
            }
            let _ = write!(sql, "{col} = ?{}", i + 1);
        }
        let _ = write!(
            sql,
            " WHERE {} = ?{} RETURNING *",
            self.column_for(cond),
            columns.len() + 1
        );
        Ok(sql)
    }

    /// Delete grouped by key column: `uuid IN (..) OR id IN (..)`.
    pub(crate) fn delete_in(&self, conds: &[Condition]) -> (String, Vec<RowValues>) {
        let mut groups: Vec<(&str, Vec<RowValues>)> = Vec::new();
        for cond in conds {
            let column = self.column_for(cond);
            match groups.iter_mut().find(|(c, _)| *c == column) {
                Some((_, values)) => values.push(cond.value.clone()),
                None => groups.push((column, vec![cond.value.clone()])),
            }
        }
        let mut params = Vec::with_capacity(conds.len());
        let clauses = groups
            .into_iter()
            .map(|(column, values)| {
                let start = params.len();
                let marks = (1..=values.len())
                    .map(|i| format!("?{}", start + i))
                    .collect::<Vec<_>>()
                    .join(", ");
                params.extend(values);
                format!("{column} IN ({marks})")
            })
            .collect::<Vec<_>>()
            .join(" OR ");
        (
            format!("DELETE FROM {} WHERE {clauses}", self.table),
            params,
        )
    }
}
