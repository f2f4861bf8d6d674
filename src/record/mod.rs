//! Generic CRUD over one table, addressing rows by integer id or public UUID.
//!
//! ```rust,no_run
//! use storefront_db::prelude::*;
//!
//! # async fn demo(db: Database) -> Result<(), StoreError> {
//! let customers: RecordAccessor<DbRow> = RecordAccessor::new(db, TableSpec::new("customer")?);
//! let saved = customers
//!     .save(&[("name", "Ada".into()), ("email", "ada@example.com".into())])
//!     .await?;
//! let uuid = saved.get("uuid").and_then(RowValues::as_text).unwrap_or_default().to_owned();
//! let again = customers.get(&uuid).await?;
//! # let _ = again;
//! # Ok(()) }
//! ```

mod condition;
mod search;
mod table;

pub use condition::{Condition, ConditionColumn, is_uuid_v4, resolve_condition, validate_identifier};
pub use search::{SearchMatch, SearchValue};
pub use table::TableSpec;

use std::fmt;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::db::Database;
use crate::error::StoreError;
use crate::executor::QueryExecutor;
use crate::results::DbRow;
use crate::types::RowValues;

/// Conversion from a result row into a domain record.
pub trait FromRow: Sized {
    /// # Errors
    /// Returns `StoreError` when a required column is missing or has the wrong type.
    fn from_row(row: &DbRow) -> Result<Self, StoreError>;
}

impl FromRow for DbRow {
    fn from_row(row: &DbRow) -> Result<Self, StoreError> {
        Ok(row.clone())
    }
}

type Mapper<T> = Arc<dyn Fn(&DbRow) -> Result<T, StoreError> + Send + Sync>;

/// CRUD accessor bound to one table.
///
/// Reads go through the [`Database`] (timeout guard and retry policy apply) unless a
/// caller passes its own executor to the `*_in` variants. Writes each run in their own
/// scoped transaction.
pub struct RecordAccessor<T> {
    db: Database,
    spec: TableSpec,
    mapper: Mapper<T>,
}

impl<T> Clone for RecordAccessor<T> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            spec: self.spec.clone(),
            mapper: Arc::clone(&self.mapper),
        }
    }
}

impl<T> fmt::Debug for RecordAccessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordAccessor")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

impl<T: FromRow + 'static> RecordAccessor<T> {
    #[must_use]
    pub fn new(db: Database, spec: TableSpec) -> Self {
        Self::with_mapper(db, spec, T::from_row)
    }
}

impl<T: 'static> RecordAccessor<T> {
    pub fn with_mapper<F>(db: Database, spec: TableSpec, mapper: F) -> Self
    where
        F: Fn(&DbRow) -> Result<T, StoreError> + Send + Sync + 'static,
    {
        Self {
            db,
            spec,
            mapper: Arc::new(mapper),
        }
    }

    #[must_use]
    pub fn spec(&self) -> &TableSpec {
        &self.spec
    }

    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// # Errors
    /// Returns `StoreError::RecordNotFound` when no row matches, or
    /// `StoreError::ConstraintViolation` for an empty identifier.
    pub async fn get(&self, record: &str) -> Result<T, StoreError> {
        self.get_in(&self.db, record).await
    }

    /// [`get`](Self::get) on a caller-supplied executor, e.g. inside a transaction.
    ///
    /// # Errors
    /// See [`get`](Self::get).
    pub async fn get_in<E>(&self, exec: &E, record: &str) -> Result<T, StoreError>
    where
        E: QueryExecutor + ?Sized,
    {
        let cond = resolve_condition(record)?;
        let sql = self.spec.select_by(&cond);
        match exec.get(&sql, std::slice::from_ref(&cond.value)).await? {
            Some(row) => (self.mapper)(&row),
            None => Err(self.not_found(record)),
        }
    }

    /// Every row in the table; an empty table yields an empty `Vec`.
    ///
    /// # Errors
    /// Returns `StoreError` if the query fails.
    pub async fn all(&self) -> Result<Vec<T>, StoreError> {
        self.all_in(&self.db).await
    }

    /// # Errors
    /// Returns `StoreError` if the query fails.
    pub async fn all_in<E>(&self, exec: &E) -> Result<Vec<T>, StoreError>
    where
        E: QueryExecutor + ?Sized,
    {
        let rows = exec.all(&self.spec.select_all(), &[]).await?;
        self.map_rows(&rows)
    }

    /// Insert a row with a freshly generated UUID and return it as stored.
    ///
    /// # Errors
    /// Returns `StoreError::TransactionFailed` wrapping the cause when the insert fails
    /// or yields no row, or `StoreError::ConstraintViolation` for invalid column names.
    pub async fn save(&self, fields: &[(&str, RowValues)]) -> Result<T, StoreError> {
        let columns: Vec<&str> = fields.iter().map(|(col, _)| *col).collect();
        let sql = self.spec.insert_returning(&columns)?;
        let uuid = Uuid::new_v4().to_string();
        let mut params = Vec::with_capacity(fields.len() + 1);
        params.push(RowValues::Text(uuid.clone()));
        params.extend(fields.iter().map(|(_, value)| value.clone()));
        let table = self.spec.table().to_owned();

        let row = self
            .db
            .transaction(|tx| async move {
                tx.get(&sql, &params).await?.ok_or_else(|| {
                    StoreError::ExecutionError(format!("insert into {table} returned no row"))
                })
            })
            .await?;
        debug!(table = %self.spec.table(), %uuid, "record saved");
        (self.mapper)(&row)
    }

    /// Set `fields` on the addressed row and return the updated row.
    ///
    /// # Errors
    /// Returns `StoreError::RecordNotFound` when nothing matched,
    /// `StoreError::ConstraintViolation` for empty fields or identifier, or
    /// `StoreError::TransactionFailed` if the statement fails.
    pub async fn update(&self, record: &str, fields: &[(&str, RowValues)]) -> Result<T, StoreError> {
        let cond = resolve_condition(record)?;
        let columns: Vec<&str> = fields.iter().map(|(col, _)| *col).collect();
        let sql = self.spec.update_returning(&columns, &cond)?;
        let mut params: Vec<RowValues> = fields.iter().map(|(_, value)| value.clone()).collect();
        params.push(cond.value);

        let row = self
            .db
            .transaction(|tx| async move { tx.get(&sql, &params).await })
            .await?;
        match row {
            Some(row) => (self.mapper)(&row),
            None => Err(self.not_found(record)),
        }
    }

    /// Delete every addressed row in one statement. Returns whether anything was
    /// removed; an empty batch removes nothing.
    ///
    /// # Errors
    /// Returns `StoreError::ConstraintViolation` for an empty identifier, or
    /// `StoreError::TransactionFailed` if the delete fails.
    pub async fn delete_many(&self, records: &[&str]) -> Result<bool, StoreError> {
        if records.is_empty() {
            return Ok(false);
        }
        let conds = records
            .iter()
            .map(|record| resolve_condition(record))
            .collect::<Result<Vec<_>, _>>()?;
        let (sql, params) = self.spec.delete_in(&conds);
        let res = self
            .db
            .transaction(|tx| async move { tx.run(&sql, &params).await })
            .await?;
        debug!(table = %self.spec.table(), changes = res.changes, "records deleted");
        Ok(res.changes > 0)
    }

    /// # Errors
    /// See [`delete_many`](Self::delete_many).
    pub async fn delete_one(&self, record: &str) -> Result<bool, StoreError> {
        self.delete_many(&[record]).await
    }

    /// Rows matching every condition, always as a `Vec`.
    ///
    /// # Errors
    /// Returns `StoreError::ConstraintViolation` for invalid column names, or the query
    /// failure.
    pub async fn search(&self, conditions: &[(&str, SearchValue)]) -> Result<Vec<T>, StoreError> {
        self.search_in(&self.db, conditions).await
    }

    /// # Errors
    /// See [`search`](Self::search).
    pub async fn search_in<E>(
        &self,
        exec: &E,
        conditions: &[(&str, SearchValue)],
    ) -> Result<Vec<T>, StoreError>
    where
        E: QueryExecutor + ?Sized,
    {
        let (sql, params) = search::build_search(self.spec.table(), conditions)?;
        let rows = exec.all(&sql, &params).await?;
        self.map_rows(&rows)
    }

    /// [`search`](Self::search) reshaped by match count: none, one, or many.
    ///
    /// # Errors
    /// See [`search`](Self::search).
    pub async fn search_compat(
        &self,
        conditions: &[(&str, SearchValue)],
    ) -> Result<SearchMatch<T>, StoreError> {
        Ok(SearchMatch::from_vec(self.search(conditions).await?))
    }

    /// # Errors
    /// Returns `StoreError` if the query fails.
    pub async fn count(&self) -> Result<i64, StoreError> {
        let row = self.db.get(&self.spec.count_all(), &[]).await?;
        Ok(row
            .as_ref()
            .and_then(|r| r.get("n"))
            .and_then(RowValues::as_int)
            .copied()
            .unwrap_or(0))
    }

    /// # Errors
    /// Returns `StoreError::ConstraintViolation` for an empty identifier, or the query
    /// failure.
    pub async fn exists(&self, record: &str) -> Result<bool, StoreError> {
        let cond = resolve_condition(record)?;
        let sql = self.spec.select_by(&cond);
        Ok(self
            .db
            .get(&sql, std::slice::from_ref(&cond.value))
            .await?
            .is_some())
    }

    fn map_rows(&self, rows: &[DbRow]) -> Result<Vec<T>, StoreError> {
        rows.iter().map(|row| (self.mapper)(row)).collect()
    }

    fn not_found(&self, record: &str) -> StoreError {
        StoreError::RecordNotFound(format!("{} {record}", self.spec.table()))
    }
}
