//! Prepared statements and row access.

use std::io::Cursor;

use chrono::{DateTime, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{CachedStatement, Row, RowIndex};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// A statement prepared through a connection's statement cache, with its
/// parameters already bound.
///
/// [`Statement::query`] opens the row cursor. The cursor yields rows until
/// the statement is exhausted, and dropping it resets the statement so the
/// next `query` starts again from the first row.
///
/// Dropping the statement resets it and hands it back to the cache.
/// [`Statement::finalize`] removes it from the cache instead.
pub struct Statement<'conn> {
    inner: CachedStatement<'conn>,
    sql: String,
}

impl<'conn> Statement<'conn> {
    pub(crate) fn new(inner: CachedStatement<'conn>, sql: String) -> Self {
        Self { inner, sql }
    }

    /// The trimmed SQL text this statement was prepared from.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Number of columns in the result set.
    pub fn column_count(&self) -> usize {
        self.inner.column_count()
    }

    /// Opens a cursor positioned before the first result row.
    pub fn query(&mut self) -> Rows<'_> {
        Rows {
            inner: self.inner.raw_query(),
            sql: &self.sql,
        }
    }

    /// Runs a single step and resets, discarding any row produced.
    pub(crate) fn step_once(&mut self) -> Result<()> {
        self.query().next()?;
        Ok(())
    }

    /// Maps every result row through `f`.
    pub fn collect_rows<T, F>(&mut self, mut f: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> Result<T>,
    {
        let mut rows = self.query();
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(f(row)?);
        }
        Ok(out)
    }

    /// Maps the first result row through `f`, or returns `None` when the
    /// statement produced no rows.
    pub fn first_row<T, F>(&mut self, f: F) -> Result<Option<T>>
    where
        F: FnOnce(&Row<'_>) -> Result<T>,
    {
        let mut rows = self.query();
        match rows.next()? {
            Some(row) => f(row).map(Some),
            None => Ok(None),
        }
    }

    /// Finalizes the statement and evicts it from the cache.
    pub fn finalize(self) {
        self.inner.discard();
    }
}

impl std::fmt::Debug for Statement<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement").field("sql", &self.sql).finish()
    }
}

/// Cursor over a statement's result rows.
///
/// Dropping the cursor resets the statement.
pub struct Rows<'stmt> {
    inner: rusqlite::Rows<'stmt>,
    sql: &'stmt str,
}

impl<'stmt> Rows<'stmt> {
    /// Advances to the next row. `None` once the statement is exhausted.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<&Row<'stmt>>> {
        let sql = self.sql;
        self.inner.next().map_err(|source| Error::ExecFailed {
            sql: sql.to_owned(),
            source,
        })
    }
}

/// Lenient typed accessors for result rows.
///
/// These follow SQLite's own coercions instead of rusqlite's strict
/// `FromSql` checks: NULL reads as zero or empty, and integers and reals
/// convert into each other.
pub trait RowExt {
    /// Column as text. NULL reads as the empty string.
    fn get_text<I: RowIndex>(&self, idx: I) -> Result<String>;

    /// Column as a 64-bit integer. NULL reads as 0.
    fn get_int64<I: RowIndex>(&self, idx: I) -> Result<i64>;

    /// Column as a float. NULL reads as 0.0.
    fn get_float<I: RowIndex>(&self, idx: I) -> Result<f64>;

    /// Reader over the raw bytes of a TEXT or BLOB column.
    fn get_reader<I: RowIndex>(&self, idx: I) -> Result<Cursor<Vec<u8>>>;

    /// Column of Unix seconds as a UTC time.
    fn load_time<I: RowIndex>(&self, idx: I) -> Result<DateTime<Utc>>;

    /// Column as a boolean; only the integer 1 is `true`.
    fn load_bool<I: RowIndex>(&self, idx: I) -> Result<bool>;

    /// Column of JSON text decoded into `T`. NULL and empty text read as
    /// `None`.
    fn load_json<T: DeserializeOwned, I: RowIndex>(&self, idx: I) -> Result<Option<T>>;
}

impl RowExt for Row<'_> {
    fn get_text<I: RowIndex>(&self, idx: I) -> Result<String> {
        Ok(match self.get_ref(idx)? {
            ValueRef::Null => String::new(),
            ValueRef::Integer(v) => v.to_string(),
            ValueRef::Real(v) => v.to_string(),
            ValueRef::Text(bytes) | ValueRef::Blob(bytes) => String::from_utf8(bytes.to_vec())
                .map_err(|err| Error::Decode(format!("column is not valid utf-8: {err}")))?,
        })
    }

    fn get_int64<I: RowIndex>(&self, idx: I) -> Result<i64> {
        match self.get_ref(idx)? {
            ValueRef::Null => Ok(0),
            ValueRef::Integer(v) => Ok(v),
            ValueRef::Real(v) => Ok(v as i64),
            ValueRef::Text(bytes) => parse_text(bytes),
            ValueRef::Blob(_) => Err(Error::Decode("blob column read as integer".into())),
        }
    }

    fn get_float<I: RowIndex>(&self, idx: I) -> Result<f64> {
        match self.get_ref(idx)? {
            ValueRef::Null => Ok(0.0),
            ValueRef::Integer(v) => Ok(v as f64),
            ValueRef::Real(v) => Ok(v),
            ValueRef::Text(bytes) => parse_text(bytes),
            ValueRef::Blob(_) => Err(Error::Decode("blob column read as float".into())),
        }
    }

    fn get_reader<I: RowIndex>(&self, idx: I) -> Result<Cursor<Vec<u8>>> {
        let bytes = match self.get_ref(idx)? {
            ValueRef::Null => Vec::new(),
            ValueRef::Text(bytes) | ValueRef::Blob(bytes) => bytes.to_vec(),
            ValueRef::Integer(v) => v.to_string().into_bytes(),
            ValueRef::Real(v) => v.to_string().into_bytes(),
        };
        Ok(Cursor::new(bytes))
    }

    fn load_time<I: RowIndex>(&self, idx: I) -> Result<DateTime<Utc>> {
        let secs = self.get_int64(idx)?;
        DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| Error::Decode(format!("timestamp {secs} is out of range")))
    }

    fn load_bool<I: RowIndex>(&self, idx: I) -> Result<bool> {
        Ok(self.get_int64(idx)? == 1)
    }

    fn load_json<T: DeserializeOwned, I: RowIndex>(&self, idx: I) -> Result<Option<T>> {
        let bytes = match self.get_ref(idx)? {
            ValueRef::Null => return Ok(None),
            ValueRef::Text(bytes) | ValueRef::Blob(bytes) => bytes,
            other => {
                return Err(Error::Decode(format!(
                    "expected json text, found {}",
                    other.data_type()
                )))
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(bytes)
            .map(Some)
            .map_err(|err| Error::Decode(format!("invalid json: {err}")))
    }
}

fn parse_text<T: std::str::FromStr>(bytes: &[u8]) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    let text = std::str::from_utf8(bytes)
        .map_err(|err| Error::Decode(format!("column is not valid utf-8: {err}")))?;
    text.trim()
        .parse()
        .map_err(|err| Error::Decode(format!("cannot parse {text:?}: {err}")))
}
