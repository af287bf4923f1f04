//! SQL statement builders.
//!
//! A [`SqlAdapter`] turns repository calls into parameterized statements.
//! The dialect specific parts are hooks: placeholder syntax, value
//! encoding/decoding and row ordering. Values are always bound, never
//! interpolated; column names are checked against the entity's declared
//! columns before they reach the SQL text.

use super::repository::{Entity, Fields, SqlValue, Where};
use crate::error::{IndexerError, IndexerResult};

/// A SQL string with its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// SQL text with placeholders.
    pub sql: String,
    /// Parameters in placeholder order, already encoded.
    pub params: Vec<SqlValue>,
}

impl Statement {
    fn new(sql: String) -> Self {
        Self {
            sql,
            params: Vec::new(),
        }
    }

    fn push_param(&mut self, value: SqlValue) {
        self.params.push(value);
    }
}

/// Dialect hooks plus the statement builders built on them.
pub trait SqlAdapter: Send + Sync {
    /// Placeholder for the `n`th parameter (1-based).
    fn placeholder(&self, n: usize) -> String;

    /// Converts a value into its stored form.
    fn encode(&self, value: SqlValue) -> SqlValue;

    /// Converts a stored value back. `structured` is set for columns the
    /// entity declares as JSON.
    fn decode(&self, value: SqlValue, structured: bool) -> SqlValue;

    /// `ORDER BY` expression giving storage order, if any.
    fn storage_order(&self) -> Option<&'static str>;

    /// `SELECT` of every column, filtered by `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::DatabaseError`] for an unknown column.
    fn build_select<T: Entity>(&self, filter: &Where, limit: Option<u32>) -> IndexerResult<Statement>
    where
        Self: Sized,
    {
        let mut stmt = Statement::new(format!("SELECT {} FROM {}", T::COLUMNS.join(", "), T::TABLE));
        self.push_where::<T>(&mut stmt, filter)?;
        if let Some(order) = self.storage_order() {
            stmt.sql.push_str(" ORDER BY ");
            stmt.sql.push_str(order);
        }
        if let Some(limit) = limit {
            stmt.sql.push_str(&format!(" LIMIT {limit}"));
        }
        Ok(stmt)
    }

    /// `INSERT` of `fields`.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::DatabaseError`] for an unknown column or an
    /// empty field list.
    fn build_insert<T: Entity>(&self, fields: Fields) -> IndexerResult<Statement>
    where
        Self: Sized,
    {
        if fields.is_empty() {
            return Err(IndexerError::database(
                format!("Nothing to insert into {}", T::TABLE),
                None,
            ));
        }

        let mut columns = Vec::with_capacity(fields.len());
        let mut placeholders = Vec::with_capacity(fields.len());
        let mut params = Vec::with_capacity(fields.len());
        for (column, value) in fields {
            check_column::<T>(&column)?;
            placeholders.push(self.placeholder(params.len() + 1));
            params.push(self.encode(value));
            columns.push(column);
        }

        Ok(Statement {
            sql: format!(
                "INSERT INTO {} ({}) VALUES ({})",
                T::TABLE,
                columns.join(", "),
                placeholders.join(", ")
            ),
            params,
        })
    }

    /// `UPDATE` setting `data` on rows matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::DatabaseError`] for an unknown column or an
    /// empty field list.
    fn build_update<T: Entity>(&self, data: Fields, filter: &Where) -> IndexerResult<Statement>
    where
        Self: Sized,
    {
        if data.is_empty() {
            return Err(IndexerError::database(
                format!("Nothing to update in {}", T::TABLE),
                None,
            ));
        }

        let mut stmt = Statement::new(format!("UPDATE {} SET ", T::TABLE));
        let mut assignments = Vec::with_capacity(data.len());
        for (column, value) in data {
            check_column::<T>(&column)?;
            assignments.push(format!("{column} = {}", self.placeholder(stmt.params.len() + 1)));
            stmt.push_param(self.encode(value));
        }
        stmt.sql.push_str(&assignments.join(", "));
        self.push_where::<T>(&mut stmt, filter)?;
        Ok(stmt)
    }

    /// `DELETE` of rows matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::DatabaseError`] for an unknown column.
    fn build_delete<T: Entity>(&self, filter: &Where) -> IndexerResult<Statement>
    where
        Self: Sized,
    {
        let mut stmt = Statement::new(format!("DELETE FROM {}", T::TABLE));
        self.push_where::<T>(&mut stmt, filter)?;
        Ok(stmt)
    }

    /// Appends ` WHERE (..) OR (..)` unless `filter` matches everything.
    ///
    /// Null values compare with `IS NULL`; an empty group matches every row.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::DatabaseError`] for an unknown column.
    fn push_where<T: Entity>(&self, stmt: &mut Statement, filter: &Where) -> IndexerResult<()>
    where
        Self: Sized,
    {
        if filter.matches_all() {
            return Ok(());
        }

        let mut groups = Vec::with_capacity(filter.groups().len());
        for group in filter.groups() {
            if group.is_empty() {
                groups.push("1 = 1".to_string());
                continue;
            }
            let mut terms = Vec::with_capacity(group.len());
            for (column, value) in group.iter() {
                check_column::<T>(column)?;
                if value.is_null() {
                    terms.push(format!("{column} IS NULL"));
                } else {
                    terms.push(format!("{column} = {}", self.placeholder(stmt.params.len() + 1)));
                    stmt.push_param(self.encode(value.clone()));
                }
            }
            groups.push(format!("({})", terms.join(" AND ")));
        }

        stmt.sql.push_str(" WHERE ");
        stmt.sql.push_str(&groups.join(" OR "));
        Ok(())
    }
}

fn check_column<T: Entity>(column: &str) -> IndexerResult<()> {
    if T::COLUMNS.contains(&column) {
        Ok(())
    } else {
        Err(IndexerError::database(
            format!("Unknown column {column} for table {}", T::TABLE),
            None,
        ))
    }
}

/// SQLite dialect.
///
/// Structured values are stored as UTF-8 JSON blobs and decoded back when
/// read from a JSON column; rows come back in `rowid` order.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteAdapter;

impl SqlAdapter for SqliteAdapter {
    fn placeholder(&self, n: usize) -> String {
        format!("?{n}")
    }

    fn encode(&self, value: SqlValue) -> SqlValue {
        match value {
            SqlValue::Json(json) => SqlValue::Blob(json.to_string().into_bytes()),
            other => other,
        }
    }

    fn decode(&self, value: SqlValue, structured: bool) -> SqlValue {
        match value {
            SqlValue::Blob(bytes) if structured => match serde_json::from_slice(&bytes) {
                Ok(json) => SqlValue::Json(json),
                Err(_) => SqlValue::Blob(bytes),
            },
            other => other,
        }
    }

    fn storage_order(&self) -> Option<&'static str> {
        Some("rowid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::Row;
    use serde_json::json;

    struct Sample;

    impl Entity for Sample {
        const TABLE: &'static str = "sample";
        const COLUMNS: &'static [&'static str] = &["a", "b", "data"];

        fn to_fields(&self) -> IndexerResult<Fields> {
            Ok(Fields::new())
        }

        fn from_row(_row: &Row) -> IndexerResult<Self> {
            Ok(Self)
        }
    }

    #[test]
    fn test_select_or_of_and_groups() {
        let filter = Where::any([
            Fields::new().set("a", 1).set("b", 2),
            Fields::new().set("a", 3),
        ]);
        let stmt = SqliteAdapter.build_select::<Sample>(&filter, None).unwrap();

        assert_eq!(
            stmt.sql,
            "SELECT a, b, data FROM sample WHERE (a = ?1 AND b = ?2) OR (a = ?3) ORDER BY rowid"
        );
        assert_eq!(
            stmt.params,
            vec![SqlValue::Integer(1), SqlValue::Integer(2), SqlValue::Integer(3)]
        );
    }

    #[test]
    fn test_select_all_has_no_where() {
        let stmt = SqliteAdapter.build_select::<Sample>(&Where::all(), Some(1)).unwrap();
        assert_eq!(stmt.sql, "SELECT a, b, data FROM sample ORDER BY rowid LIMIT 1");
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn test_null_uses_is_null() {
        let filter = Where::matching(Fields::new().set("a", None::<i64>).set("b", 4));
        let stmt = SqliteAdapter.build_delete::<Sample>(&filter).unwrap();
        assert_eq!(stmt.sql, "DELETE FROM sample WHERE (a IS NULL AND b = ?1)");
        assert_eq!(stmt.params, vec![SqlValue::Integer(4)]);
    }

    #[test]
    fn test_update_numbers_placeholders_across_clauses() {
        let stmt = SqliteAdapter
            .build_update::<Sample>(
                Fields::new().set("b", 9),
                &Where::matching(Fields::new().set("a", 1)),
            )
            .unwrap();
        assert_eq!(stmt.sql, "UPDATE sample SET b = ?1 WHERE (a = ?2)");
    }

    #[test]
    fn test_insert_encodes_json() {
        let stmt = SqliteAdapter
            .build_insert::<Sample>(Fields::new().set("a", 1).set("data", json!(["x", 2])))
            .unwrap();
        assert_eq!(stmt.sql, "INSERT INTO sample (a, data) VALUES (?1, ?2)");
        assert_eq!(stmt.params[1], SqlValue::Blob(br#"["x",2]"#.to_vec()));
    }

    #[test]
    fn test_unknown_column_rejected() {
        let filter = Where::matching(Fields::new().set("a; DROP TABLE sample", 1));
        assert!(SqliteAdapter.build_select::<Sample>(&filter, None).is_err());
        assert!(SqliteAdapter
            .build_insert::<Sample>(Fields::new().set("nope", 1))
            .is_err());
    }

    #[test]
    fn test_decode_blob() {
        let decoded = SqliteAdapter.decode(SqlValue::Blob(br#"{"k":1}"#.to_vec()), true);
        assert_eq!(decoded, SqlValue::Json(json!({ "k": 1 })));

        let raw = SqliteAdapter.decode(SqlValue::Blob(vec![0xff, 0x00]), true);
        assert_eq!(raw, SqlValue::Blob(vec![0xff, 0x00]));
    }

    #[test]
    fn test_raw_bytes_stay_bytes() {
        let raw = SqliteAdapter.decode(SqlValue::Blob(b"1".to_vec()), false);
        assert_eq!(raw, SqlValue::Blob(b"1".to_vec()));
    }
}
