//! SQLite helpers: identifier quoting, schema introspection, database copies.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension};

use crate::error::{PrismError, Result};

/// Quote a SQL identifier to prevent SQL injection.
///
/// Doubles any embedded double-quotes and wraps in double-quotes. Values
/// never go through this function; they are bound as parameters.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Find the name of the single primary-key column of a table.
///
/// Tables with no primary key or a multi-column primary key are rejected:
/// the remap store can only renumber single-column integer keys.
pub fn primary_key_column(conn: &Connection, table: &str) -> Result<String> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) WHERE pk > 0 ORDER BY pk")?;
    let columns: Vec<String> = stmt
        .query_map([table], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    match columns.len() {
        1 => Ok(columns.into_iter().next().unwrap()),
        0 => Err(PrismError::UnsupportedSchema {
            table: table.to_string(),
            reason: "no primary-key column".to_string(),
        }),
        _ => Err(PrismError::UnsupportedSchema {
            table: table.to_string(),
            reason: "multi-column primary key".to_string(),
        }),
    }
}

/// First unused primary-key value of a table: `max + 1`, or 1 when empty.
pub fn next_id(conn: &Connection, table: &str, pk_column: &str) -> Result<i64> {
    let sql = format!(
        "SELECT max({}) FROM {}",
        quote_ident(pk_column),
        quote_ident(table)
    );
    let max: Option<i64> = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(max.map_or(1, |m| m + 1))
}

/// Whether a table of the given name exists in the main database.
pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Names of user tables in a schema, excluding SQLite internals, GeoPackage
/// metadata, and spatial-index shadow tables.
pub fn user_tables(conn: &Connection, schema: &str) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT name FROM {}.sqlite_master WHERE type = 'table' \
         AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' \
         AND name NOT LIKE 'gpkg\\_%' ESCAPE '\\' \
         AND name NOT LIKE 'rtree\\_%' ESCAPE '\\' \
         ORDER BY name",
        quote_ident(schema)
    );
    let mut stmt = conn.prepare(&sql)?;
    let names: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

/// Find the geometry column of a table.
///
/// Uses the `gpkg_geometry_columns` registry when the container carries one,
/// otherwise falls back to a column literally named `geometry`.
pub fn geometry_column(conn: &Connection, table: &str) -> Result<Option<String>> {
    if table_exists(conn, "gpkg_geometry_columns")? {
        let column: Option<String> = conn
            .query_row(
                "SELECT column_name FROM gpkg_geometry_columns WHERE table_name = ?1",
                [table],
                |row| row.get(0),
            )
            .optional()?;
        return Ok(column);
    }

    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM pragma_table_info(?1) WHERE name = 'geometry'",
            [table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found)
}

/// Attach another database file to the connection under the given alias.
pub fn attach(conn: &Connection, path: &Path, alias: &str) -> Result<()> {
    let sql = format!("ATTACH DATABASE ?1 AS {}", quote_ident(alias));
    conn.execute(&sql, [path.to_string_lossy().into_owned()])?;
    Ok(())
}

/// Flush the WAL into the main database file.
pub fn checkpoint(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")?;
    Ok(())
}

/// Copy a database file, checkpointing the WAL first so the main file is
/// self-contained. A plain `fs::copy` of a WAL-mode GeoPackage would
/// silently drop unflushed frames.
pub fn copy_database(src: &Path, dst: &Path) -> Result<()> {
    let conn = Connection::open(src)?;
    checkpoint(&conn)?;
    drop(conn);
    std::fs::copy(src, dst)?;
    Ok(())
}

/// Reclaim free pages. Must run outside any open transaction.
pub fn vacuum(conn: &Connection) -> Result<()> {
    conn.execute("VACUUM", [])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_db() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_quote_ident_plain() {
        assert_eq!(quote_ident("trees"), "\"trees\"");
    }

    #[test]
    fn test_quote_ident_embedded_quote() {
        assert_eq!(quote_ident("tricky\"name"), "\"tricky\"\"name\"");
    }

    #[test]
    fn test_primary_key_column() {
        let conn = memory_db();
        conn.execute_batch("CREATE TABLE t (fid INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();
        assert_eq!(primary_key_column(&conn, "t").unwrap(), "fid");
    }

    #[test]
    fn test_primary_key_custom_name() {
        let conn = memory_db();
        conn.execute_batch("CREATE TABLE t (objectid INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();
        assert_eq!(primary_key_column(&conn, "t").unwrap(), "objectid");
    }

    #[test]
    fn test_primary_key_missing() {
        let conn = memory_db();
        conn.execute_batch("CREATE TABLE t (name TEXT)").unwrap();
        assert!(matches!(
            primary_key_column(&conn, "t"),
            Err(PrismError::UnsupportedSchema { .. })
        ));
    }

    #[test]
    fn test_primary_key_multi_column() {
        let conn = memory_db();
        conn.execute_batch("CREATE TABLE t (a INTEGER, b INTEGER, PRIMARY KEY (a, b))")
            .unwrap();
        let err = primary_key_column(&conn, "t").unwrap_err();
        assert!(err.to_string().contains("multi-column"));
    }

    #[test]
    fn test_next_id() {
        let conn = memory_db();
        conn.execute_batch(
            "CREATE TABLE t (fid INTEGER PRIMARY KEY);
             INSERT INTO t VALUES (3), (7);",
        )
        .unwrap();
        assert_eq!(next_id(&conn, "t", "fid").unwrap(), 8);
    }

    #[test]
    fn test_next_id_empty_table() {
        let conn = memory_db();
        conn.execute_batch("CREATE TABLE t (fid INTEGER PRIMARY KEY)")
            .unwrap();
        assert_eq!(next_id(&conn, "t", "fid").unwrap(), 1);
    }

    #[test]
    fn test_user_tables_skips_metadata() {
        let conn = memory_db();
        conn.execute_batch(
            "CREATE TABLE trees (fid INTEGER PRIMARY KEY);
             CREATE TABLE gpkg_contents (table_name TEXT);
             CREATE TABLE rtree_trees_geometry (id INTEGER);",
        )
        .unwrap();
        assert_eq!(user_tables(&conn, "main").unwrap(), vec!["trees"]);
    }

    #[test]
    fn test_geometry_column_from_registry() {
        let conn = memory_db();
        conn.execute_batch(
            "CREATE TABLE gpkg_geometry_columns (table_name TEXT, column_name TEXT);
             INSERT INTO gpkg_geometry_columns VALUES ('trees', 'geom');
             CREATE TABLE trees (fid INTEGER PRIMARY KEY, geom BLOB);",
        )
        .unwrap();
        assert_eq!(
            geometry_column(&conn, "trees").unwrap().as_deref(),
            Some("geom")
        );
        assert_eq!(geometry_column(&conn, "farms").unwrap(), None);
    }

    #[test]
    fn test_geometry_column_fallback() {
        let conn = memory_db();
        conn.execute_batch(
            "CREATE TABLE trees (fid INTEGER PRIMARY KEY, geometry BLOB);
             CREATE TABLE species (fid INTEGER PRIMARY KEY, name TEXT);",
        )
        .unwrap();
        assert_eq!(
            geometry_column(&conn, "trees").unwrap().as_deref(),
            Some("geometry")
        );
        assert_eq!(geometry_column(&conn, "species").unwrap(), None);
    }

    #[test]
    fn test_table_exists() {
        let conn = memory_db();
        conn.execute_batch("CREATE TABLE t (fid INTEGER PRIMARY KEY)")
            .unwrap();
        assert!(table_exists(&conn, "t").unwrap());
        assert!(!table_exists(&conn, "missing").unwrap());
    }
}
