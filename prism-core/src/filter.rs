//! Row filtering of work-package tables by attribute or geometry predicate.

use geo::{Geometry, Intersects};
use geozero::wkb::GpkgWkb;
use geozero::ToGeo;
use rusqlite::{params_from_iter, Connection};
use wkt::TryFromWkt;

use crate::config::{FilterMethod, FilterValue, Scalar, TableFilter};
use crate::db::{self, quote_ident};
use crate::error::{PrismError, Result};

/// Delete every row of the table that does not satisfy the package's
/// predicate. Returns the number of rows deleted. Scalar values are bound
/// as parameters; the geometry predicate is evaluated in Rust, so the WKT
/// never reaches SQL text at all.
///
/// Runs inside the caller's transaction; the caller VACUUMs afterwards.
pub fn apply_filter(conn: &Connection, table: &TableFilter, value: &FilterValue) -> Result<usize> {
    match table.method {
        FilterMethod::Column => filter_by_column(conn, table, value),
        FilterMethod::Geometry => filter_by_geometry(conn, table, value),
    }
}

fn filter_by_column(conn: &Connection, table: &TableFilter, value: &FilterValue) -> Result<usize> {
    let column = table.filter_column.as_deref().ok_or_else(|| {
        PrismError::ConfigError(format!(
            "Table '{}' uses filter-column but has no filter-column-name",
            table.name
        ))
    })?;
    let table_sql = quote_ident(&table.name);
    let column_sql = quote_ident(column);

    // Rows with no value in the deciding column belong to no package.
    let mut deleted = conn.execute(
        &format!("DELETE FROM {} WHERE {} IS NULL", table_sql, column_sql),
        [],
    )?;

    deleted += match value {
        FilterValue::Scalar(scalar) => conn.execute(
            &format!("DELETE FROM {} WHERE {} != ?1", table_sql, column_sql),
            [scalar],
        )?,
        FilterValue::List(scalars) => {
            let placeholders = (1..=scalars.len())
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", ");
            conn.execute(
                &format!(
                    "DELETE FROM {} WHERE {} NOT IN ({})",
                    table_sql, column_sql, placeholders
                ),
                params_from_iter(scalars.iter()),
            )?
        }
    };

    Ok(deleted)
}

fn filter_by_geometry(conn: &Connection, table: &TableFilter, value: &FilterValue) -> Result<usize> {
    let wkt_text = match value {
        FilterValue::Scalar(Scalar::Text(text)) => text,
        _ => {
            return Err(PrismError::ConfigError(format!(
                "Table '{}' uses filter-geometry, which requires a WKT string value",
                table.name
            )))
        }
    };
    let region: Geometry<f64> = Geometry::try_from_wkt_str(wkt_text).map_err(|e| {
        PrismError::ConfigError(format!("Invalid WKT filter value '{}': {}", wkt_text, e))
    })?;

    let geometry_column = db::geometry_column(conn, &table.name)?.ok_or_else(|| {
        PrismError::ConfigError(format!(
            "Table '{}' uses filter-geometry but has no geometry column",
            table.name
        ))
    })?;
    let pk = db::primary_key_column(conn, &table.name)?;

    let table_sql = quote_ident(&table.name);
    let pk_sql = quote_ident(&pk);

    let mut stmt = conn.prepare(&format!(
        "SELECT {}, {} FROM {}",
        pk_sql,
        quote_ident(&geometry_column),
        table_sql
    ))?;
    let rows: Vec<(i64, Option<Vec<u8>>)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut doomed = Vec::new();
    for (id, blob) in rows {
        let keep = match blob {
            Some(bytes) => match GpkgWkb(bytes).to_geo() {
                Ok(geometry) => geometry.intersects(&region),
                Err(e) => {
                    tracing::warn!(
                        table = %table.name,
                        id = id,
                        error = %e,
                        "undecodable geometry blob, dropping row"
                    );
                    false
                }
            },
            // A row without geometry cannot intersect anything.
            None => false,
        };
        if !keep {
            doomed.push(id);
        }
    }

    let mut delete = conn.prepare(&format!(
        "DELETE FROM {} WHERE {} = ?1",
        table_sql, pk_sql
    ))?;
    for id in &doomed {
        delete.execute([*id])?;
    }

    Ok(doomed.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn table(method: FilterMethod, column: Option<&str>) -> TableFilter {
        TableFilter {
            name: "farms".to_string(),
            method,
            filter_column: column.map(str::to_string),
        }
    }

    fn column_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE farms (fid INTEGER PRIMARY KEY, owner TEXT, region_id INTEGER);
             INSERT INTO farms VALUES (1, 'Emma Johnston', 1);
             INSERT INTO farms VALUES (2, 'Emma Johnston', 2);
             INSERT INTO farms VALUES (3, 'Lily Fleming', 3);
             INSERT INTO farms VALUES (4, 'Kyle Flynn', 4);
             INSERT INTO farms VALUES (5, NULL, 5);",
        )
        .unwrap();
        conn
    }

    fn remaining(conn: &Connection) -> Vec<i64> {
        let mut stmt = conn.prepare("SELECT fid FROM farms ORDER BY fid").unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<i64>>>()
            .unwrap()
    }

    /// GeoPackage geometry blob for a point: standard header (no envelope),
    /// little-endian WKB.
    fn gpkg_point(x: f64, y: f64) -> Vec<u8> {
        let mut blob = vec![0x47, 0x50, 0x00, 0x01];
        blob.extend_from_slice(&3857_i32.to_le_bytes());
        blob.push(0x01);
        blob.extend_from_slice(&1_u32.to_le_bytes());
        blob.extend_from_slice(&x.to_le_bytes());
        blob.extend_from_slice(&y.to_le_bytes());
        blob
    }

    #[test]
    fn test_scalar_keeps_matching_rows() {
        let conn = column_db();
        let deleted = apply_filter(
            &conn,
            &table(FilterMethod::Column, Some("owner")),
            &FilterValue::Scalar(Scalar::Text("Emma Johnston".to_string())),
        )
        .unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(remaining(&conn), vec![1, 2]);
    }

    #[test]
    fn test_null_rows_always_dropped() {
        let conn = column_db();
        apply_filter(
            &conn,
            &table(FilterMethod::Column, Some("owner")),
            &FilterValue::Scalar(Scalar::Text("Kyle Flynn".to_string())),
        )
        .unwrap();
        assert_eq!(remaining(&conn), vec![4]);
    }

    #[test]
    fn test_list_membership() {
        let conn = column_db();
        apply_filter(
            &conn,
            &table(FilterMethod::Column, Some("region_id")),
            &FilterValue::List(vec![Scalar::Int(1), Scalar::Int(4)]),
        )
        .unwrap();
        assert_eq!(remaining(&conn), vec![1, 4]);
    }

    #[test]
    fn test_mixed_list_matches_by_affinity() {
        // One list serving two tables: names match the text column,
        // integers match the numeric column.
        let conn = column_db();
        apply_filter(
            &conn,
            &table(FilterMethod::Column, Some("owner")),
            &FilterValue::List(vec![
                Scalar::Text("Kyle Flynn".to_string()),
                Scalar::Int(4),
            ]),
        )
        .unwrap();
        assert_eq!(remaining(&conn), vec![4]);
    }

    #[test]
    fn test_geometry_intersects() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE farms (fid INTEGER PRIMARY KEY, geometry BLOB)",
        )
        .unwrap();
        let mut insert = conn
            .prepare("INSERT INTO farms (fid, geometry) VALUES (?1, ?2)")
            .unwrap();
        insert
            .execute(rusqlite::params![1, gpkg_point(6.0, 6.0)])
            .unwrap();
        insert
            .execute(rusqlite::params![2, gpkg_point(17.0, 17.0)])
            .unwrap();
        insert
            .execute(rusqlite::params![3, Option::<Vec<u8>>::None])
            .unwrap();
        drop(insert);

        let deleted = apply_filter(
            &conn,
            &table(FilterMethod::Geometry, None),
            &FilterValue::Scalar(Scalar::Text(
                "POLYGON((0 0, 10 0, 10 10, 0 10, 0 0))".to_string(),
            )),
        )
        .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(remaining(&conn), vec![1]);
    }

    #[test]
    fn test_geometry_requires_wkt_string() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE farms (fid INTEGER PRIMARY KEY, geometry BLOB)")
            .unwrap();
        let err = apply_filter(
            &conn,
            &table(FilterMethod::Geometry, None),
            &FilterValue::Scalar(Scalar::Int(4)),
        )
        .unwrap_err();
        assert!(matches!(err, PrismError::ConfigError(_)));
    }

    #[test]
    fn test_invalid_wkt_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE farms (fid INTEGER PRIMARY KEY, geometry BLOB)")
            .unwrap();
        let err = apply_filter(
            &conn,
            &table(FilterMethod::Geometry, None),
            &FilterValue::Scalar(Scalar::Text("POLYGON((broken".to_string())),
        )
        .unwrap_err();
        assert!(err.to_string().contains("WKT"));
    }
}
