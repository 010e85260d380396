//! Load-file encoding: one staging file in, one buffer per destination table
//! out.
//!
//! Column-oriented destinations get CSV rows in lexicographic column order;
//! document-oriented destinations get one JSON object per line. Either way a
//! `uuid_ts` column records when the record passed through.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::error::{EgressError, EgressResult, ErrorKind};
use crate::types::{DestinationType, WarehouseSchema, sorted_table_columns};

/// Column receiving the load-file build timestamp.
pub const UUID_TS_COLUMN: &str = "uuid_ts";

/// Splits a staging file's newline-delimited records into per-table load
/// file buffers.
///
/// A record that cannot be parsed, or whose table is absent from the upload
/// schema, is a broken invariant and fails the build.
pub fn build_load_files(
    data: &[u8],
    schema: &WarehouseSchema,
    destination_type: DestinationType,
    uuid_ts: DateTime<Utc>,
) -> EgressResult<BTreeMap<String, Vec<u8>>> {
    let sorted_columns = sorted_table_columns(schema);
    let mut tables: BTreeMap<String, Vec<u8>> = BTreeMap::new();

    for line in data.split(|byte| *byte == b'\n') {
        if line.is_empty() {
            continue;
        }

        let record: serde_json::Value = serde_json::from_slice(line).map_err(|err| {
            crate::egress_error!(
                ErrorKind::InvalidData,
                "Malformed staging record",
                err.to_string()
            )
        })?;

        let metadata = record.get("metadata").ok_or_else(|| {
            crate::egress_error!(ErrorKind::InvalidData, "Staging record has no metadata")
        })?;
        let table = metadata
            .get("table")
            .and_then(|table| table.as_str())
            .ok_or_else(|| {
                crate::egress_error!(ErrorKind::InvalidData, "Staging record has no table")
            })?;
        let column_types = metadata
            .get("columns")
            .and_then(|columns| columns.as_object())
            .ok_or_else(|| {
                crate::egress_error!(ErrorKind::InvalidData, "Staging record has no columns")
            })?;
        let row = record
            .get("data")
            .and_then(|data| data.as_object())
            .ok_or_else(|| {
                crate::egress_error!(ErrorKind::InvalidData, "Staging record has no data")
            })?;

        let buffer = tables.entry(table.to_owned()).or_default();

        if destination_type == DestinationType::BigQuery {
            let mut object = row.clone();
            object.insert(
                UUID_TS_COLUMN.to_owned(),
                serde_json::Value::String(uuid_ts.format("%Y-%m-%d %H:%M:%S Z").to_string()),
            );
            serde_json::to_writer(&mut *buffer, &object)?;
            buffer.push(b'\n');
        } else {
            let columns = sorted_columns.get(table).ok_or_else(|| {
                crate::egress_error!(
                    ErrorKind::InvalidData,
                    "Staging record targets a table missing from the upload schema",
                    table
                )
            })?;

            let mut csv_row = Vec::with_capacity(columns.len());
            for column in columns {
                let column_type = column_types.get(column).and_then(|ty| ty.as_str());
                csv_row.push(csv_value(column, row.get(column), column_type, uuid_ts));
            }
            buffer.extend_from_slice(csv_row.join(",").as_bytes());
            buffer.push(b'\n');
        }
    }

    Ok(tables)
}

/// Renders one CSV cell.
///
/// `uuid_ts` gets the build timestamp; missing values render empty (paired
/// with `EMPTYASNULL` on load); numeric-typed columns go through their
/// floating-point representation.
fn csv_value(
    column: &str,
    value: Option<&serde_json::Value>,
    column_type: Option<&str>,
    uuid_ts: DateTime<Utc>,
) -> String {
    if column == UUID_TS_COLUMN {
        return uuid_ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
    }

    let Some(value) = value else {
        return String::new();
    };

    if matches!(column_type, Some("int") | Some("bigint") | Some("float"))
        && let Some(number) = value.as_f64()
    {
        return number.to_string();
    }

    match value {
        serde_json::Value::String(string) => csv_escape(string),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Escapes a string for CSV: values containing `,` get internal `"` doubled
/// and the whole value wrapped in quotes.
fn csv_escape(value: &str) -> String {
    if value.contains(',') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn schema(table: &str, columns: &[(&str, &str)]) -> WarehouseSchema {
        [(
            table.to_string(),
            columns
                .iter()
                .map(|(name, ty)| (name.to_string(), ty.to_string()))
                .collect(),
        )]
        .into()
    }

    fn record(table: &str, columns: serde_json::Value, data: serde_json::Value) -> Vec<u8> {
        let mut line = serde_json::to_vec(&serde_json::json!({
            "metadata": {"table": table, "columns": columns},
            "data": data
        }))
        .unwrap();
        line.push(b'\n');
        line
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 2, 10, 30, 0).unwrap()
    }

    #[test]
    fn csv_row_escapes_commas_and_orders_columns() {
        let data = record(
            "tracks",
            serde_json::json!({"a": "string", "b": "int"}),
            serde_json::json!({"a": "x,y", "b": 1}),
        );
        let schema = schema("tracks", &[("a", "string"), ("b", "int")]);

        let files = build_load_files(&data, &schema, DestinationType::Redshift, ts()).unwrap();
        assert_eq!(files["tracks"], b"\"x,y\",1\n");
    }

    #[test]
    fn csv_doubles_inner_quotes() {
        let data = record(
            "tracks",
            serde_json::json!({"a": "string"}),
            serde_json::json!({"a": "say \"hi\", bye"}),
        );
        let schema = schema("tracks", &[("a", "string")]);

        let files = build_load_files(&data, &schema, DestinationType::Redshift, ts()).unwrap();
        assert_eq!(
            String::from_utf8(files["tracks"].clone()).unwrap(),
            "\"say \"\"hi\"\", bye\"\n"
        );
    }

    #[test]
    fn csv_columns_follow_lexicographic_order() {
        let data = record(
            "tracks",
            serde_json::json!({"c": "int", "a": "int", "b": "int"}),
            serde_json::json!({"c": 3, "a": 1, "b": 2}),
        );
        let schema = schema("tracks", &[("c", "int"), ("a", "int"), ("b", "int")]);

        let files = build_load_files(&data, &schema, DestinationType::Redshift, ts()).unwrap();
        assert_eq!(files["tracks"], b"1,2,3\n");
    }

    #[test]
    fn csv_missing_column_renders_empty() {
        let data = record(
            "tracks",
            serde_json::json!({"a": "string"}),
            serde_json::json!({"a": "x"}),
        );
        let schema = schema("tracks", &[("a", "string"), ("b", "string")]);

        let files = build_load_files(&data, &schema, DestinationType::Redshift, ts()).unwrap();
        assert_eq!(files["tracks"], b"x,\n");
    }

    #[test]
    fn csv_numeric_columns_use_float_representation() {
        let data = record(
            "tracks",
            serde_json::json!({"big": "bigint", "frac": "float"}),
            serde_json::json!({"big": 5000000, "frac": 1.5}),
        );
        let schema = schema("tracks", &[("big", "bigint"), ("frac", "float")]);

        let files = build_load_files(&data, &schema, DestinationType::Redshift, ts()).unwrap();
        assert_eq!(files["tracks"], b"5000000,1.5\n");
    }

    #[test]
    fn csv_uuid_ts_is_rfc3339_millis() {
        let data = record(
            "tracks",
            serde_json::json!({"uuid_ts": "datetime"}),
            serde_json::json!({}),
        );
        let schema = schema("tracks", &[("uuid_ts", "datetime")]);

        let files = build_load_files(&data, &schema, DestinationType::Redshift, ts()).unwrap();
        assert_eq!(files["tracks"], b"2026-08-02T10:30:00.000Z\n");
    }

    #[test]
    fn bigquery_rows_are_json_lines_with_uuid_ts() {
        let data = record(
            "tracks",
            serde_json::json!({"a": "string"}),
            serde_json::json!({"a": "x"}),
        );
        let schema = schema("tracks", &[("a", "string")]);

        let files = build_load_files(&data, &schema, DestinationType::BigQuery, ts()).unwrap();
        let line: serde_json::Value =
            serde_json::from_slice(files["tracks"].strip_suffix(b"\n").unwrap()).unwrap();
        assert_eq!(line["a"], "x");
        assert_eq!(line["uuid_ts"], "2026-08-02 10:30:00 Z");
    }

    #[test]
    fn records_fan_out_per_table() {
        let mut data = record(
            "tracks",
            serde_json::json!({"a": "int"}),
            serde_json::json!({"a": 1}),
        );
        data.extend(record(
            "users",
            serde_json::json!({"id": "string"}),
            serde_json::json!({"id": "u1"}),
        ));
        let mut upload_schema = schema("tracks", &[("a", "int")]);
        upload_schema.extend(schema("users", &[("id", "string")]));

        let files =
            build_load_files(&data, &upload_schema, DestinationType::Redshift, ts()).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files["tracks"], b"1\n");
        assert_eq!(files["users"], b"u1\n");
    }

    #[test]
    fn malformed_record_is_fatal() {
        let schema = schema("tracks", &[("a", "int")]);
        let err =
            build_load_files(b"not json\n", &schema, DestinationType::Redshift, ts()).unwrap_err();
        assert!(err.kind().is_fatal());

        let no_table = serde_json::to_vec(&serde_json::json!({"data": {}})).unwrap();
        let err =
            build_load_files(&no_table, &schema, DestinationType::Redshift, ts()).unwrap_err();
        assert!(err.kind().is_fatal());
    }
}
