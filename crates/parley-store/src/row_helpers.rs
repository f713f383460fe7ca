use chrono::{SecondsFormat, Utc};

use crate::error::StoreError;

/// Current time as a fixed-width RFC 3339 string (microseconds, `Z` suffix),
/// so lexicographic order matches chronological order.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Get an optional column value.
pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Parse a JSON object column, returning CorruptRow for invalid JSON or non-objects.
pub fn parse_json_object(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<serde_json::Map<String, serde_json::Value>, StoreError> {
    match serde_json::from_str(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(StoreError::CorruptRow {
            table,
            column,
            detail: format!("expected JSON object, got {other}"),
        }),
        Err(e) => Err(StoreError::CorruptRow {
            table,
            column,
            detail: format!("invalid JSON: {e}"),
        }),
    }
}

/// Parse a string into an enum, returning CorruptRow on failure.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

/// Token counts are stored as INTEGER; negative values are corrupt.
pub fn get_tokens(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<u32>, StoreError> {
    get_opt::<i64>(row, idx, table, column)?
        .map(|n| {
            u32::try_from(n).map_err(|_| StoreError::CorruptRow {
                table,
                column,
                detail: format!("token count out of range: {n}"),
            })
        })
        .transpose()
}
