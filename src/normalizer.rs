use crate::schema::{OBSERVATION_COLUMN_MAP, STATION_COLUMN_MAP};
use crate::sentinel::SentinelCodec;
use crate::table::{Table, Value};
use crate::workbook::{RawSheet, SheetRole};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use tracing::warn;

/// Case-insensitive rename table from source headers to canonical columns.
#[derive(Debug, Clone, Default)]
pub struct ColumnMap {
    entries: HashMap<String, String>,
}

impl ColumnMap {
    pub fn new<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (header_key(k.as_ref()), v.into()))
                .collect(),
        }
    }

    pub fn observation() -> Self {
        Self::new(OBSERVATION_COLUMN_MAP.iter().copied())
    }

    pub fn station() -> Self {
        Self::new(STATION_COLUMN_MAP.iter().copied())
    }

    pub fn for_role(role: SheetRole) -> Self {
        match role {
            SheetRole::Station => Self::station(),
            SheetRole::Observation => Self::observation(),
        }
    }

    /// Layer extra aliases on top of the built-in entries.
    pub fn with_aliases(mut self, aliases: &BTreeMap<String, String>) -> Self {
        for (source, canonical) in aliases {
            self.entries.insert(header_key(source), canonical.clone());
        }
        self
    }

    pub fn lookup(&self, raw_header: &str) -> Option<&str> {
        self.entries.get(&header_key(raw_header)).map(String::as_str)
    }

    pub fn contains(&self, raw_header: &str) -> bool {
        self.lookup(raw_header).is_some()
    }

    /// The canonical spelling of a column name that matches one ignoring case.
    pub fn canonical_spelling(&self, column: &str) -> Option<&str> {
        self.entries
            .values()
            .find(|canonical| canonical.eq_ignore_ascii_case(column))
            .map(String::as_str)
    }
}

/// Trim and lower-case a header for lookup.
pub fn header_key(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Reduce a column name to `[A-Za-z0-9_]`, collapsing and trimming underscores.
pub fn sanitize_column(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        let ch = if ch.is_ascii_alphanumeric() || ch == '_' {
            ch
        } else {
            '_'
        };
        if ch == '_' && out.ends_with('_') {
            continue;
        }
        out.push(ch);
    }
    out.trim_matches('_').to_string()
}

/// Resolve the canonical column name for one source header.
pub fn canonical_name(raw_header: &str, map: &ColumnMap, position: usize) -> String {
    let renamed = match map.lookup(raw_header) {
        Some(canonical) => canonical.to_string(),
        None => header_key(raw_header),
    };
    let sanitized = sanitize_column(&renamed);
    if sanitized.is_empty() {
        format!("column_{}", position + 1)
    } else {
        sanitized
    }
}

/// Rename a raw sheet onto canonical columns.
///
/// Unmapped headers are kept (lower-cased and sanitized). Numeric cells equal
/// to the sentinel become `Missing`. When several headers map to the same
/// canonical column the first present value in each row wins. Names that
/// differ only by case share one column, spelled canonically when the map
/// knows the name. Rows with no present cell are dropped.
pub fn normalize_sheet(sheet: &RawSheet, map: &ColumnMap, codec: &SentinelCodec) -> Table {
    let mut columns: Vec<String> = Vec::new();
    let mut targets: Vec<usize> = Vec::with_capacity(sheet.headers.len());
    for (position, header) in sheet.headers.iter().enumerate() {
        let name = canonical_name(header, map, position);
        let target = match columns.iter().position(|c| c.eq_ignore_ascii_case(&name)) {
            Some(idx) => idx,
            None => {
                columns.push(name);
                columns.len() - 1
            }
        };
        targets.push(target);
    }
    for column in &mut columns {
        if let Some(canonical) = map.canonical_spelling(column) {
            if canonical != column.as_str() {
                *column = canonical.to_string();
            }
        }
    }

    let mut table = Table::new(columns);
    for raw_row in &sheet.rows {
        let mut row = vec![Value::Missing; table.columns().len()];
        for (cell, target) in raw_row.iter().zip(&targets) {
            if row[*target].is_missing() {
                row[*target] = codec.decode(cell.clone());
            }
        }
        if row.iter().any(|v| !v.is_missing()) {
            table.push_row(row);
        }
    }
    table
}

/// Headers not covered by a role's rename table, with the
/// `file::sheet` locations they appear in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub role: SheetRole,
    pub gaps: BTreeMap<String, BTreeSet<String>>,
}

impl ConsistencyReport {
    pub fn is_clean(&self) -> bool {
        self.gaps.is_empty()
    }

    /// The same gaps regrouped as `file::sheet` → unmapped headers.
    pub fn by_location(&self) -> BTreeMap<String, Vec<String>> {
        let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (header, locations) in &self.gaps {
            for location in locations {
                out.entry(location.clone()).or_default().push(header.clone());
            }
        }
        out
    }

    pub fn log(&self) {
        for (location, headers) in self.by_location() {
            warn!(
                "Unmapped {} columns in {}: {}",
                self.role,
                location,
                headers.join(", ")
            );
        }
    }
}

impl fmt::Display for ConsistencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.gaps.is_empty() {
            return writeln!(f, "All {} columns are mapped", self.role);
        }
        writeln!(f, "=== Columns NOT mapped in {} sheets ===", self.role)?;
        for (header, locations) in &self.gaps {
            writeln!(f, "{}:", header)?;
            for location in locations {
                writeln!(f, "  - {}", location)?;
            }
        }
        Ok(())
    }
}

/// Report every header, across all sheets routed to `role`, that `map` does not cover.
pub fn check_consistency<'a, I>(sheets: I, role: SheetRole, map: &ColumnMap) -> ConsistencyReport
where
    I: IntoIterator<Item = &'a RawSheet>,
{
    let mut gaps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for sheet in sheets {
        for header in &sheet.headers {
            let key = header_key(header);
            if key.is_empty() || map.contains(&key) {
                continue;
            }
            gaps.entry(key).or_default().insert(sheet.location());
        }
    }
    ConsistencyReport { role, gaps }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sheet(headers: &[&str], rows: Vec<Vec<Value>>) -> RawSheet {
        RawSheet {
            file_name: "cruise.xlsx".to_string(),
            sheet_name: "Master".to_string(),
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows,
        }
    }

    #[test]
    fn test_sanitize_column() {
        assert_eq!(sanitize_column("DO_%"), "DO");
        assert_eq!(sanitize_column("weird  (col)"), "weird_col");
        assert_eq!(sanitize_column("__a__b__"), "a_b");
        assert_eq!(sanitize_column("Temp_C"), "Temp_C");
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let map = ColumnMap::observation();
        assert_eq!(map.lookup("  Temp (C) "), Some("Temp_C"));
        assert_eq!(map.lookup("STATION ID"), Some("station_id"));
        assert_eq!(map.lookup("wind speed"), None);
    }

    #[test]
    fn test_normalize_renames_and_keeps_unmapped() {
        let raw = sheet(
            &["Station ID", "Temp (C)", "Wind Speed (m/s)"],
            vec![vec![
                Value::Text("S1".into()),
                Value::Float(18.2),
                Value::Float(4.0),
            ]],
        );
        let table = normalize_sheet(&raw, &ColumnMap::observation(), &SentinelCodec::default());
        assert_eq!(
            table.columns(),
            &["station_id", "Temp_C", "wind_speed_m_s"].map(String::from)[..]
        );
        assert_eq!(table.value_by_name(0, "Temp_C"), &Value::Float(18.2));
    }

    #[test]
    fn test_normalize_scrubs_sentinel_and_drops_blank_rows() {
        let raw = sheet(
            &["Station", "Temp (C)"],
            vec![
                vec![Value::Text("S1".into()), Value::Float(-999_999.0)],
                vec![Value::Missing, Value::Integer(-999_999)],
            ],
        );
        let table = normalize_sheet(&raw, &ColumnMap::observation(), &SentinelCodec::default());
        assert_eq!(table.len(), 1);
        assert_eq!(table.value_by_name(0, "Temp_C"), &Value::Missing);
    }

    #[test]
    fn test_aliased_headers_coalesce() {
        let raw = sheet(
            &["Station", "Station ID"],
            vec![
                vec![Value::Missing, Value::Text("S2".into())],
                vec![Value::Text("S3".into()), Value::Text("ignored".into())],
            ],
        );
        let table = normalize_sheet(&raw, &ColumnMap::observation(), &SentinelCodec::default());
        assert_eq!(table.columns(), &["station_id".to_string()][..]);
        assert_eq!(table.value(0, 0), &Value::Text("S2".into()));
        assert_eq!(table.value(1, 0), &Value::Text("S3".into()));
    }

    #[test]
    fn test_case_variant_headers_share_canonical_column() {
        let raw = sheet(
            &["Station ID", "temp_c", "Temp (C)"],
            vec![
                vec![Value::Text("S1".into()), Value::Missing, Value::Float(18.2)],
                vec![Value::Text("S2".into()), Value::Float(19.5), Value::Float(20.0)],
            ],
        );
        let table = normalize_sheet(&raw, &ColumnMap::observation(), &SentinelCodec::default());
        assert_eq!(
            table.columns(),
            &["station_id".to_string(), "Temp_C".to_string()][..]
        );
        assert_eq!(table.value(0, 1), &Value::Float(18.2));
        assert_eq!(table.value(1, 1), &Value::Float(19.5));
    }

    #[test]
    fn test_check_consistency_reports_gaps_by_location() {
        let a = sheet(&["Station ID", "Wind"], vec![]);
        let mut b = sheet(&["Wind", "Gust"], vec![]);
        b.file_name = "other.xlsx".to_string();

        let report = check_consistency([&a, &b], SheetRole::Observation, &ColumnMap::observation());
        assert_eq!(report.gaps.len(), 2);
        assert_eq!(report.gaps["wind"].len(), 2);
        let by_location = report.by_location();
        assert_eq!(by_location["other.xlsx::Master"], vec!["gust", "wind"]);
    }

    #[test]
    fn test_aliases_extend_builtin_map() {
        let mut extra = BTreeMap::new();
        extra.insert("Wind".to_string(), "wind_m_s".to_string());
        let map = ColumnMap::observation().with_aliases(&extra);
        assert_eq!(map.lookup("wind"), Some("wind_m_s"));
        assert_eq!(map.lookup("temp (c)"), Some("Temp_C"));
    }
}
