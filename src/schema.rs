use crate::sentinel::SentinelCodec;
use crate::table::{Table, Value};
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::HashMap;
use tracing::debug;

pub const STATIONS_TABLE: &str = "stations";
pub const OBSERVATIONS_TABLE: &str = "data";

/// Column stamped on every row with the workbook it came from.
pub const PROVENANCE_COLUMN: &str = "source_file";

/// Observation sheet headers (lower-cased) → canonical column.
pub const OBSERVATION_COLUMN_MAP: &[(&str, &str)] = &[
    // identifiers / cruise metadata
    ("unique id", "unique_id"),
    ("cruise id", "cruise_id"),
    ("year", "year"),
    // time
    ("date", "date"),
    ("time (local)", "time_local"),
    ("time (utc)", "time_utc"),
    // station / location
    ("station", "station_id"),
    ("station id", "station_id"),
    ("station type", "station_type"),
    ("latitude", "latitude"),
    ("longitude", "longitude"),
    ("latitude (intended)", "latitude_intended"),
    ("longitude (intended)", "longitude_intended"),
    ("node (schism)", "node_schism"),
    // vertical structure
    ("layer", "layer"),
    ("measurement depth (m)", "measurement_depth_m"),
    ("secchi depth (m)", "secchi_depth_m"),
    ("sonar depth (m)", "sonar_depth_m"),
    ("ave depth (model , m)", "ave_depth_model_m"),
    // instruments
    ("ctd #", "CTD_number"),
    ("ctd", "CTD_number"),
    // physical
    ("temp (c)", "Temp_C"),
    ("temperature (c)", "Temp_C"),
    ("do (mg/l)", "DO_mg_L"),
    ("dissolved oxygen (mg/l)", "DO_mg_L"),
    ("do (%)", "DO_percent"),
    ("conductivity (spc)", "Conductivity_SPC_uS_cm"),
    ("salinity (psu)", "Salinity_PSU"),
    ("ph", "pH"),
    // carbon system
    ("dic (ppm)", "DIC_ppm"),
    ("doc (ppm)", "NPOC_ppm"),
    ("npoc (ppm)", "NPOC_ppm"),
    // nutrients
    ("no3 no2 (µm)", "NO3_NO2_uM"),
    ("no3+no2 (µm)", "NO3_NO2_uM"),
    ("no3 (µm)", "NO3_uM"),
    ("no2 (µm)", "NO2_uM"),
    ("nh4 (µm)", "NH4_uM"),
    ("po4 (µm)", "PO4_uM"),
    ("d si (µm)", "DSi_uM"),
    ("dsi (µm)", "DSi_uM"),
    ("nitrogen concentration (ug/l)", "Nitrogen_ug_L"),
    ("carbon concentration (ug/l)", "Carbon_ug_L"),
    ("tn (ppm)", "TN_ppm"),
    ("pp (µm)", "PP_uM"),
    ("tdp (µm)", "TDP_uM"),
    // other
    ("chla (ug/l)", "Chla_ug_L"),
    ("chlorophyll a", "Chla_ug_L"),
    ("tss concentration (mg/l)", "TSS_mg_L"),
    // misc
    ("notes", "Notes"),
];

/// Station sheet headers (lower-cased) → canonical column.
pub const STATION_COLUMN_MAP: &[(&str, &str)] = &[
    ("station id", "station_id"),
    ("off shore sites", "station_id"),
    ("latitude", "latitude"),
    ("lat", "latitude"),
    ("longitude", "longitude"),
    ("lon", "longitude"),
    ("station type", "station_type"),
    ("node (schism)", "node_schism"),
    ("ave depth (model , m)", "ave_depth_model_m"),
    ("ave depth (model , meter)", "ave_depth_model_m"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Text,
    Integer,
    Float,
    Timestamp,
}

impl ColumnType {
    /// Declared SQLite type. Timestamps are stored as text.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Text | ColumnType::Timestamp => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Float => "REAL",
        }
    }
}

const OBSERVATION_TYPES: &[(&str, ColumnType)] = &[
    ("unique_id", ColumnType::Text),
    ("cruise_id", ColumnType::Text),
    ("year", ColumnType::Integer),
    ("date", ColumnType::Text),
    ("time_local", ColumnType::Text),
    ("time_utc", ColumnType::Text),
    ("datetime", ColumnType::Timestamp),
    ("station_id", ColumnType::Text),
    ("station_type", ColumnType::Text),
    ("latitude", ColumnType::Float),
    ("longitude", ColumnType::Float),
    ("latitude_intended", ColumnType::Float),
    ("longitude_intended", ColumnType::Float),
    ("node_schism", ColumnType::Text),
    ("layer", ColumnType::Text),
    ("measurement_depth_m", ColumnType::Float),
    ("secchi_depth_m", ColumnType::Float),
    ("sonar_depth_m", ColumnType::Float),
    ("ave_depth_model_m", ColumnType::Float),
    ("CTD_number", ColumnType::Text),
    ("Temp_C", ColumnType::Float),
    ("DO_percent", ColumnType::Float),
    ("DO_mg_L", ColumnType::Float),
    ("Salinity_PSU", ColumnType::Float),
    ("Conductivity_SPC_uS_cm", ColumnType::Float),
    ("pH", ColumnType::Float),
    ("DIC_ppm", ColumnType::Float),
    ("NPOC_ppm", ColumnType::Float),
    ("NO3_NO2_uM", ColumnType::Float),
    ("NO3_uM", ColumnType::Float),
    ("NO2_uM", ColumnType::Float),
    ("NH4_uM", ColumnType::Float),
    ("PO4_uM", ColumnType::Float),
    ("DSi_uM", ColumnType::Float),
    ("Nitrogen_ug_L", ColumnType::Float),
    ("Carbon_ug_L", ColumnType::Float),
    ("TN_ppm", ColumnType::Float),
    ("PP_uM", ColumnType::Float),
    ("TDP_uM", ColumnType::Float),
    ("Chla_ug_L", ColumnType::Float),
    ("TSS_mg_L", ColumnType::Float),
    ("Notes", ColumnType::Text),
    (PROVENANCE_COLUMN, ColumnType::Text),
];

const STATION_TYPES: &[(&str, ColumnType)] = &[
    ("station_id", ColumnType::Text),
    ("latitude", ColumnType::Float),
    ("longitude", ColumnType::Float),
    ("station_type", ColumnType::Text),
    ("node_schism", ColumnType::Text),
    ("ave_depth_model_m", ColumnType::Float),
    (PROVENANCE_COLUMN, ColumnType::Text),
];

/// Whether rows already in the store may be overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// Apply inserts and updates.
    Upsert,
    /// Insert unseen keys only; first-seen row wins.
    AppendOnly,
}

/// One target table: its name, natural key and declared column types.
#[derive(Debug, Clone)]
pub struct TableSpec {
    pub name: String,
    pub key: Vec<String>,
    pub policy: WritePolicy,
    types: HashMap<String, ColumnType>,
}

impl TableSpec {
    pub fn new(
        name: &str,
        key: &[&str],
        policy: WritePolicy,
        types: &[(&str, ColumnType)],
    ) -> Self {
        Self {
            name: name.to_string(),
            key: key.iter().map(|k| k.to_string()).collect(),
            policy,
            types: types
                .iter()
                .map(|(name, ty)| (name.to_string(), *ty))
                .collect(),
        }
    }

    /// The `data` table, keyed on `(station_id, datetime, layer)`.
    pub fn observations() -> Self {
        Self::new(
            OBSERVATIONS_TABLE,
            &["station_id", "datetime", "layer"],
            WritePolicy::Upsert,
            OBSERVATION_TYPES,
        )
    }

    /// The `stations` table, keyed on `station_id`.
    pub fn stations(policy: WritePolicy) -> Self {
        Self::new(STATIONS_TABLE, &["station_id"], policy, STATION_TYPES)
    }

    pub fn column_type(&self, column: &str) -> Option<ColumnType> {
        self.types.get(column).copied()
    }

    pub fn is_key(&self, column: &str) -> bool {
        self.key.iter().any(|k| k.eq_ignore_ascii_case(column))
    }

    /// Columns with a declared type take part in change detection;
    /// unmapped source headers do not.
    pub fn is_typed(&self, column: &str) -> bool {
        self.types.contains_key(column)
    }

    /// Declared spelling of a column matched ignoring case.
    pub fn canonical_column(&self, column: &str) -> Option<String> {
        self.key
            .iter()
            .chain(self.types.keys())
            .find(|declared| declared.eq_ignore_ascii_case(column))
            .cloned()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoercionStats {
    pub cells_checked: usize,
    pub downgraded_to_missing: usize,
    pub columns_merged: usize,
}

/// Coerce every column of `table` to the type `spec` declares for it.
///
/// Unparseable numbers and timestamps become `Missing`; this never fails.
/// Undeclared columns are carried as verbatim text. Key columns are trimmed.
/// Columns whose names differ only by case are merged first, keeping the
/// declared spelling.
pub fn enforce_types(table: &mut Table, spec: &TableSpec, codec: &SentinelCodec) -> CoercionStats {
    let mut stats = CoercionStats {
        columns_merged: table.unify_columns(|c| spec.canonical_column(c)),
        ..CoercionStats::default()
    };
    let plan: Vec<(Option<ColumnType>, bool)> = table
        .columns()
        .iter()
        .map(|c| (spec.column_type(c), spec.is_key(c)))
        .collect();

    for row in table.rows_mut() {
        for (cell, (column_type, is_key)) in row.iter_mut().zip(&plan) {
            let raw = std::mem::replace(cell, Value::Missing);
            let was_present = !codec.is_missing(&raw);
            let mut coerced = match column_type {
                Some(ty) => coerce(raw, *ty, codec),
                None => coerce(raw, ColumnType::Text, codec),
            };
            if *is_key {
                if let Value::Text(s) = &coerced {
                    let trimmed = s.trim();
                    coerced = if trimmed.is_empty() {
                        Value::Missing
                    } else {
                        Value::Text(trimmed.to_string())
                    };
                }
            }
            stats.cells_checked += 1;
            if was_present && coerced.is_missing() {
                stats.downgraded_to_missing += 1;
            }
            *cell = coerced;
        }
    }

    if stats.downgraded_to_missing > 0 {
        debug!(
            "{}: {} of {} cells could not be coerced and are now missing",
            spec.name, stats.downgraded_to_missing, stats.cells_checked
        );
    }
    stats
}

/// Coerce one value to `column_type`. Sentinels and failures yield `Missing`.
pub fn coerce(value: Value, column_type: ColumnType, codec: &SentinelCodec) -> Value {
    let value = codec.decode(value);
    match (column_type, value) {
        (_, Value::Missing) => Value::Missing,

        (ColumnType::Text, Value::Text(s)) => Value::Text(s),
        (ColumnType::Text, other) => Value::Text(other.key_text()),

        (ColumnType::Float, Value::Float(f)) => finite(f),
        (ColumnType::Float, Value::Integer(i)) => Value::Float(i as f64),
        (ColumnType::Float, Value::Text(s)) => match s.trim().parse::<f64>() {
            Ok(f) => codec.decode(finite(f)),
            Err(_) => Value::Missing,
        },
        (ColumnType::Float, Value::Timestamp(_)) => Value::Missing,

        (ColumnType::Integer, Value::Integer(i)) => Value::Integer(i),
        (ColumnType::Integer, Value::Float(f)) => integral(f),
        (ColumnType::Integer, Value::Text(s)) => {
            let s = s.trim();
            match s.parse::<i64>() {
                Ok(i) => codec.decode(Value::Integer(i)),
                Err(_) => match s.parse::<f64>() {
                    Ok(f) => codec.decode(integral(f)),
                    Err(_) => Value::Missing,
                },
            }
        }
        (ColumnType::Integer, Value::Timestamp(_)) => Value::Missing,

        (ColumnType::Timestamp, Value::Timestamp(ts)) => Value::Timestamp(ts),
        (ColumnType::Timestamp, Value::Text(s)) => parse_timestamp(&s)
            .map(Value::Timestamp)
            .unwrap_or(Value::Missing),
        (ColumnType::Timestamp, _) => Value::Missing,
    }
}

fn finite(f: f64) -> Value {
    if f.is_finite() {
        Value::Float(f)
    } else {
        Value::Missing
    }
}

fn integral(f: f64) -> Value {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Value::Integer(f as i64)
    } else {
        Value::Missing
    }
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];

/// Parse the timestamp layouts found in the source sheets and in the store.
/// A bare date parses as midnight.
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    for format in DATETIME_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, format) {
            return Some(ts);
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    None
}
