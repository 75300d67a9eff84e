use crate::error::{AppError, Result};
use crate::normalizer::{normalize_sheet, ColumnMap};
use crate::schema::PROVENANCE_COLUMN;
use crate::sentinel::SentinelCodec;
use crate::table::{Table, Value};
use crate::workbook::{RawSheet, SheetFailure, SheetRole, WorkbookContents};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use tracing::{info, warn};

/// Layer marker used when a sheet has no layer column or leaves it blank.
pub const DEFAULT_LAYER: &str = "S";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub sheets_parsed: usize,
    pub sheets_failed: usize,
    pub station_rows: usize,
    pub observation_rows: usize,
    pub datetime_failures: usize,
}

/// Station and observation batches assembled from every parsed sheet.
#[derive(Debug, Default)]
pub struct ParsedBatches {
    pub stations: Table,
    pub observations: Table,
    pub failures: Vec<SheetFailure>,
    pub stats: ParseStats,
}

pub struct Parser {
    station_map: ColumnMap,
    observation_map: ColumnMap,
    codec: SentinelCodec,
    default_layer: String,
}

impl Parser {
    pub fn new(
        station_map: ColumnMap,
        observation_map: ColumnMap,
        codec: SentinelCodec,
        default_layer: &str,
    ) -> Self {
        Self {
            station_map,
            observation_map,
            codec,
            default_layer: default_layer.to_string(),
        }
    }

    pub fn map_for(&self, role: SheetRole) -> &ColumnMap {
        match role {
            SheetRole::Station => &self.station_map,
            SheetRole::Observation => &self.observation_map,
        }
    }

    /// Normalize one sheet and apply the role-specific finishing steps.
    /// Returns the canonical table and the number of unparseable datetimes.
    pub fn parse_sheet(&self, role: SheetRole, sheet: &RawSheet) -> Result<(Table, usize)> {
        let mut table = normalize_sheet(sheet, self.map_for(role), &self.codec);
        if !table.has_column("station_id") {
            return Err(AppError::Parse(format!(
                "{} has no station id column",
                sheet.location()
            )));
        }

        let datetime_failures = match role {
            SheetRole::Station => 0,
            SheetRole::Observation => self.finish_observations(&mut table, sheet)?,
        };

        let provenance = table.ensure_column(PROVENANCE_COLUMN);
        for row in 0..table.len() {
            table.set_value(row, provenance, Value::Text(sheet.file_name.clone()));
        }

        Ok((table, datetime_failures))
    }

    /// Parse every routed sheet, skipping (and recording) the ones that fail.
    pub fn parse_workbooks(&self, contents: &WorkbookContents) -> ParsedBatches {
        let mut stations = Vec::new();
        let mut observations = Vec::new();
        let mut failures = contents.failures.clone();
        let mut stats = ParseStats {
            sheets_failed: contents.failures.len(),
            ..ParseStats::default()
        };

        for (role, sheet) in &contents.sheets {
            match self.parse_sheet(*role, sheet) {
                Ok((table, datetime_failures)) => {
                    stats.sheets_parsed += 1;
                    stats.datetime_failures += datetime_failures;
                    match role {
                        SheetRole::Station => {
                            stats.station_rows += table.len();
                            stations.push(table);
                        }
                        SheetRole::Observation => {
                            stats.observation_rows += table.len();
                            observations.push(table);
                        }
                    }
                }
                Err(e) => {
                    warn!("Skipping {} sheet {}: {}", role, sheet.location(), e);
                    stats.sheets_failed += 1;
                    failures.push(SheetFailure {
                        location: sheet.location(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Parsed {} sheets ({} failed): {} station rows, {} observation rows",
            stats.sheets_parsed, stats.sheets_failed, stats.station_rows, stats.observation_rows
        );
        if stats.datetime_failures > 0 {
            warn!(
                "{} observation rows have an unparseable date/time and no datetime",
                stats.datetime_failures
            );
        }

        ParsedBatches {
            stations: Table::concat(stations),
            observations: Table::concat(observations),
            failures,
            stats,
        }
    }

    /// Build `datetime` from `date` + `time_local` and default the layer.
    fn finish_observations(&self, table: &mut Table, sheet: &RawSheet) -> Result<usize> {
        let time_idx = match (table.column_index("date"), table.column_index("time_local")) {
            (Some(_), Some(t)) => t,
            _ => {
                return Err(AppError::Parse(format!(
                    "{} needs both a date and a local time column",
                    sheet.location()
                )))
            }
        };

        let datetime_idx = table.insert_column(time_idx + 1, "datetime");
        let (date_idx, time_idx) = match (table.column_index("date"), table.column_index("time_local")) {
            (Some(d), Some(t)) => (d, t),
            _ => return Err(AppError::InvalidData("date/time columns vanished".to_string())),
        };
        let mut failures = 0;
        for row in 0..table.len() {
            let time = truncate_time(table.value(row, time_idx));
            let datetime = compose_datetime(table.value(row, date_idx), &time);
            if datetime.is_none() {
                failures += 1;
            }
            table.set_value(row, time_idx, time);
            table.set_value(
                row,
                datetime_idx,
                datetime.map(Value::Timestamp).unwrap_or(Value::Missing),
            );
        }

        let layer_idx = table.ensure_column("layer");
        for row in 0..table.len() {
            let blank = match table.value(row, layer_idx) {
                Value::Missing => true,
                Value::Text(s) => s.trim().is_empty(),
                _ => false,
            };
            if blank {
                table.set_value(row, layer_idx, Value::Text(self.default_layer.clone()));
            }
        }

        Ok(failures)
    }
}

/// Reduce a local-time cell to `HH:MM`, dropping seconds and artifacts.
pub fn truncate_time(value: &Value) -> Value {
    match value {
        Value::Missing => Value::Missing,
        Value::Timestamp(ts) => Value::Text(ts.time().format("%H:%M").to_string()),
        other => {
            let text = other.key_text();
            let text = text.trim();
            Value::Text(text.chars().take(5).collect())
        }
    }
}

/// Combine a date cell and an `HH:MM` time cell. Either part failing yields `None`.
pub fn compose_datetime(date: &Value, time: &Value) -> Option<NaiveDateTime> {
    let date = match date {
        Value::Timestamp(ts) => ts.date(),
        Value::Text(s) => parse_date(s)?,
        _ => return None,
    };
    let time = match time {
        Value::Text(s) => parse_time(s)?,
        _ => return None,
    };
    Some(NaiveDateTime::new(date, time))
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    // Dates rendered from a full timestamp carry a trailing time part.
    let s = s.split_whitespace().next()?;
    ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%m/%d/%y"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(s, format).ok())
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    let (hour, minute) = s.split_once(':')?;
    let hour: u32 = hour.trim().parse().ok()?;
    let minute: u32 = minute.trim().parse().ok()?;

    if hour > 23 || minute > 59 {
        warn!("Time {} out of valid range", s);
        return None;
    }
    NaiveTime::from_hms_opt(hour, minute, 0)
}
