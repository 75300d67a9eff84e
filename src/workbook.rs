use crate::error::{AppError, Result};
use crate::table::{format_number, Value};
use calamine::{open_workbook_auto, Data, Reader};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Which pipeline a sheet feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SheetRole {
    Station,
    Observation,
}

impl fmt::Display for SheetRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SheetRole::Station => write!(f, "station"),
            SheetRole::Observation => write!(f, "observation"),
        }
    }
}

/// One worksheet as read from disk: header row plus data rows.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSheet {
    pub file_name: String,
    pub sheet_name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl RawSheet {
    pub fn location(&self) -> String {
        format!("{}::{}", self.file_name, self.sheet_name)
    }
}

/// A workbook or sheet that could not be loaded and was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetFailure {
    pub location: String,
    pub reason: String,
}

/// Routes sheets by case-insensitive substring markers in their names.
#[derive(Debug, Clone)]
pub struct SheetRouter {
    station_marker: String,
    observation_marker: String,
}

impl Default for SheetRouter {
    fn default() -> Self {
        Self::new("station", "master")
    }
}

impl SheetRouter {
    pub fn new(station_marker: &str, observation_marker: &str) -> Self {
        Self {
            station_marker: station_marker.trim().to_lowercase(),
            observation_marker: observation_marker.trim().to_lowercase(),
        }
    }

    /// A sheet may match both markers, in which case it feeds both pipelines.
    pub fn roles(&self, sheet_name: &str) -> Vec<SheetRole> {
        let name = sheet_name.trim().to_lowercase();
        let mut roles = Vec::new();
        if name.contains(&self.station_marker) {
            roles.push(SheetRole::Station);
        }
        if name.contains(&self.observation_marker) {
            roles.push(SheetRole::Observation);
        }
        roles
    }
}

/// Everything loaded from one workbook: routed sheets plus per-sheet failures.
#[derive(Debug, Default)]
pub struct WorkbookContents {
    pub sheets: Vec<(SheetRole, RawSheet)>,
    pub failures: Vec<SheetFailure>,
}

impl WorkbookContents {
    pub fn extend(&mut self, other: WorkbookContents) {
        self.sheets.extend(other.sheets);
        self.failures.extend(other.failures);
    }

    pub fn sheets_for(&self, role: SheetRole) -> impl Iterator<Item = &RawSheet> {
        self.sheets
            .iter()
            .filter(move |(r, _)| *r == role)
            .map(|(_, sheet)| sheet)
    }
}

/// List workbooks under `data_dir` matching `pattern`, sorted for a stable run order.
pub fn discover(data_dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let full = data_dir.join(pattern);
    let full = full.to_string_lossy();
    let entries = glob::glob(&full)
        .map_err(|e| AppError::Config(format!("Invalid source pattern '{}': {}", full, e)))?;

    let mut files = Vec::new();
    for entry in entries {
        match entry {
            Ok(path) if path.is_file() => {
                // Excel lock files ("~$book.xlsx") are not workbooks.
                let is_lock = path
                    .file_name()
                    .map(|n| n.to_string_lossy().starts_with("~$"))
                    .unwrap_or(false);
                if !is_lock {
                    files.push(path);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Skipping unreadable path: {}", e),
        }
    }
    files.sort();
    Ok(files)
}

/// Load every routed sheet of one workbook.
///
/// A workbook that cannot be opened is an error; a sheet that cannot be read
/// is recorded in `failures` and the remaining sheets are still returned.
pub fn read_workbook(path: &Path, router: &SheetRouter) -> Result<WorkbookContents> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let mut workbook = open_workbook_auto(path)?;
    let mut contents = WorkbookContents::default();

    for sheet_name in workbook.sheet_names() {
        let roles = router.roles(&sheet_name);
        if roles.is_empty() {
            debug!("Ignoring sheet {}::{}", file_name, sheet_name);
            continue;
        }

        let range = match workbook.worksheet_range(&sheet_name) {
            Ok(range) => range,
            Err(e) => {
                contents.failures.push(SheetFailure {
                    location: format!("{}::{}", file_name, sheet_name),
                    reason: e.to_string(),
                });
                continue;
            }
        };

        let mut rows = range.rows();
        let headers: Vec<String> = match rows.next() {
            Some(header_row) => header_row.iter().map(header_text).collect(),
            None => Vec::new(),
        };
        let data: Vec<Vec<Value>> = rows.map(|r| r.iter().map(cell_value).collect()).collect();

        debug!(
            "Read {}::{} ({} columns, {} rows)",
            file_name,
            sheet_name,
            headers.len(),
            data.len()
        );

        let sheet = RawSheet {
            file_name: file_name.clone(),
            sheet_name: sheet_name.clone(),
            headers,
            rows: data,
        };
        for role in roles {
            contents.sheets.push((role, sheet.clone()));
        }
    }

    Ok(contents)
}

/// Read all workbooks, isolating failures per file.
pub fn read_all(files: &[PathBuf], router: &SheetRouter) -> WorkbookContents {
    let mut all = WorkbookContents::default();
    for path in files {
        match read_workbook(path, router) {
            Ok(contents) => all.extend(contents),
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                all.failures.push(SheetFailure {
                    location: path.display().to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }
    all
}

fn header_text(cell: &Data) -> String {
    match cell_value(cell) {
        Value::Missing => String::new(),
        other => other.key_text(),
    }
}

/// Convert a spreadsheet cell. Time-of-day cells become `HH:MM:SS` text.
pub fn cell_value(cell: &Data) -> Value {
    match cell {
        Data::Empty | Data::Error(_) => Value::Missing,
        Data::String(s) => {
            if s.trim().is_empty() {
                Value::Missing
            } else {
                Value::Text(s.clone())
            }
        }
        Data::Int(i) => Value::Integer(*i),
        Data::Float(f) => Value::Float(*f),
        Data::Bool(b) => Value::Text(b.to_string()),
        Data::DateTime(dt) => {
            let serial = dt.as_f64();
            match dt.as_datetime() {
                Some(ts) if (0.0..1.0).contains(&serial) => {
                    Value::Text(ts.time().format("%H:%M:%S").to_string())
                }
                Some(ts) => Value::Timestamp(ts),
                None => Value::Text(format_number(serial)),
            }
        }
        Data::DateTimeIso(s) | Data::DurationIso(s) => Value::Text(s.clone()),
    }
}
