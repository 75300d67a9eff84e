use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::fmt;

/// Text layout used for timestamps in the store and in natural keys.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

static MISSING: Value = Value::Missing;

/// A single cell. `Missing` is the in-memory stand-in for "no data".
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Missing,
    Text(String),
    Integer(i64),
    Float(f64),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Text form used when the value takes part in a natural key.
    /// Missing renders as the empty string so keys never contain NULL.
    pub fn key_text(&self) -> String {
        match self {
            Value::Missing => String::new(),
            Value::Text(s) => s.clone(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => format_number(*f),
            Value::Timestamp(ts) => ts.format(TIMESTAMP_FORMAT).to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Missing => write!(f, "<missing>"),
            other => write!(f, "{}", other.key_text()),
        }
    }
}

/// Render a float without a trailing `.0` when it is integral.
pub fn format_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        (value as i64).to_string()
    } else {
        value.to_string()
    }
}

/// Natural key of a row, one text part per key column.
pub type RowKey = Vec<String>;

/// An ordered, column-named set of rows. Used both for freshly parsed
/// batches and for snapshots read back from the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn with_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        let mut table = Self::new(columns);
        for row in rows {
            table.push_row(row);
        }
        table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn into_parts(self) -> (Vec<String>, Vec<Vec<Value>>) {
        (self.columns, self.rows)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Case-insensitive lookup, matching how SQLite resolves column names.
    pub fn column_index_ignore_case(&self, name: &str) -> Option<usize> {
        self.column_index(name)
            .or_else(|| self.columns.iter().position(|c| c.eq_ignore_ascii_case(name)))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Append a row, padding with `Missing` (or truncating) to the table width.
    pub fn push_row(&mut self, mut row: Vec<Value>) {
        row.resize(self.columns.len(), Value::Missing);
        self.rows.push(row);
    }

    /// Return the index of `name`, appending it (filled with `Missing`) if absent.
    pub fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(idx) = self.column_index(name) {
            return idx;
        }
        self.columns.push(name.to_string());
        for row in &mut self.rows {
            row.push(Value::Missing);
        }
        self.columns.len() - 1
    }

    /// Insert a new column at `position`, filled with `Missing`.
    pub fn insert_column(&mut self, position: usize, name: &str) -> usize {
        if let Some(idx) = self.column_index(name) {
            return idx;
        }
        let position = position.min(self.columns.len());
        self.columns.insert(position, name.to_string());
        for row in &mut self.rows {
            row.insert(position, Value::Missing);
        }
        position
    }

    pub fn value(&self, row: usize, column: usize) -> &Value {
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .unwrap_or(&MISSING)
    }

    pub fn value_by_name(&self, row: usize, column: &str) -> &Value {
        match self.column_index(column) {
            Some(idx) => self.value(row, idx),
            None => &MISSING,
        }
    }

    pub fn set_value(&mut self, row: usize, column: usize, value: Value) {
        if let Some(cell) = self.rows.get_mut(row).and_then(|r| r.get_mut(column)) {
            *cell = value;
        }
    }

    pub fn rows_mut(&mut self) -> &mut [Vec<Value>] {
        &mut self.rows
    }

    /// Keep only the rows whose index satisfies `keep`, preserving order.
    pub fn retain_rows<F>(&mut self, mut keep: F)
    where
        F: FnMut(usize) -> bool,
    {
        let mut idx = 0;
        self.rows.retain(|_| {
            let kept = keep(idx);
            idx += 1;
            kept
        });
    }

    /// Resolve the key column positions once, for repeated `key_of` calls.
    pub fn key_positions(&self, key_columns: &[String]) -> Vec<Option<usize>> {
        key_columns
            .iter()
            .map(|c| self.column_index_ignore_case(c))
            .collect()
    }

    pub fn key_of(&self, row: usize, positions: &[Option<usize>]) -> RowKey {
        positions
            .iter()
            .map(|pos| match pos {
                Some(idx) => self.value(row, *idx).key_text(),
                None => String::new(),
            })
            .collect()
    }

    /// Merge columns whose names differ only by ASCII case, matching how
    /// SQLite resolves them. Cells fill left to right: the first present
    /// value wins. A merged column takes the first spelling `canonical`
    /// returns for any of its names, else the first spelling seen. Returns
    /// the number of columns folded away.
    pub fn unify_columns<F>(&mut self, canonical: F) -> usize
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut lowered: Vec<String> = Vec::new();
        let mut names: Vec<String> = Vec::new();
        let mut targets: Vec<usize> = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            let key = column.to_ascii_lowercase();
            let target = match lowered.iter().position(|k| *k == key) {
                Some(idx) => idx,
                None => {
                    lowered.push(key);
                    names.push(column.clone());
                    names.len() - 1
                }
            };
            targets.push(target);
        }

        for (idx, name) in names.iter_mut().enumerate() {
            let preferred = self
                .columns
                .iter()
                .zip(&targets)
                .filter(|(_, target)| **target == idx)
                .find_map(|(column, _)| canonical(column));
            if let Some(preferred) = preferred {
                *name = preferred;
            }
        }

        let folded = self.columns.len() - names.len();
        if folded > 0 {
            for row in &mut self.rows {
                *row = fold_row(std::mem::take(row), &targets, names.len());
            }
        }
        self.columns = names;
        folded
    }

    /// Stack tables vertically. Columns are the union of all inputs in
    /// first-seen order, matched ignoring ASCII case; cells a table does not
    /// carry become `Missing`.
    pub fn concat(tables: Vec<Table>) -> Table {
        let mut columns: Vec<String> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        for table in &tables {
            for column in &table.columns {
                let key = column.to_ascii_lowercase();
                if !positions.contains_key(&key) {
                    positions.insert(key, columns.len());
                    columns.push(column.clone());
                }
            }
        }

        let mut out = Table::new(columns);
        for table in tables {
            let mapping: Vec<usize> = table
                .columns
                .iter()
                .map(|c| positions[&c.to_ascii_lowercase()])
                .collect();
            for row in table.rows {
                out.rows.push(fold_row(row, &mapping, out.columns.len()));
            }
        }
        out
    }
}

/// Move each cell to its target column; the first present value per target wins.
fn fold_row(row: Vec<Value>, targets: &[usize], width: usize) -> Vec<Value> {
    let mut out = vec![Value::Missing; width];
    for (value, target) in row.into_iter().zip(targets) {
        if out[*target].is_missing() {
            out[*target] = value;
        }
    }
    out
}
