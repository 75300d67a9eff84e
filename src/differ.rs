use crate::schema::TableSpec;
use crate::sentinel::SentinelCodec;
use crate::table::{RowKey, Table, Value};
use std::collections::HashMap;

/// Classification of one batch row against the stored snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowChange {
    Insert,
    Update,
    Unchanged,
}

/// Rows to write, in the batch's column order. Unchanged rows are only counted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffResult {
    pub inserts: Vec<Vec<Value>>,
    pub updates: Vec<Vec<Value>>,
    pub unchanged: usize,
}

impl DiffResult {
    pub fn is_noop(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty()
    }
}

/// Classify every row of `batch` by natural key against `existing`.
///
/// A row whose key is absent from `existing` is an insert. A matched row is an
/// update if any compared column differs under the sentinel rule, otherwise
/// unchanged. Compared columns are the batch's typed non-key columns; a column
/// the snapshot does not carry counts as missing there.
pub fn classify(
    batch: &Table,
    existing: &Table,
    spec: &TableSpec,
    codec: &SentinelCodec,
) -> Vec<RowChange> {
    let existing_keys = existing.key_positions(&spec.key);
    let mut index: HashMap<RowKey, usize> = HashMap::with_capacity(existing.len());
    for row in 0..existing.len() {
        index.entry(existing.key_of(row, &existing_keys)).or_insert(row);
    }

    // (batch column, matching snapshot column)
    let compared: Vec<(usize, Option<usize>)> = batch
        .columns()
        .iter()
        .enumerate()
        .filter(|(_, name)| !spec.is_key(name) && spec.is_typed(name))
        .map(|(idx, name)| (idx, existing.column_index_ignore_case(name)))
        .collect();

    let batch_keys = batch.key_positions(&spec.key);
    (0..batch.len())
        .map(|row| match index.get(&batch.key_of(row, &batch_keys)) {
            None => RowChange::Insert,
            Some(_) if compared.is_empty() => RowChange::Unchanged,
            Some(&stored) => {
                let differs = compared.iter().any(|&(col, stored_col)| {
                    let old = match stored_col {
                        Some(idx) => existing.value(stored, idx),
                        None => &Value::Missing,
                    };
                    !codec.equal(batch.value(row, col), old)
                });
                if differs {
                    RowChange::Update
                } else {
                    RowChange::Unchanged
                }
            }
        })
        .collect()
}

/// Partition `batch` into insert and update sets, consuming it.
pub fn diff(batch: Table, existing: &Table, spec: &TableSpec, codec: &SentinelCodec) -> DiffResult {
    let changes = classify(&batch, existing, spec, codec);
    let (_, rows) = batch.into_parts();

    let mut result = DiffResult::default();
    for (row, change) in rows.into_iter().zip(changes) {
        match change {
            RowChange::Insert => result.inserts.push(row),
            RowChange::Update => result.updates.push(row),
            RowChange::Unchanged => result.unchanged += 1,
        }
    }
    result
}
