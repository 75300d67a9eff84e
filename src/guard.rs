//! Intra-batch duplicate key detection.
//!
//! Runs before any diffing or writing. Every set of rows sharing a natural
//! key forms a group that an operator must resolve before the sync may
//! continue. Groups whose rows agree apart from provenance are marked
//! identical and may be collapsed unattended when configured.

use crate::error::{AppError, Result};
use crate::schema::{TableSpec, PROVENANCE_COLUMN};
use crate::sentinel::SentinelCodec;
use crate::table::{RowKey, Table};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use tracing::{info, warn};

/// Operator decision for a batch with conflicting keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Keep the first row per key, drop the rest, continue.
    KeepFirst,
    /// Stop the whole sync with nothing written.
    Abort,
}

/// Configured way of reaching a [`Resolution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    #[default]
    Prompt,
    KeepFirst,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictGroup {
    pub key: RowKey,
    /// Batch row indices in original order.
    pub rows: Vec<usize>,
    /// Every row repeats the first, ignoring `source_file`.
    pub identical: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateReport {
    pub table: String,
    pub key_columns: Vec<String>,
    /// Groups awaiting a decision, sorted by key.
    pub groups: Vec<ConflictGroup>,
    /// Identical groups already collapsed to their first row.
    pub collapsed: Vec<ConflictGroup>,
}

impl DuplicateReport {
    pub fn has_conflicts(&self) -> bool {
        !self.groups.is_empty()
    }

    pub fn conflicting_rows(&self) -> usize {
        self.groups.iter().map(|g| g.rows.len()).sum()
    }

    pub fn all_identical(&self) -> bool {
        !self.groups.is_empty() && self.groups.iter().all(|g| g.identical)
    }

    /// Move identical groups out of the decision, keeping their first rows.
    /// Returns the number of groups collapsed.
    pub fn collapse_identical(&mut self) -> usize {
        let (identical, differing): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.groups).into_iter().partition(|g| g.identical);
        self.groups = differing;
        let count = identical.len();
        self.collapsed.extend(identical);
        count
    }

    /// Tabular listing of every row in an open group, all columns, sorted
    /// by key. Identical groups are marked.
    pub fn render(&self, batch: &Table) -> String {
        let mut out = String::new();
        let identical = self.groups.iter().filter(|g| g.identical).count();
        let _ = writeln!(
            out,
            "{} key group(s) in '{}' share a natural key ({}), {} of them identical apart from {}:",
            self.groups.len(),
            self.table,
            self.key_columns.join(", "),
            identical,
            PROVENANCE_COLUMN
        );

        let columns = batch.columns();
        let mut widths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
        let mut blocks: Vec<(bool, Vec<Vec<String>>)> = Vec::new();
        for group in &self.groups {
            let mut lines = Vec::with_capacity(group.rows.len());
            for &row in &group.rows {
                let cells: Vec<String> = (0..columns.len())
                    .map(|col| batch.value(row, col).to_string())
                    .collect();
                for (width, cell) in widths.iter_mut().zip(&cells) {
                    *width = (*width).max(cell.len());
                }
                lines.push(cells);
            }
            blocks.push((group.identical, lines));
        }

        let pad = |cells: &[String]| -> String {
            cells
                .iter()
                .zip(&widths)
                .map(|(c, w)| format!("{:<w$}", c, w = *w))
                .collect::<Vec<_>>()
                .join(" | ")
        };
        let _ = writeln!(out, "{}", pad(columns));
        for (identical, lines) in blocks {
            if identical {
                let _ = writeln!(out, "{}", IDENTICAL_MARK);
            }
            for line in lines {
                let _ = writeln!(out, "{}", pad(&line));
            }
            let _ = writeln!(out);
        }
        out
    }
}

const IDENTICAL_MARK: &str = "# identical rows";

/// Group the batch by natural key and classify repeated keys.
pub fn inspect(batch: &Table, spec: &TableSpec, codec: &SentinelCodec) -> DuplicateReport {
    let positions = batch.key_positions(&spec.key);
    let mut by_key: BTreeMap<RowKey, Vec<usize>> = BTreeMap::new();
    for row in 0..batch.len() {
        by_key.entry(batch.key_of(row, &positions)).or_default().push(row);
    }

    let compared: Vec<usize> = batch
        .columns()
        .iter()
        .enumerate()
        .filter(|(_, c)| c.as_str() != PROVENANCE_COLUMN)
        .map(|(idx, _)| idx)
        .collect();

    let mut groups = Vec::new();
    for (key, rows) in by_key {
        if rows.len() < 2 {
            continue;
        }
        let first = rows[0];
        let identical = rows[1..].iter().all(|&other| {
            compared
                .iter()
                .all(|&col| codec.equal(batch.value(first, col), batch.value(other, col)))
        });
        groups.push(ConflictGroup {
            key,
            rows,
            identical,
        });
    }

    DuplicateReport {
        table: spec.name.clone(),
        key_columns: spec.key.clone(),
        groups,
        collapsed: Vec::new(),
    }
}

/// Apply a resolution. `Abort` with open groups is an error; otherwise every
/// non-first row of each group, open or collapsed, is dropped.
pub fn resolve(mut batch: Table, report: &DuplicateReport, resolution: Resolution) -> Result<Table> {
    if report.has_conflicts() && resolution == Resolution::Abort {
        return Err(AppError::DuplicateKeys {
            table: report.table.clone(),
            groups: report.groups.len(),
        });
    }

    let mut dropped: HashSet<usize> = HashSet::new();
    let mut exact_copies = 0;
    for group in report.groups.iter().chain(&report.collapsed) {
        dropped.extend(group.rows.iter().skip(1).copied());
        if group.identical {
            exact_copies += group.rows.len() - 1;
        }
    }
    if dropped.is_empty() {
        return Ok(batch);
    }

    batch.retain_rows(|idx| !dropped.contains(&idx));
    info!(
        "{}: dropped {} repeated rows ({} exact copies)",
        report.table,
        dropped.len(),
        exact_copies
    );
    Ok(batch)
}

/// Supplies the operator decision for a batch with conflicts.
pub trait ConflictResolver {
    fn decide(&mut self, report: &DuplicateReport, batch: &Table) -> Result<Resolution>;
}

/// Always answers the same way; used for unattended runs and tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedResolver(pub Resolution);

impl ConflictResolver for FixedResolver {
    fn decide(&mut self, report: &DuplicateReport, batch: &Table) -> Result<Resolution> {
        warn!("{}", report.render(batch));
        warn!(
            "{}: {} conflicting rows, resolving with {:?}",
            report.table,
            report.conflicting_rows(),
            self.0
        );
        Ok(self.0)
    }
}

/// Shows the conflicting rows on the terminal and asks the operator.
#[derive(Debug, Default)]
pub struct PromptResolver;

impl ConflictResolver for PromptResolver {
    fn decide(&mut self, report: &DuplicateReport, batch: &Table) -> Result<Resolution> {
        println!("{}", report.render(batch));
        let options = [
            "Keep the first row per key and continue",
            "Abort the sync (nothing is written)",
        ];
        let prompt = if report.all_identical() {
            format!(
                "Duplicate keys in '{}' (rows identical apart from {})",
                report.table, PROVENANCE_COLUMN
            )
        } else {
            format!("Duplicate keys in '{}'", report.table)
        };
        let choice = dialoguer::Select::new()
            .with_prompt(prompt)
            .items(&options)
            .default(1)
            .interact()?;
        Ok(if choice == 0 {
            Resolution::KeepFirst
        } else {
            Resolution::Abort
        })
    }
}

/// Build the resolver a [`DuplicatePolicy`] asks for.
pub fn resolver_for(policy: DuplicatePolicy) -> Box<dyn ConflictResolver> {
    match policy {
        DuplicatePolicy::Prompt => Box::new(PromptResolver),
        DuplicatePolicy::KeepFirst => Box::new(FixedResolver(Resolution::KeepFirst)),
        DuplicatePolicy::Abort => Box::new(FixedResolver(Resolution::Abort)),
    }
}
