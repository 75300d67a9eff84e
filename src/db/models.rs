use crate::schema::TableSpec;
use crate::table::Value;
use sqlx::FromRow;

/// A column as declared in the stored table.
#[derive(Debug, Clone, FromRow)]
pub struct StoredColumn {
    pub name: String,
    pub declared_type: String,
}

/// Writes planned for one table within a sync.
#[derive(Debug, Clone)]
pub struct ApplyPlan {
    pub spec: TableSpec,
    /// Column layout of `inserts` and `updates`.
    pub columns: Vec<String>,
    /// Table did not exist: create it (with its unique key index) first.
    pub create: bool,
    pub inserts: Vec<Vec<Value>>,
    pub updates: Vec<Vec<Value>>,
    /// Matched rows with no difference; counted, never written.
    pub unchanged: usize,
    /// Updates withheld by an append-only policy.
    pub suppressed: usize,
}

impl ApplyPlan {
    pub fn has_writes(&self) -> bool {
        self.create || !self.inserts.is_empty() || !self.updates.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    pub table: String,
    pub created: bool,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub suppressed: usize,
}
