use crate::config::Config;
use crate::db::models::{ApplyPlan, SyncResult};
use crate::db::Repository;
use crate::differ::diff;
use crate::error::Result;
use crate::guard::{inspect, resolve, ConflictResolver, DuplicateReport, Resolution};
use crate::normalizer::{check_consistency, ColumnMap, ConsistencyReport};
use crate::parser::{ParseStats, ParsedBatches, Parser};
use crate::schema::{enforce_types, TableSpec, WritePolicy};
use crate::sentinel::SentinelCodec;
use crate::table::Table;
use crate::workbook::{discover, read_all, SheetFailure, SheetRole, SheetRouter};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Everything read from the source directory, before any store access.
#[derive(Debug)]
pub struct SourceScan {
    pub files: Vec<PathBuf>,
    pub consistency: Vec<ConsistencyReport>,
    pub parsed: ParsedBatches,
}

/// Discover, read, check and parse every workbook the config points at.
pub fn scan_sources(config: &Config) -> Result<SourceScan> {
    let files = discover(&config.source.data_dir, &config.source.pattern)?;
    info!(
        "Found {} workbooks under {}",
        files.len(),
        config.source.data_dir.display()
    );

    let router = SheetRouter::new(
        &config.source.station_sheet_marker,
        &config.source.observation_sheet_marker,
    );
    let contents = read_all(&files, &router);

    let parser = Parser::new(
        ColumnMap::station().with_aliases(&config.mappings.station),
        ColumnMap::observation().with_aliases(&config.mappings.observation),
        config.sync.codec(),
        &config.sync.default_layer,
    );

    let consistency: Vec<ConsistencyReport> = [SheetRole::Station, SheetRole::Observation]
        .into_iter()
        .map(|role| check_consistency(contents.sheets_for(role), role, parser.map_for(role)))
        .collect();
    for report in &consistency {
        report.log();
    }

    let parsed = parser.parse_workbooks(&contents);

    Ok(SourceScan {
        files,
        consistency,
        parsed,
    })
}

/// Outcome of one full sync run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub files: usize,
    pub failures: Vec<SheetFailure>,
    pub consistency: Vec<ConsistencyReport>,
    pub stats: ParseStats,
    pub tables: Vec<SyncResult>,
}

impl RunReport {
    pub fn table(&self, name: &str) -> Option<&SyncResult> {
        self.tables.iter().find(|t| t.table == name)
    }

    pub fn log_summary(&self) {
        info!(
            "Sync finished: {} workbooks, {} sheets parsed, {} skipped",
            self.files, self.stats.sheets_parsed, self.stats.sheets_failed
        );
        for failure in &self.failures {
            warn!("Skipped {}: {}", failure.location, failure.reason);
        }
        for result in &self.tables {
            info!(
                "{}: {} inserted, {} updated, {} unchanged, {} suppressed{}",
                result.table,
                result.inserted,
                result.updated,
                result.unchanged,
                result.suppressed,
                if result.created { " (table created)" } else { "" }
            );
        }
        let unmapped: usize = self.consistency.iter().map(|c| c.gaps.len()).sum();
        if unmapped > 0 {
            warn!("{} source headers have no canonical mapping", unmapped);
        }
    }
}

/// Outcome of a read-only source check.
#[derive(Debug)]
pub struct CheckReport {
    pub files: usize,
    pub failures: Vec<SheetFailure>,
    pub consistency: Vec<ConsistencyReport>,
    pub duplicates: Vec<DuplicateReport>,
    /// Rendered rows of every table with open duplicate groups.
    pub conflict_listings: Vec<String>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
            && self.consistency.iter().all(|c| c.is_clean())
            && self.duplicates.iter().all(|d| !d.has_conflicts())
    }
}

/// Run every source-side stage (discovery through duplicate detection) without
/// opening the store.
pub fn check_sources(config: &Config) -> Result<CheckReport> {
    let scan = scan_sources(config)?;
    let codec = config.sync.codec();
    let ParsedBatches {
        mut stations,
        mut observations,
        failures,
        ..
    } = scan.parsed;

    let mut duplicates = Vec::new();
    let mut conflict_listings = Vec::new();
    for (batch, spec) in [
        (&mut stations, TableSpec::stations(config.sync.station_policy.into())),
        (&mut observations, TableSpec::observations()),
    ] {
        enforce_types(batch, &spec, &codec);
        let mut report = inspect(batch, &spec, &codec);
        if config.sync.collapse_identical_duplicates {
            report.collapse_identical();
        }
        if report.has_conflicts() {
            conflict_listings.push(report.render(batch));
        }
        duplicates.push(report);
    }

    Ok(CheckReport {
        files: scan.files.len(),
        failures,
        consistency: scan.consistency,
        duplicates,
        conflict_listings,
    })
}

pub struct Syncer {
    repository: Repository,
    station_policy: WritePolicy,
    collapse_identical: bool,
}

impl Syncer {
    pub fn new(repository: Repository, station_policy: WritePolicy) -> Self {
        Self {
            repository,
            station_policy,
            collapse_identical: false,
        }
    }

    /// Collapse duplicate keys whose rows agree apart from provenance
    /// without consulting the resolver.
    pub fn with_identical_collapse(mut self, enabled: bool) -> Self {
        self.collapse_identical = enabled;
        self
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    fn codec(&self) -> &SentinelCodec {
        self.repository.codec()
    }

    /// Full run: read the sources, then sync both batches.
    pub async fn run(&self, config: &Config, resolver: &mut dyn ConflictResolver) -> Result<RunReport> {
        let scan = scan_sources(config)?;
        let ParsedBatches {
            stations,
            observations,
            failures,
            stats,
        } = scan.parsed;

        let tables = self.sync_batches(stations, observations, resolver).await?;

        let report = RunReport {
            files: scan.files.len(),
            failures,
            consistency: scan.consistency,
            stats,
            tables,
        };
        report.log_summary();
        Ok(report)
    }

    /// Plan both tables, then apply the plans in a single transaction.
    ///
    /// Duplicate keys are resolved for both batches before anything is
    /// written, so an abort leaves the store untouched.
    pub async fn sync_batches(
        &self,
        stations: Table,
        observations: Table,
        resolver: &mut dyn ConflictResolver,
    ) -> Result<Vec<SyncResult>> {
        let mut plans = Vec::with_capacity(2);
        for (batch, spec) in [
            (stations, TableSpec::stations(self.station_policy)),
            (observations, TableSpec::observations()),
        ] {
            if let Some(plan) = self.plan_table(batch, spec, resolver).await? {
                plans.push(plan);
            }
        }

        if plans.is_empty() {
            info!("Nothing to sync");
            return Ok(Vec::new());
        }

        self.repository.apply(&plans).await
    }

    /// Type, de-duplicate and diff one batch against its stored table.
    /// An empty batch yields no plan.
    pub async fn plan_table(
        &self,
        mut batch: Table,
        spec: TableSpec,
        resolver: &mut dyn ConflictResolver,
    ) -> Result<Option<ApplyPlan>> {
        if batch.is_empty() {
            debug!("{}: empty batch, skipping", spec.name);
            return Ok(None);
        }

        let codec = self.codec();
        let coercion = enforce_types(&mut batch, &spec, codec);
        if coercion.columns_merged > 0 {
            warn!(
                "{}: {} columns differed from another only by case and were merged",
                spec.name, coercion.columns_merged
            );
        }
        if coercion.downgraded_to_missing > 0 {
            warn!(
                "{}: {} cells could not be coerced to their column type and are treated as missing",
                spec.name, coercion.downgraded_to_missing
            );
        }

        let mut report = inspect(&batch, &spec, codec);
        if self.collapse_identical {
            let collapsed = report.collapse_identical();
            if collapsed > 0 {
                info!(
                    "{}: {} repeated keys with identical rows collapsed",
                    spec.name, collapsed
                );
            }
        }
        let resolution = if report.has_conflicts() {
            resolver.decide(&report, &batch)?
        } else {
            Resolution::KeepFirst
        };
        let batch = resolve(batch, &report, resolution)?;

        let columns = batch.columns().to_vec();

        if !self.repository.table_exists(&spec.name).await? {
            let (_, rows) = batch.into_parts();
            info!("{}: table does not exist yet, {} rows will be inserted", spec.name, rows.len());
            return Ok(Some(ApplyPlan {
                spec,
                columns,
                create: true,
                inserts: rows,
                updates: Vec::new(),
                unchanged: 0,
                suppressed: 0,
            }));
        }

        let mut existing = self.repository.load_table(&spec).await?;
        enforce_types(&mut existing, &spec, codec);

        let mut result = diff(batch, &existing, &spec, codec);
        let mut suppressed = 0;
        if spec.policy == WritePolicy::AppendOnly && !result.updates.is_empty() {
            suppressed = result.updates.len();
            info!(
                "{}: {} changed rows left as stored (append-only)",
                spec.name, suppressed
            );
            result.updates.clear();
        }

        debug!(
            "{}: {} to insert, {} to update, {} unchanged",
            spec.name,
            result.inserts.len(),
            result.updates.len(),
            result.unchanged
        );

        Ok(Some(ApplyPlan {
            spec,
            columns,
            create: false,
            inserts: result.inserts,
            updates: result.updates,
            unchanged: result.unchanged,
            suppressed,
        }))
    }
}
