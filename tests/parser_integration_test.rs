use rust_xlsxwriter::Workbook;
use std::path::Path;
use tempfile::TempDir;
use wq_sync::config::Config;
use wq_sync::db::Repository;
use wq_sync::guard::{FixedResolver, Resolution};
use wq_sync::sync::{check_sources, Syncer};
use wq_sync::workbook::{discover, read_all, SheetRole, SheetRouter};

/// Write a cruise workbook with a station sheet, a master sheet and an
/// unrelated notes sheet.
fn write_cruise_workbook(path: &Path, temps: &[f64]) {
    let mut workbook = Workbook::new();

    let stations = workbook.add_worksheet();
    stations.set_name("Station Info").unwrap();
    for (col, header) in ["Station ID", "Latitude", "Longitude"].iter().enumerate() {
        stations.write_string(0, col as u16, *header).unwrap();
    }
    stations.write_string(1, 0, "S1").unwrap();
    stations.write_number(1, 1, 29.51).unwrap();
    stations.write_number(1, 2, -94.52).unwrap();

    let master = workbook.add_worksheet();
    master.set_name("Master").unwrap();
    let headers = [
        "Station",
        "Date",
        "Time (Local)",
        "Layer",
        "Temp (C)",
        "Salinity (PSU)",
        "Wind (m/s)",
    ];
    for (col, header) in headers.iter().enumerate() {
        master.write_string(0, col as u16, *header).unwrap();
    }
    for (idx, temp) in temps.iter().enumerate() {
        let row = idx as u32 + 1;
        master.write_string(row, 0, "S1").unwrap();
        master.write_string(row, 1, "2024-03-05").unwrap();
        master.write_string(row, 2, &format!("{:02}:15:42", 8 + idx)).unwrap();
        master.write_string(row, 3, "B").unwrap();
        master.write_number(row, 4, *temp).unwrap();
        master.write_number(row, 5, -999_999.0).unwrap();
        master.write_number(row, 6, 4.0).unwrap();
    }

    let notes = workbook.add_worksheet();
    notes.set_name("Notes").unwrap();
    notes.write_string(0, 0, "not data").unwrap();

    workbook.save(path).expect("Failed to save workbook");
}

fn config_for(data_dir: &Path, db_path: &Path) -> Config {
    Config::from_yaml(&format!(
        "database:\n  path: \"{}\"\nsource:\n  data_dir: \"{}\"\nsync:\n  on_duplicate: abort\n",
        db_path.display(),
        data_dir.display()
    ))
    .expect("Invalid test config")
}

/// Read a workbook back and check routing and cell conversion
#[test]
fn test_read_routes_sheets_by_name() {
    let dir = TempDir::new().unwrap();
    write_cruise_workbook(&dir.path().join("cruise.xlsx"), &[18.2]);

    let files = discover(dir.path(), "*.xlsx").unwrap();
    assert_eq!(files.len(), 1);

    let contents = read_all(&files, &SheetRouter::default());
    assert!(contents.failures.is_empty());
    assert_eq!(contents.sheets.len(), 2);
    assert_eq!(contents.sheets_for(SheetRole::Station).count(), 1);

    let master = contents.sheets_for(SheetRole::Observation).next().unwrap();
    assert_eq!(master.location(), "cruise.xlsx::Master");
    assert_eq!(master.headers[1], "Date");
    assert_eq!(master.rows.len(), 1);
}

/// Full run over real workbooks, then a second run that changes nothing
#[tokio::test]
async fn test_sync_workbooks_end_to_end() {
    let data = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    write_cruise_workbook(&data.path().join("cruise_2024.xlsx"), &[18.2, 18.6]);
    std::fs::write(data.path().join("broken.xlsx"), b"not a workbook").unwrap();

    let config = config_for(data.path(), &store.path().join("WQ.sqlite"));
    let repo = Repository::connect(&config.database.path, 1, config.sync.codec())
        .await
        .expect("Failed to open store");
    let syncer = Syncer::new(repo, config.sync.station_policy.into());

    let report = syncer
        .run(&config, &mut FixedResolver(Resolution::Abort))
        .await
        .expect("Sync failed");

    assert_eq!(report.files, 2);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].location.contains("broken.xlsx"));
    assert_eq!(report.table("stations").unwrap().inserted, 1);
    let data_result = report.table("data").unwrap();
    assert!(data_result.created);
    assert_eq!(data_result.inserted, 2);

    let unmapped: Vec<&String> = report
        .consistency
        .iter()
        .flat_map(|c| c.gaps.keys())
        .collect();
    assert_eq!(unmapped, vec!["wind (m/s)"]);

    let pool = syncer.repository().pool();
    let row = sqlx::query_as::<_, (String, String, String, Option<f64>, String)>(
        "SELECT datetime, time_local, layer, Salinity_PSU, source_file FROM data ORDER BY datetime LIMIT 1",
    )
    .fetch_one(pool)
    .await
    .unwrap();
    assert_eq!(row.0, "2024-03-05 08:15:00");
    assert_eq!(row.1, "08:15");
    assert_eq!(row.2, "B");
    assert_eq!(row.3, None);
    assert_eq!(row.4, "cruise_2024.xlsx");

    let wind: String = sqlx::query_scalar("SELECT wind_m_s FROM data LIMIT 1")
        .fetch_one(pool)
        .await
        .unwrap();
    assert_eq!(wind, "4");

    let again = syncer
        .run(&config, &mut FixedResolver(Resolution::Abort))
        .await
        .expect("Second sync failed");
    let data_result = again.table("data").unwrap();
    assert_eq!(data_result.inserted, 0);
    assert_eq!(data_result.updated, 0);
    assert_eq!(data_result.unchanged, 2);
}

/// The read-only check reports unmapped headers without opening a store
#[test]
fn test_check_reports_unmapped_headers() {
    let data = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    write_cruise_workbook(&data.path().join("cruise.xlsx"), &[18.2]);
    let db_path = store.path().join("WQ.sqlite");

    let report = check_sources(&config_for(data.path(), &db_path)).unwrap();

    assert_eq!(report.files, 1);
    assert!(!report.is_clean());
    assert!(report.duplicates.iter().all(|d| !d.has_conflicts()));
    assert!(report.conflict_listings.is_empty());
    let observation = report
        .consistency
        .iter()
        .find(|c| c.role == SheetRole::Observation)
        .unwrap();
    assert!(observation.gaps.contains_key("wind (m/s)"));
    assert!(!db_path.exists());
}

/// The check returns duplicate listings instead of printing them
#[test]
fn test_check_returns_conflict_listings() {
    let data = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    write_cruise_workbook(&data.path().join("cruise_a.xlsx"), &[18.2]);
    write_cruise_workbook(&data.path().join("cruise_b.xlsx"), &[19.4]);

    let report = check_sources(&config_for(data.path(), &store.path().join("WQ.sqlite"))).unwrap();

    assert!(!report.is_clean());
    assert_eq!(report.conflict_listings.len(), 2);
    let stations = &report.conflict_listings[0];
    assert!(stations.contains("'stations'"));
    assert!(stations.contains("1 of them identical"));
    let observations = &report.conflict_listings[1];
    assert!(observations.contains("'data'"));
    assert!(observations.contains("18.2"));
    assert!(observations.contains("19.4"));
    assert!(observations.contains("cruise_b.xlsx"));
}
