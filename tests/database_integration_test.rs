use chrono::NaiveDate;
use tempfile::TempDir;
use wq_sync::db::models::ApplyPlan;
use wq_sync::db::Repository;
use wq_sync::error::AppError;
use wq_sync::schema::{TableSpec, WritePolicy};
use wq_sync::sentinel::{MissingStorage, SentinelCodec};
use wq_sync::table::Value;

async fn open_store(codec: SentinelCodec) -> (TempDir, Repository) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let repo = Repository::connect(&dir.path().join("WQ.sqlite"), 1, codec)
        .await
        .expect("Failed to open store");
    (dir, repo)
}

fn columns() -> Vec<String> {
    ["station_id", "datetime", "layer", "Temp_C", "Salinity_PSU"]
        .map(String::from)
        .to_vec()
}

fn obs(station: &str, temp: f64, salinity: Value) -> Vec<Value> {
    let ts = NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    vec![
        Value::Text(station.to_string()),
        Value::Timestamp(ts),
        Value::Text("S".to_string()),
        Value::Float(temp),
        salinity,
    ]
}

fn plan(create: bool, inserts: Vec<Vec<Value>>, updates: Vec<Vec<Value>>) -> ApplyPlan {
    ApplyPlan {
        spec: TableSpec::observations(),
        columns: columns(),
        create,
        inserts,
        updates,
        unchanged: 0,
        suppressed: 0,
    }
}

async fn count(repo: &Repository, table: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM \"{}\"", table))
        .fetch_one(repo.pool())
        .await
        .expect("Failed to count rows")
}

/// First apply creates the table and its unique natural-key index
#[tokio::test]
async fn test_apply_creates_table_with_unique_key() {
    let (_dir, repo) = open_store(SentinelCodec::default()).await;
    assert!(!repo.table_exists("data").await.unwrap());

    let results = repo
        .apply(&[plan(true, vec![obs("S1", 18.2, Value::Missing)], vec![])])
        .await
        .expect("Apply failed");

    assert_eq!(results.len(), 1);
    assert!(results[0].created);
    assert_eq!(results[0].inserted, 1);
    assert!(repo.table_exists("data").await.unwrap());

    let index: String = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = 'data'",
    )
    .fetch_one(repo.pool())
    .await
    .expect("Index missing");
    assert_eq!(index, "ux_data_natural_key");

    let stored = repo.stored_columns("data").await.unwrap();
    let names: Vec<&str> = stored.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["station_id", "datetime", "layer", "Temp_C", "Salinity_PSU"]);
    assert_eq!(stored[3].declared_type, "REAL");
}

/// Inserting a key that is already stored is reported, not silently merged
#[tokio::test]
async fn test_insert_of_stored_key_is_constraint_violation() {
    let (_dir, repo) = open_store(SentinelCodec::default()).await;
    repo.apply(&[plan(true, vec![obs("S1", 18.2, Value::Missing)], vec![])])
        .await
        .expect("Initial apply failed");

    let err = repo
        .apply(&[plan(false, vec![obs("S1", 19.0, Value::Missing)], vec![])])
        .await
        .unwrap_err();

    match err {
        AppError::ConstraintViolation { table, .. } => assert_eq!(table, "data"),
        other => panic!("Expected constraint violation, got {other:?}"),
    }
    assert_eq!(count(&repo, "data").await, 1);
}

/// Updates overwrite non-key columns of the matching stored row
#[tokio::test]
async fn test_update_overwrites_matching_row() {
    let (_dir, repo) = open_store(SentinelCodec::default()).await;
    repo.apply(&[plan(
        true,
        vec![obs("S1", 18.2, Value::Missing), obs("S2", 10.0, Value::Float(30.0))],
        vec![],
    )])
    .await
    .expect("Initial apply failed");

    let results = repo
        .apply(&[plan(false, vec![], vec![obs("S1", 19.0, Value::Float(31.5))])])
        .await
        .expect("Update failed");
    assert_eq!(results[0].updated, 1);
    assert_eq!(results[0].inserted, 0);

    let row = sqlx::query_as::<_, (f64, Option<f64>)>(
        "SELECT Temp_C, Salinity_PSU FROM data WHERE station_id = 'S1'",
    )
    .fetch_one(repo.pool())
    .await
    .expect("Failed to fetch");
    assert_eq!(row, (19.0, Some(31.5)));

    let other: f64 = sqlx::query_scalar("SELECT Temp_C FROM data WHERE station_id = 'S2'")
        .fetch_one(repo.pool())
        .await
        .unwrap();
    assert_eq!(other, 10.0);
}

/// An update whose key is not stored is an error and rolls back the whole apply
#[tokio::test]
async fn test_update_of_unknown_key_rolls_back() {
    let (_dir, repo) = open_store(SentinelCodec::default()).await;
    repo.apply(&[plan(true, vec![obs("S1", 18.2, Value::Missing)], vec![])])
        .await
        .expect("Initial apply failed");

    let result = repo
        .apply(&[plan(
            false,
            vec![obs("S2", 11.0, Value::Missing)],
            vec![obs("S9", 12.0, Value::Missing)],
        )])
        .await;

    assert!(matches!(result, Err(AppError::InvalidData(_))));
    assert_eq!(count(&repo, "data").await, 1);
}

/// A failure in a later plan undoes writes made by earlier ones
#[tokio::test]
async fn test_failure_rolls_back_every_table() {
    let (_dir, repo) = open_store(SentinelCodec::default()).await;
    repo.apply(&[plan(true, vec![obs("S1", 18.2, Value::Missing)], vec![])])
        .await
        .expect("Initial apply failed");

    sqlx::query("CREATE TRIGGER block_updates BEFORE UPDATE ON data BEGIN SELECT RAISE(ABORT, 'blocked'); END;")
        .execute(repo.pool())
        .await
        .expect("Failed to install trigger");

    let stations = ApplyPlan {
        spec: TableSpec::stations(WritePolicy::AppendOnly),
        columns: vec!["station_id".to_string(), "latitude".to_string()],
        create: true,
        inserts: vec![vec![Value::Text("S2".to_string()), Value::Float(29.5)]],
        updates: vec![],
        unchanged: 0,
        suppressed: 0,
    };
    let data = plan(
        false,
        vec![obs("S2", 11.0, Value::Missing)],
        vec![obs("S1", 19.0, Value::Missing)],
    );

    assert!(repo.apply(&[stations, data]).await.is_err());

    assert!(!repo.table_exists("stations").await.unwrap());
    assert_eq!(count(&repo, "data").await, 1);
    let temp: f64 = sqlx::query_scalar("SELECT Temp_C FROM data WHERE station_id = 'S1'")
        .fetch_one(repo.pool())
        .await
        .unwrap();
    assert_eq!(temp, 18.2);
}

/// Columns new to the stored table are added before writing
#[tokio::test]
async fn test_new_columns_are_added() {
    let (_dir, repo) = open_store(SentinelCodec::default()).await;
    repo.apply(&[plan(true, vec![obs("S1", 18.2, Value::Missing)], vec![])])
        .await
        .expect("Initial apply failed");

    let mut widened = columns();
    widened.push("pH".to_string());
    let mut row = obs("S2", 11.0, Value::Missing);
    row.push(Value::Float(7.9));

    let mut next = plan(false, vec![row], vec![]);
    next.columns = widened;
    repo.apply(&[next]).await.expect("Apply failed");

    let stored = repo.stored_columns("data").await.unwrap();
    assert!(stored.iter().any(|c| c.name == "pH" && c.declared_type == "REAL"));

    let ph: Option<f64> = sqlx::query_scalar("SELECT pH FROM data WHERE station_id = 'S1'")
        .fetch_one(repo.pool())
        .await
        .unwrap();
    assert_eq!(ph, None);
}

/// Missing cells are NULL by default and read back as missing
#[tokio::test]
async fn test_missing_stored_as_null() {
    let (_dir, repo) = open_store(SentinelCodec::default()).await;
    repo.apply(&[plan(true, vec![obs("S1", 18.2, Value::Missing)], vec![])])
        .await
        .unwrap();

    let salinity: Option<f64> = sqlx::query_scalar("SELECT Salinity_PSU FROM data")
        .fetch_one(repo.pool())
        .await
        .unwrap();
    assert_eq!(salinity, None);

    let table = repo.load_table(&TableSpec::observations()).await.unwrap();
    assert_eq!(table.len(), 1);
    assert_eq!(table.value_by_name(0, "Salinity_PSU"), &Value::Missing);
    assert_eq!(
        table.value_by_name(0, "datetime"),
        &Value::Text("2024-01-01 00:00:00".to_string())
    );
}

/// With sentinel storage, missing numeric cells are written as the sentinel
/// and decoded back to missing on load
#[tokio::test]
async fn test_missing_stored_as_sentinel() {
    let codec = SentinelCodec::new(-999_999.0, MissingStorage::Sentinel);
    let (_dir, repo) = open_store(codec).await;
    repo.apply(&[plan(true, vec![obs("S1", 18.2, Value::Missing)], vec![])])
        .await
        .unwrap();

    let salinity: f64 = sqlx::query_scalar("SELECT Salinity_PSU FROM data")
        .fetch_one(repo.pool())
        .await
        .unwrap();
    assert_eq!(salinity, -999_999.0);

    let table = repo.load_table(&TableSpec::observations()).await.unwrap();
    assert_eq!(table.value_by_name(0, "Salinity_PSU"), &Value::Missing);
    assert_eq!(table.value_by_name(0, "Temp_C"), &Value::Float(18.2));
}

/// A missing key part is stored as the empty string, never NULL
#[tokio::test]
async fn test_missing_key_part_stored_as_empty_text() {
    let (_dir, repo) = open_store(SentinelCodec::default()).await;
    let mut row = obs("S1", 18.2, Value::Missing);
    row[1] = Value::Missing;
    repo.apply(&[plan(true, vec![row], vec![])]).await.unwrap();

    let datetime: String = sqlx::query_scalar("SELECT datetime FROM data")
        .fetch_one(repo.pool())
        .await
        .unwrap();
    assert_eq!(datetime, "");
}
