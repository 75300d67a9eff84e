use crate::error::{AppError, Result};
use crate::guard::DuplicatePolicy;
use crate::schema::WritePolicy;
use crate::sentinel::{MissingStorage, SentinelCodec, DEFAULT_SENTINEL};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub mappings: MappingOverrides,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections", deserialize_with = "deserialize_u32")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub data_dir: PathBuf,
    #[serde(default = "default_pattern")]
    pub pattern: String,
    #[serde(default = "default_station_marker")]
    pub station_sheet_marker: String,
    #[serde(default = "default_observation_marker")]
    pub observation_sheet_marker: String,
}

fn default_pattern() -> String {
    "**/*.xlsx".to_string()
}

fn default_station_marker() -> String {
    "station".to_string()
}

fn default_observation_marker() -> String {
    "master".to_string()
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StationPolicy {
    #[default]
    AppendOnly,
    Upsert,
}

impl From<StationPolicy> for WritePolicy {
    fn from(policy: StationPolicy) -> Self {
        match policy {
            StationPolicy::AppendOnly => WritePolicy::AppendOnly,
            StationPolicy::Upsert => WritePolicy::Upsert,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default)]
    pub station_policy: StationPolicy,
    #[serde(default)]
    pub on_duplicate: DuplicatePolicy,
    /// Drop repeated keys whose rows agree apart from `source_file` without
    /// asking. Off unless set.
    #[serde(default)]
    pub collapse_identical_duplicates: bool,
    #[serde(default = "default_sentinel", deserialize_with = "deserialize_f64")]
    pub missing_sentinel: f64,
    #[serde(default)]
    pub store_missing_as: MissingStorage,
    #[serde(default = "default_layer")]
    pub default_layer: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            station_policy: StationPolicy::default(),
            on_duplicate: DuplicatePolicy::default(),
            collapse_identical_duplicates: false,
            missing_sentinel: default_sentinel(),
            store_missing_as: MissingStorage::default(),
            default_layer: default_layer(),
        }
    }
}

impl SyncConfig {
    pub fn codec(&self) -> SentinelCodec {
        SentinelCodec::new(self.missing_sentinel, self.store_missing_as)
    }
}

fn default_sentinel() -> f64 {
    DEFAULT_SENTINEL
}

fn default_layer() -> String {
    crate::parser::DEFAULT_LAYER.to_string()
}

/// Extra `source header → canonical column` aliases per sheet role.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct MappingOverrides {
    #[serde(default)]
    pub station: BTreeMap<String, String>,
    #[serde(default)]
    pub observation: BTreeMap<String, String>,
}

/// Numbers may arrive as YAML numbers or, after `${VAR}` substitution, as strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum NumberValue<T> {
    Number(T),
    String(String),
}

fn deserialize_u32<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    match NumberValue::<u32>::deserialize(deserializer)? {
        NumberValue::Number(n) => Ok(n),
        NumberValue::String(s) => s
            .trim()
            .parse::<u32>()
            .map_err(|_| serde::de::Error::custom(format!("Invalid integer: '{}'", s))),
    }
}

fn deserialize_f64<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match NumberValue::<f64>::deserialize(deserializer)? {
        NumberValue::Number(n) => Ok(n),
        NumberValue::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| serde::de::Error::custom(format!("Invalid number: '{}'", s))),
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| AppError::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        // Substitute environment variables
        let expanded = expand_env_vars(content)?;

        let config: Config = serde_yaml::from_str(&expanded)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let paths_to_check = [
            ("database.path", self.database.path.to_string_lossy()),
            ("source.data_dir", self.source.data_dir.to_string_lossy()),
        ];
        for (field_name, value) in &paths_to_check {
            if value.is_empty() {
                return Err(AppError::Config(format!("{} cannot be empty", field_name)));
            }
        }

        if self.database.max_connections == 0 {
            return Err(AppError::Config(
                "Database max_connections must be at least 1".to_string(),
            ));
        }

        if self.database.max_connections > 16 {
            return Err(AppError::Config(format!(
                "Database max_connections {} is too high for a single-writer SQLite store, maximum is 16",
                self.database.max_connections
            )));
        }

        let station_marker = self.source.station_sheet_marker.trim().to_lowercase();
        let observation_marker = self.source.observation_sheet_marker.trim().to_lowercase();
        if station_marker.is_empty() || observation_marker.is_empty() {
            return Err(AppError::Config(
                "Sheet markers cannot be empty".to_string(),
            ));
        }
        if station_marker == observation_marker {
            return Err(AppError::Config(format!(
                "Station and observation sheets use the same marker '{}'",
                station_marker
            )));
        }

        if let Err(e) = glob::Pattern::new(&self.source.pattern) {
            return Err(AppError::Config(format!(
                "Invalid source pattern '{}': {}",
                self.source.pattern, e
            )));
        }

        if !self.sync.missing_sentinel.is_finite() {
            return Err(AppError::Config(
                "sync.missing_sentinel must be a finite number".to_string(),
            ));
        }

        if self.sync.default_layer.trim().is_empty() {
            return Err(AppError::Config(
                "sync.default_layer cannot be empty".to_string(),
            ));
        }

        if self.database.path.exists() && self.database.path.is_dir() {
            return Err(AppError::Config(format!(
                "database.path {} is a directory",
                self.database.path.display()
            )));
        }

        if !self.source.data_dir.is_dir() {
            tracing::warn!(
                "source.data_dir {} does not exist yet",
                self.source.data_dir.display()
            );
        }

        Ok(())
    }
}

/// Replace every `${VAR}` with its environment value. All unset variables
/// are reported together.
fn expand_env_vars(content: &str) -> Result<String> {
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| AppError::Config(format!("Invalid substitution pattern: {}", e)))?;

    let mut missing: Vec<String> = Vec::new();
    let expanded = re.replace_all(content, |cap: &regex_lite::Captures<'_>| {
        let name = cap.get(1).map(|m| m.as_str()).unwrap_or_default();
        match std::env::var(name) {
            Ok(value) => value,
            Err(_) => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        missing.sort_unstable();
        missing.dedup();
        return Err(AppError::Config(format!(
            "Unset environment variable{} referenced by the config: {}\n\n\
             Set {} in the environment or in a .env file (see .env.example)",
            if missing.len() > 1 { "s" } else { "" },
            missing.join(", "),
            if missing.len() > 1 { "them" } else { "it" }
        )));
    }

    Ok(expanded.into_owned())
}
