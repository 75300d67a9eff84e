use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::{Config, StationPolicy};
use crate::guard::DuplicatePolicy;

#[derive(Debug, Parser)]
#[command(author, version, about = "Sync water-quality workbooks into a SQLite store", long_about = None)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "config/config.yaml")]
    pub config: PathBuf,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Read every workbook and write new or changed rows to the store
    Sync(SyncArgs),
    /// Read every workbook and report unmapped columns, unreadable sheets and duplicate keys
    Check(CheckArgs),
}

#[derive(Debug, Args, Default)]
pub struct SyncArgs {
    /// Directory holding the source workbooks (overrides source.data_dir)
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,
    /// SQLite file to write (overrides database.path)
    #[arg(long)]
    pub database: Option<PathBuf>,
    /// What to do when a batch repeats a key with differing values
    #[arg(long, value_enum)]
    pub on_duplicate: Option<DuplicateChoice>,
    /// How stations already in the store are treated
    #[arg(long, value_enum)]
    pub station_policy: Option<StationChoice>,
}

#[derive(Debug, Args, Default)]
pub struct CheckArgs {
    /// Directory holding the source workbooks (overrides source.data_dir)
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
#[value(rename_all = "kebab-case")]
pub enum DuplicateChoice {
    Prompt,
    KeepFirst,
    Abort,
}

impl From<DuplicateChoice> for DuplicatePolicy {
    fn from(choice: DuplicateChoice) -> Self {
        match choice {
            DuplicateChoice::Prompt => DuplicatePolicy::Prompt,
            DuplicateChoice::KeepFirst => DuplicatePolicy::KeepFirst,
            DuplicateChoice::Abort => DuplicatePolicy::Abort,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
#[value(rename_all = "kebab-case")]
pub enum StationChoice {
    AppendOnly,
    Upsert,
}

impl From<StationChoice> for StationPolicy {
    fn from(choice: StationChoice) -> Self {
        match choice {
            StationChoice::AppendOnly => StationPolicy::AppendOnly,
            StationChoice::Upsert => StationPolicy::Upsert,
        }
    }
}

impl SyncArgs {
    /// Fold command-line overrides into a loaded config.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(dir) = &self.data_dir {
            config.source.data_dir = dir.clone();
        }
        if let Some(path) = &self.database {
            config.database.path = path.clone();
        }
        if let Some(choice) = self.on_duplicate {
            config.sync.on_duplicate = choice.into();
        }
        if let Some(choice) = self.station_policy {
            config.sync.station_policy = choice.into();
        }
    }
}

impl CheckArgs {
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(dir) = &self.data_dir {
            config.source.data_dir = dir.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_overrides() {
        let cli = Cli::try_parse_from([
            "wq-sync",
            "--config",
            "other.yaml",
            "sync",
            "--data-dir",
            "/tmp/cruises",
            "--on-duplicate",
            "keep-first",
            "--station-policy",
            "upsert",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("other.yaml"));

        let Commands::Sync(args) = cli.command else {
            panic!("expected sync");
        };
        let mut config = Config::from_yaml(
            "database:\n  path: WQ.sqlite\nsource:\n  data_dir: data\n",
        )
        .unwrap();
        args.apply_to(&mut config);

        assert_eq!(config.source.data_dir, PathBuf::from("/tmp/cruises"));
        assert_eq!(config.sync.on_duplicate, DuplicatePolicy::KeepFirst);
        assert_eq!(config.sync.station_policy, StationPolicy::Upsert);
        assert_eq!(config.database.path, PathBuf::from("WQ.sqlite"));
    }

    #[test]
    fn test_check_defaults_config_path() {
        let cli = Cli::try_parse_from(["wq-sync", "check"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("config/config.yaml"));
        assert!(matches!(cli.command, Commands::Check(CheckArgs { data_dir: None })));
    }

    #[test]
    fn test_rejects_unknown_duplicate_choice() {
        assert!(Cli::try_parse_from(["wq-sync", "sync", "--on-duplicate", "merge"]).is_err());
    }
}
