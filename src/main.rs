use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wq_sync::cli::{Cli, Commands};
use wq_sync::config::Config;
use wq_sync::db::Repository;
use wq_sync::guard::resolver_for;
use wq_sync::sync::{check_sources, Syncer};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,wq_sync=debug,sqlx=warn")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::load(&cli.config).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration: {}\n\n\
             Make sure:\n\
             1. {} exists (or pass --config)\n\
             2. All referenced environment variables are set\n\
             3. Create a .env file if needed",
            e,
            cli.config.display()
        )
    })?;
    info!("Configuration loaded from {}", cli.config.display());

    match cli.command {
        Commands::Check(args) => {
            args.apply_to(&mut config);
            let report = check_sources(&config)?;
            for consistency in &report.consistency {
                print!("{}", consistency);
            }
            for failure in &report.failures {
                println!("Unreadable: {} ({})", failure.location, failure.reason);
            }
            for listing in &report.conflict_listings {
                println!("{}", listing);
            }
            if !report.is_clean() {
                anyhow::bail!("Source check found problems in {} workbooks", report.files);
            }
            info!("Source check passed for {} workbooks", report.files);
        }
        Commands::Sync(args) => {
            args.apply_to(&mut config);

            let repository = Repository::connect(
                &config.database.path,
                config.database.max_connections,
                config.sync.codec(),
            )
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to open database {}: {}\n\n\
                     Common fixes:\n\
                     1. Check the parent directory exists and is writable\n\
                     2. Make sure no other process holds a lock on the file",
                    config.database.path.display(),
                    e
                )
            })?;
            info!("Opened store {}", config.database.path.display());

            let syncer = Syncer::new(repository, config.sync.station_policy.into())
                .with_identical_collapse(config.sync.collapse_identical_duplicates);
            let mut resolver = resolver_for(config.sync.on_duplicate);
            syncer.run(&config, resolver.as_mut()).await?;
        }
    }

    Ok(())
}
