//! `sensord` — runs the sensor task scheduler and manages its entries.
//!
//! Usage:
//!   sensord run                                   # run until Ctrl-C
//!   sensord add --name scan --action logger --interval 60
//!   sensord list | cancel NAME | remove NAME | results NAME

use std::sync::Arc;

use clap::{Parser, Subcommand};
use sensord_core::SensordConfig;
use sensord_scheduler::{ActionRegistry, HttpNotifier, Scheduler, SqliteStore, SystemClock};
use tracing::{info, warn};

mod commands;

#[derive(Parser)]
#[command(name = "sensord", version, about = "Sensor task scheduler")]
struct Cli {
    /// Config file (default: $SENSORD_CONFIG, then ~/.sensord/sensord.toml)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until interrupted
    Run,
    /// Validate and add a schedule entry
    Add(commands::AddArgs),
    /// Print every schedule entry as a JSON line
    List,
    /// Deactivate an entry without deleting it
    Cancel { name: String },
    /// Delete an entry and its results
    Remove { name: String },
    /// Print stored task results of an entry, newest first
    Results {
        name: String,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sensord=info,sensord_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > SENSORD_CONFIG env > ~/.sensord/sensord.toml
    let config_path = cli.config.or_else(|| std::env::var("SENSORD_CONFIG").ok());
    let config = SensordConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        SensordConfig::default()
    });

    config.database.ensure_parent_dir()?;
    info!(path = %config.database.path, "opening SQLite database");
    let db = rusqlite::Connection::open(&config.database.path)?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;
    let store = SqliteStore::new(db)?;

    match cli.command {
        Command::Run => run_scheduler(config, store).await,
        Command::Add(args) => commands::add(&store, args),
        Command::List => commands::list(&store),
        Command::Cancel { name } => commands::cancel(&store, &name),
        Command::Remove { name } => commands::remove(&store, &name),
        Command::Results { name, limit } => commands::results(&store, &name, limit),
    }
}

async fn run_scheduler(config: SensordConfig, store: SqliteStore) -> anyhow::Result<()> {
    let actions = ActionRegistry::with_builtins();
    info!(actions = ?actions.names(), "actions registered");

    let notifier = Arc::new(HttpNotifier::new(&config.callback)?);
    let scheduler = Scheduler::new(Arc::new(store), Arc::new(actions), Arc::new(SystemClock))
        .with_config(config.scheduler.clone())
        .with_notifier(notifier, &config.callback);
    let handle = scheduler.handle();

    let mut task = tokio::spawn(scheduler.run());
    tokio::select! {
        finished = &mut task => {
            // only a fatal error or the failure breaker ends the loop on its own
            finished??;
            anyhow::bail!("scheduler stopped itself after repeated task failures");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested, finishing in-flight tasks");
            handle.stop();
        }
    }

    task.await??;
    info!("scheduler stopped");
    Ok(())
}
