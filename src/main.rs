use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use orderfeed::{server, storage, OrderStore, RelayConfig};

#[derive(Parser)]
#[command(name = "orderfeed")]
#[command(about = "Real-time order change relay: snapshot-then-live WebSocket fan-out", version)]
#[command(after_help = "Environment:
  PORT, DATABASE_PATH, SNAPSHOT_LIMIT, SNAPSHOT_TIMEOUT_MS, SESSION_QUEUE_CAPACITY,
  FEED_POLL_INTERVAL_MS, FEED_RETRY_BASE_MS, FEED_RETRY_MAX_MS, CHANGE_LOG_RETENTION,
  RUST_LOG, LOG_DIR

Values are also read from a .env file in the working directory.")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server (default)
    Serve {
        #[arg(short, long)]
        port: Option<u16>,

        /// SQLite database file
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Create the database and its schema
    Init {
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Load the sample orders
    Seed {
        #[arg(long)]
        db: Option<PathBuf>,

        /// Remove every existing order first
        #[arg(long)]
        reset: bool,
    },
}

fn init_tracing() -> Option<WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| "orderfeed=info,tower_http=info".into());

    let (file_layer, guard) = match std::env::var("LOG_DIR") {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "orderfeed.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter()))
        .with(file_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = RelayConfig::from_env()?;
    let _guard = init_tracing();

    let command = cli.command.unwrap_or(Commands::Serve { port: None, db: None });

    match command {
        Commands::Serve { port, db } => {
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(db) = db {
                config.database_path = db;
            }
            server::serve(config).await?;
        }

        Commands::Init { db } => {
            let path = db.unwrap_or(config.database_path);
            storage::init(&path).await?;
            println!(
                "{} Database ready at {}",
                "✓".green(),
                path.display().to_string().bright_white()
            );
        }

        Commands::Seed { db, reset } => {
            let path = db.unwrap_or(config.database_path);
            let store = OrderStore::new(storage::init(&path).await?);

            println!("{}", "Seeding orders".cyan().bold());
            let report = storage::seed(&store, reset).await?;

            if reset {
                println!("{} Cleared {} existing orders", "✓".green(), report.cleared);
            }
            for order in report.inserted.iter().chain(report.replaced.iter()) {
                println!(
                    "  {} {} - {} ({})",
                    order.id.bright_black(),
                    order.customer_name.bright_white(),
                    order.product_name,
                    order.status.as_str().yellow()
                );
            }
            println!(
                "{} {} inserted, {} replaced",
                "✓".green(),
                report.inserted.len(),
                report.replaced.len()
            );
        }
    }

    Ok(())
}
