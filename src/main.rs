//! txscope - Main entry point.
//!
//! Operational commands over one database: liveness check, migrations,
//! database provisioning and advisory lock probing.

use clap::Parser;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use txscope::config::{Command, Config, DatabaseConfig};
use txscope::db::{admin, url};
use txscope::models::DatabaseType;
use txscope::{Context, DbError, DbResult, PgDb, SqliteDb};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    init_tracing(&config);

    let db_config = config.parse_database()?;
    info!(
        command = %config.command,
        backend = %db_config.db_type,
        "Starting txscope v{}",
        env!("CARGO_PKG_VERSION")
    );

    let ctx = Context::background();
    if let Err(e) = run(&ctx, &config, &db_config).await {
        error!(error = %e, suggestion = ?e.suggestion(), "Command failed");
        return Err(e.into());
    }
    Ok(())
}

async fn run(ctx: &Context, config: &Config, db_config: &DatabaseConfig) -> DbResult<()> {
    let connect_ctx = ctx.with_timeout(config.connect_timeout_duration());
    let database_url = db_config.connection_string.as_str();

    match (&config.command, db_config.db_type) {
        (Command::Ping, DatabaseType::PostgreSQL) => {
            let db = PgDb::connect_with(&connect_ctx, db_config).await?;
            db.close().await;
            println!("ok");
        }
        (Command::Ping, DatabaseType::SQLite) => {
            let db = SqliteDb::connect_with(&connect_ctx, db_config).await?;
            db.close().await;
            println!("ok");
        }
        (Command::Migrate { dir }, DatabaseType::PostgreSQL) => {
            admin::migrate_postgres(ctx, database_url, dir).await?;
        }
        (Command::Migrate { dir }, DatabaseType::SQLite) => {
            admin::migrate_sqlite(ctx, database_url, dir).await?;
        }
        (Command::CreateDb { name }, DatabaseType::PostgreSQL) => {
            admin::create_database(ctx, &url::admin_url(database_url)?, name).await?;
            println!("{}", url::mask_password(&url::replace_db_in_url(database_url, name)?));
        }
        (Command::DropDb, DatabaseType::PostgreSQL) => {
            admin::drop_database(ctx, database_url).await?;
        }
        (Command::CreateDb { .. } | Command::DropDb, DatabaseType::SQLite) => {
            return Err(DbError::invalid_input(format!(
                "{} requires a PostgreSQL database",
                config.command
            )));
        }
        (Command::Lock { id, hold_secs }, DatabaseType::PostgreSQL) => {
            let db = PgDb::connect_with(&connect_ctx, db_config).await?;
            let hold = Duration::from_secs(*hold_secs);
            let result = db
                .with_lock(ctx, *id, |_| async move {
                    info!(lock_id = *id, hold_secs = hold.as_secs(), "Holding advisory lock");
                    tokio::time::sleep(hold).await;
                    Ok::<_, DbError>(())
                })
                .await;
            db.close().await;

            match result {
                Ok(()) => println!("lock {} acquired and released", id),
                Err(e) if e.is_lock_failed() => println!("lock {} is held elsewhere", id),
                Err(e) => return Err(e),
            }
        }
        (Command::Lock { id, .. }, DatabaseType::SQLite) => {
            let db = SqliteDb::connect_with(&connect_ctx, db_config).await?;
            let result = db
                .with_lock(ctx, *id, |_| async { Ok::<_, DbError>(()) })
                .await;
            db.close().await;
            result?;
        }
    }
    Ok(())
}
