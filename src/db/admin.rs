//! Administrative operations: create, drop and migrate databases.
//!
//! These are single-writer operations meant for provisioning and tests.
//! Nothing here guards create, drop and migrate against concurrent runs of
//! one another.

use crate::context::Context;
use crate::db::postgres::{PgConn, PgDb};
use crate::db::sqlite::SqliteDb;
use crate::db::url;
use crate::error::{DbError, DbResult};
use rand::Rng;
use sqlx::migrate::Migrator;
use std::future::Future;
use std::path::Path;
use tracing::{info, warn};

const SUFFIX_LEN: usize = 6;

/// Create database `name` on the server behind `admin_url`.
pub async fn create_database(ctx: &Context, admin_url: &str, name: &str) -> DbResult<()> {
    url::validate_identifier(name)?;

    let conn = PgConn::connect(ctx, admin_url).await?;
    let result = conn
        .execute_raw(ctx, &format!("CREATE DATABASE \"{}\" ENCODING 'UTF8'", name))
        .await;
    close_quietly(&conn).await;
    result?;

    info!(database = name, "Created database");
    Ok(())
}

/// Drop the database `database_url` points at, if it exists.
pub async fn drop_database(ctx: &Context, database_url: &str) -> DbResult<()> {
    let name = url::db_name(database_url)?;
    url::validate_identifier(&name)?;
    let admin_url = url::admin_url(database_url)?;

    let conn = PgConn::connect(ctx, &admin_url).await?;
    let result = conn
        .execute_raw(ctx, &format!("DROP DATABASE IF EXISTS \"{}\"", name))
        .await;
    close_quietly(&conn).await;
    result?;

    info!(database = %name, "Dropped database");
    Ok(())
}

/// Create `<prefix>_<6 random lowercase letters>` next to `database_url`,
/// run `migrate` on its URL and return that URL.
pub async fn generate_database<F, Fut>(
    ctx: &Context,
    database_url: &str,
    prefix: &str,
    migrate: F,
) -> DbResult<String>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = DbResult<()>>,
{
    let admin_url = url::admin_url(database_url)?;
    let name = format!("{}_{}", prefix, random_suffix(SUFFIX_LEN));

    create_database(ctx, &admin_url, &name).await?;
    let database_url = url::replace_db_in_url(database_url, &name)?;
    migrate(database_url.clone()).await?;
    Ok(database_url)
}

fn random_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
        .collect()
}

async fn close_quietly(conn: &PgConn) {
    if let Err(e) = conn.close().await {
        warn!(error = %e, "Failed to close admin connection");
    }
}

async fn load_migrator(dir: &Path) -> DbResult<Migrator> {
    Migrator::new(dir).await.map_err(|e| {
        DbError::migration(format!(
            "Unable to read migrations from {}: {}",
            dir.display(),
            e
        ))
    })
}

/// Apply every pending migration in `dir` to a PostgreSQL database.
///
/// Files follow `<version>_<name>.up.sql` / `<version>_<name>.down.sql`.
/// Nothing pending is success.
pub async fn migrate_postgres(ctx: &Context, database_url: &str, dir: &Path) -> DbResult<()> {
    let migrator = load_migrator(dir).await?;
    let db = PgDb::connect(ctx, database_url).await?;
    let result = ctx
        .run("migrate", async {
            migrator.run(db.pool()).await.map_err(DbError::from)
        })
        .await;
    db.close().await;
    result?;

    info!(
        database = %url::mask_password(database_url),
        migrations = migrator.iter().count(),
        "Database migrated"
    );
    Ok(())
}

/// Apply every pending migration in `dir` to a SQLite file.
pub async fn migrate_sqlite(ctx: &Context, path_or_url: &str, dir: &Path) -> DbResult<()> {
    let migrator = load_migrator(dir).await?;
    let db = SqliteDb::connect(ctx, path_or_url).await?;
    let result = ctx
        .run("migrate", async {
            migrator.run(db.pool()).await.map_err(DbError::from)
        })
        .await;
    db.close().await;
    result?;

    info!(
        path = db.path(),
        migrations = migrator.iter().count(),
        "Database migrated"
    );
    Ok(())
}
