use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::{info, warn};

use crate::config::DbConfig;

/// Create a connection pool with sensible defaults.
pub async fn create_pool(config: &DbConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.url())
        .await
        .with_context(|| {
            format!(
                "failed to connect to database {} at {}:{}",
                config.db_name, config.host, config.port
            )
        })?;
    Ok(pool)
}

/// Connect, retrying up to `retry_threshold` additional times.
///
/// A busy server can refuse connections transiently (e.g. too many
/// clients while a batch of worker pools starts up), so each failure is
/// followed by a random 0-4 s sleep before the next attempt. The last
/// error is returned once the threshold is exceeded.
pub async fn connect_with_retry(config: &DbConfig, retry_threshold: u32) -> Result<PgPool> {
    let mut retries = 0;
    loop {
        match create_pool(config).await {
            Ok(pool) => return Ok(pool),
            Err(e) if retries < retry_threshold => {
                retries += 1;
                let backoff = {
                    let mut rng = rand::rng();
                    Duration::from_secs_f64(rng.random::<f64>() * 4.0)
                };
                warn!(
                    retry = retries,
                    max = retry_threshold,
                    error = %e,
                    "connect failed, retrying after {:.1}s",
                    backoff.as_secs_f64()
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Run all pending migrations from the given directory against the pool.
///
/// Uses a runtime `Migrator` so that no running database is required at
/// compile time (unlike the `sqlx::migrate!()` macro).
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let migrations_dir = default_migrations_path();
    let migrator = sqlx::migrate::Migrator::new(migrations_dir)
        .await
        .with_context(|| {
            format!(
                "failed to load migrations from {}",
                migrations_dir.display()
            )
        })?;

    migrator
        .run(pool)
        .await
        .context("failed to run database migrations")?;

    info!("migrations applied successfully");
    Ok(())
}

/// Ensure the target database exists, creating it if necessary.
///
/// Connects to the `postgres` maintenance database and issues
/// `CREATE DATABASE <name>` when the target database is absent.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<()> {
    let db_name = &config.db_name;
    let maintenance_url = config.maintenance_url();

    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&maintenance_url)
        .await
        .with_context(|| {
            format!("failed to connect to maintenance database at {maintenance_url}")
        })?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(db_name)
            .fetch_one(&maint_pool)
            .await
            .context("failed to query pg_database")?;

    if exists {
        info!(db = db_name, "database already exists");
    } else {
        // Database names cannot be parameterised in CREATE DATABASE, so we
        // validate the name to avoid SQL injection, then use string
        // formatting.
        if !db_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            anyhow::bail!("database name {:?} contains invalid characters", db_name);
        }
        let stmt = format!("CREATE DATABASE {db_name}");
        maint_pool
            .execute(stmt.as_str())
            .await
            .with_context(|| format!("failed to create database {db_name}"))?;
        info!(db = db_name, "database created");
    }

    maint_pool.close().await;
    Ok(())
}

/// Cold-reset the database: delete every row from the EQSQL tables and
/// restart the task id sequence.
pub async fn reset_database(pool: &PgPool) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to begin reset")?;

    // Child tables first so the foreign keys on eq_task_id hold throughout.
    for table in [
        "eq_exp_id_tasks",
        "eq_task_tags",
        "emews_queue_out",
        "emews_queue_in",
        "eq_tasks",
    ] {
        let stmt = format!("DELETE FROM {table}");
        sqlx::query(&stmt)
            .execute(tx.as_mut())
            .await
            .with_context(|| format!("failed to clear {table}"))?;
    }

    sqlx::query("ALTER SEQUENCE emews_id_generator RESTART")
        .execute(tx.as_mut())
        .await
        .context("failed to restart task id sequence")?;

    tx.commit().await.context("failed to commit reset")?;
    info!("database reset");
    Ok(())
}

/// Return the row count for every user-defined table in the `public`
/// schema. Used by the CLI status view.
pub async fn table_counts(pool: &PgPool) -> Result<Vec<(String, i64)>> {
    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT tablename::text \
         FROM pg_tables \
         WHERE schemaname = 'public' \
         ORDER BY tablename",
    )
    .fetch_all(pool)
    .await
    .context("failed to list tables")?;

    let mut counts = Vec::with_capacity(tables.len());
    for (table_name,) in &tables {
        // Table names come from pg_tables so they are safe identifiers.
        let query = format!("SELECT COUNT(*) FROM {table_name}");
        let count: (i64,) = sqlx::query_as(&query)
            .fetch_one(pool)
            .await
            .with_context(|| format!("failed to count rows in {table_name}"))?;
        counts.push((table_name.clone(), count.0));
    }
    Ok(counts)
}

/// Return the default path to the migrations directory shipped with
/// `eqsql-db`.
///
/// At runtime this resolves relative to the `eqsql-db` crate's source
/// tree via the `CARGO_MANIFEST_DIR` compile-time env.
pub fn default_migrations_path() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
}
