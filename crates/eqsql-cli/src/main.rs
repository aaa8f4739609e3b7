mod config;
mod serve_cmd;
mod status_cmd;

use anyhow::Context;
use clap::{Parser, Subcommand};

use eqsql_db::pool;

#[derive(Parser)]
#[command(name = "eqsql", about = "PostgreSQL-backed task queues for HPC workflows")]
struct Cli {
    /// Database host (overrides config file and DB_HOST)
    #[arg(long, global = true)]
    db_host: Option<String>,

    /// Database port (overrides config file and DB_PORT)
    #[arg(long, global = true)]
    db_port: Option<u16>,

    /// Database user (overrides config file and DB_USER)
    #[arg(long, global = true)]
    db_user: Option<String>,

    /// Database name (overrides config file and DB_NAME)
    #[arg(long, global = true)]
    db_name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an eqsql config file (no database required)
    Init {
        /// Database host
        #[arg(long, default_value = "localhost")]
        host: String,
        /// Database port
        #[arg(long, default_value_t = 5432)]
        port: u16,
        /// Database user
        #[arg(long, default_value = "eqsql_user")]
        user: String,
        /// Database name
        #[arg(long, default_value = "EQ_SQL")]
        db: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the eqsql database (if needed) and apply the schema
    DbInit,
    /// Delete all task and queue rows and restart the id sequence
    DbReset,
    /// Create a local PostgreSQL cluster with initdb
    ClusterCreate {
        /// Filesystem path for the new cluster (must not exist)
        db_path: std::path::PathBuf,
        /// Directory containing the PostgreSQL executables
        #[arg(long)]
        pg_bin_path: Option<std::path::PathBuf>,
    },
    /// Start the server for a local PostgreSQL cluster
    ClusterStart {
        /// Filesystem path of the cluster
        db_path: std::path::PathBuf,
        /// Directory containing the PostgreSQL executables
        #[arg(long)]
        pg_bin_path: Option<std::path::PathBuf>,
        /// Port for the server to listen on
        #[arg(long)]
        port: Option<u16>,
    },
    /// Stop the server for a local PostgreSQL cluster
    ClusterStop {
        /// Filesystem path of the cluster
        db_path: std::path::PathBuf,
        /// Directory containing the PostgreSQL executables
        #[arg(long)]
        pg_bin_path: Option<std::path::PathBuf>,
    },
    /// Show table row counts and queue emptiness
    Status {
        /// Restrict the queue emptiness check to one task type
        #[arg(long)]
        eq_type: Option<i32>,
    },
    /// Run the RPC gateway
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port to listen on
        #[arg(long, default_value_t = 11218)]
        port: u16,
    },
}

/// Execute the `eqsql init` command: write the config file.
fn cmd_init(host: &str, port: u16, user: &str, db: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            host: host.to_owned(),
            port,
            user: user.to_owned(),
            password: None,
            db_name: db.to_owned(),
        },
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database = postgresql://{user}@{host}:{port}/{db}");
    println!();
    println!("Next: run `eqsql db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `eqsql db-init` command: create database and apply schema.
async fn cmd_db_init(db_config: &eqsql_db::config::DbConfig) -> anyhow::Result<()> {
    println!("Initializing eqsql database...");

    // 1. Create the database if it does not exist.
    pool::ensure_database_exists(db_config).await?;

    // 2. Connect and run migrations.
    let pg = pool::create_pool(db_config).await?;
    pool::run_migrations(&pg).await?;

    // 3. Report.
    let counts = pool::table_counts(&pg).await?;
    println!("Database ready with {} tables:", counts.len());
    for (table, count) in counts {
        println!("  {table:<20} {count:>8} rows");
    }
    pg.close().await;

    Ok(())
}

/// Execute the `eqsql db-reset` command.
async fn cmd_db_reset(db_config: &eqsql_db::config::DbConfig) -> anyhow::Result<()> {
    let pg = pool::create_pool(db_config).await?;
    pool::reset_database(&pg).await?;
    pg.close().await;
    println!("Database reset: all tasks deleted, id sequence restarted.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let db_config = config::resolve_db_config(
        cli.db_host.as_deref(),
        cli.db_port,
        cli.db_user.as_deref(),
        cli.db_name.as_deref(),
    );

    match cli.command {
        Commands::Init {
            host,
            port,
            user,
            db,
            force,
        } => cmd_init(&host, port, &user, &db, force),
        Commands::DbInit => cmd_db_init(&db_config).await,
        Commands::DbReset => cmd_db_reset(&db_config).await,
        Commands::ClusterCreate {
            db_path,
            pg_bin_path,
        } => {
            eqsql_db::cluster::create_cluster(&db_path, pg_bin_path.as_deref()).await?;
            println!("Cluster created at {}", db_path.display());
            Ok(())
        }
        Commands::ClusterStart {
            db_path,
            pg_bin_path,
            port,
        } => {
            eqsql_db::cluster::start_cluster(&db_path, pg_bin_path.as_deref(), port).await?;
            println!("Database server started (log: {}/db.log)", db_path.display());
            Ok(())
        }
        Commands::ClusterStop {
            db_path,
            pg_bin_path,
        } => {
            eqsql_db::cluster::stop_cluster(&db_path, pg_bin_path.as_deref()).await?;
            println!("Database server stopped.");
            Ok(())
        }
        Commands::Status { eq_type } => {
            let pg = pool::create_pool(&db_config)
                .await
                .context("failed to connect; did you run `eqsql db-init`?")?;
            let result = status_cmd::run_status(&pg, eq_type).await;
            pg.close().await;
            result
        }
        Commands::Serve { bind, port } => serve_cmd::run_serve(&bind, port).await,
    }
}
