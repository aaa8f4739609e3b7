//! Local PostgreSQL cluster management through `initdb` and `pg_ctl`.
//!
//! Useful on HPC login nodes where the database server is a per-experiment
//! process owned by the user rather than a managed service.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::info;

/// Resolve a PostgreSQL executable: `<pg_bin_path>/<name>`, or bare `name`
/// to be found on `$PATH` when no bin directory is given.
fn pg_executable(pg_bin_path: Option<&Path>, name: &str) -> PathBuf {
    match pg_bin_path {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}

async fn run_pg_command(mut cmd: Command, what: &str) -> Result<String> {
    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to run {what}"))?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        bail!(
            "{what} failed with {}: {}{}",
            output.status,
            stdout,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(stdout)
}

/// Create a new database cluster at `db_path` with `initdb`.
///
/// The path must not already exist.
pub async fn create_cluster(db_path: &Path, pg_bin_path: Option<&Path>) -> Result<()> {
    let initdb = pg_executable(pg_bin_path, "initdb");
    let mut cmd = Command::new(&initdb);
    cmd.arg("-D").arg(db_path);
    run_pg_command(cmd, "initdb").await?;
    info!(path = %db_path.display(), "database cluster created");
    Ok(())
}

/// Start the database server for the cluster at `db_path`.
///
/// The server log goes to `<db_path>/db.log`. An explicit `port` overrides
/// the cluster default.
pub async fn start_cluster(
    db_path: &Path,
    pg_bin_path: Option<&Path>,
    port: Option<u16>,
) -> Result<()> {
    if is_cluster_running(db_path, pg_bin_path).await? {
        bail!("database server is already running for {}", db_path.display());
    }

    let pg_ctl = pg_executable(pg_bin_path, "pg_ctl");
    let log_file = db_path.join("db.log");
    let mut cmd = Command::new(&pg_ctl);
    cmd.arg("-D").arg(db_path).arg("-l").arg(&log_file);
    match port {
        Some(port) => cmd.arg("-o").arg(format!("-F -p {port}")),
        None => cmd.arg("-o").arg("-F"),
    };
    cmd.arg("start");
    run_pg_command(cmd, "pg_ctl start").await?;
    info!(path = %db_path.display(), log = %log_file.display(), "database server started");
    Ok(())
}

/// Stop the database server for the cluster at `db_path`.
pub async fn stop_cluster(db_path: &Path, pg_bin_path: Option<&Path>) -> Result<()> {
    if !is_cluster_running(db_path, pg_bin_path).await? {
        bail!("database server is not running for {}", db_path.display());
    }

    let pg_ctl = pg_executable(pg_bin_path, "pg_ctl");
    let mut cmd = Command::new(&pg_ctl);
    cmd.arg("-D").arg(db_path).arg("stop");
    run_pg_command(cmd, "pg_ctl stop").await?;
    info!(path = %db_path.display(), "database server stopped");
    Ok(())
}

/// Whether a database server is running for the cluster at `db_path`.
///
/// `pg_ctl status` exits with 3 when no server is running; any other
/// non-zero exit is an error.
pub async fn is_cluster_running(db_path: &Path, pg_bin_path: Option<&Path>) -> Result<bool> {
    let pg_ctl = pg_executable(pg_bin_path, "pg_ctl");
    let output = Command::new(&pg_ctl)
        .arg("-D")
        .arg(db_path)
        .arg("status")
        .output()
        .await
        .with_context(|| format!("failed to run {}", pg_ctl.display()))?;

    if output.status.success() {
        return Ok(true);
    }
    if output.status.code() == Some(3) {
        return Ok(false);
    }
    bail!(
        "pg_ctl status failed with {}: {}",
        output.status,
        String::from_utf8_lossy(&output.stdout)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executable_resolution() {
        assert_eq!(
            pg_executable(Some(Path::new("/opt/pg/bin")), "pg_ctl"),
            PathBuf::from("/opt/pg/bin/pg_ctl")
        );
        assert_eq!(pg_executable(None, "initdb"), PathBuf::from("initdb"));
    }
}
