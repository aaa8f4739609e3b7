//! The `eqsql status` command: table row counts and queue emptiness.

use anyhow::Result;
use sqlx::PgPool;

use eqsql_db::pool;
use eqsql_db::queries::queue;

pub async fn run_status(pg: &PgPool, eq_type: Option<i32>) -> Result<()> {
    let counts = pool::table_counts(pg).await?;

    println!("Tables:");
    for (table, count) in &counts {
        println!("  {table:<20} {count:>8} rows");
    }

    let empty = queue::are_queues_empty(pg, eq_type).await?;
    match eq_type {
        Some(eq_type) => {
            println!("Queues empty (type {eq_type}): {empty}");
        }
        None => {
            println!("Queues empty: {empty}");
        }
    }

    Ok(())
}
