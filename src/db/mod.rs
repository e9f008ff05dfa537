use anyhow::{Context, Result};
use std::path::Path;
use tokio_rusqlite::Connection;

pub mod records;

/// Open (creating if needed) the record store at `path` and apply the schema.
pub async fn init(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .await
        .with_context(|| format!("Failed to open record store {}", path.display()))?;
    apply_schema(&conn).await?;
    Ok(conn)
}

/// In-memory store, for tests and dry runs.
pub async fn init_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().await?;
    apply_schema(&conn).await?;
    Ok(conn)
}

async fn apply_schema(conn: &Connection) -> Result<()> {
    conn.call(|conn| {
        // WAL keeps readers off the writer's back while several workers record
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;

        Ok::<(), tokio_rusqlite::rusqlite::Error>(())
    })
    .await?;

    Ok(())
}
