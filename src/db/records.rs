//! Append-only `file_records` table backing the dedup index.
//!
//! Paths are stored as raw bytes so non-UTF-8 names from foreign
//! filesystems survive the round trip.

use anyhow::Result;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tokio_rusqlite::{Connection, params, rusqlite};
use uuid::Uuid;

use crate::core::FileRecord;
use crate::core::hasher::Digest;

pub async fn insert(conn: &Connection, record: FileRecord) -> Result<()> {
    conn.call(move |c| {
        let id = Uuid::now_v7().to_string();
        c.execute(
            "INSERT INTO file_records (id, digest, backup_timestamp, source_path, destination_path)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                record.digest.to_hex(),
                record.backup_timestamp,
                path_bytes(&record.source_path),
                path_bytes(&record.destination_path),
            ],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

/// Destinations recorded for `digest`, oldest first.
pub async fn destinations_for(conn: &Connection, digest: Digest) -> Result<Vec<PathBuf>> {
    let rows = conn
        .call(move |c| {
            let mut stmt = c.prepare(
                "SELECT destination_path FROM file_records
                 WHERE digest = ?1
                 ORDER BY rowid ASC",
            )?;
            let rows = stmt
                .query_map(params![digest.to_hex()], |row| row.get::<_, Vec<u8>>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, rusqlite::Error>(rows)
        })
        .await?;

    Ok(rows.into_iter().map(path_from_bytes).collect())
}

/// All records written by one backup run.
pub async fn for_timestamp(conn: &Connection, timestamp: String) -> Result<Vec<FileRecord>> {
    let rows = conn
        .call(move |c| {
            let mut stmt = c.prepare(
                "SELECT digest, backup_timestamp, source_path, destination_path
                 FROM file_records
                 WHERE backup_timestamp = ?1
                 ORDER BY rowid ASC",
            )?;
            let rows = stmt
                .query_map(params![timestamp], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, rusqlite::Error>(rows)
        })
        .await?;

    let mut records = Vec::with_capacity(rows.len());
    for (digest, backup_timestamp, source, destination) in rows {
        let digest = Digest::from_hex(&digest)
            .ok_or_else(|| anyhow::anyhow!("Corrupt digest in record store: {}", digest))?;
        records.push(FileRecord {
            digest,
            backup_timestamp,
            source_path: path_from_bytes(source),
            destination_path: path_from_bytes(destination),
        });
    }
    Ok(records)
}

pub async fn count(conn: &Connection) -> Result<u64> {
    let n = conn
        .call(|c| {
            c.query_row("SELECT COUNT(*) FROM file_records", [], |row| {
                row.get::<_, i64>(0)
            })
        })
        .await?;
    Ok(n as u64)
}

fn path_bytes(path: &Path) -> Vec<u8> {
    path.as_os_str().as_bytes().to_vec()
}

fn path_from_bytes(bytes: Vec<u8>) -> PathBuf {
    PathBuf::from(OsStr::from_bytes(&bytes))
}
