//! Database management for fleet configuration
//!
//! Uses SQLite to persist sources, studios and each studio's bound source so
//! sessions can be restored after a restart

use crate::assignment::StudioProfile;
use crate::sources::{CodecParams, Source};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Lock error")]
    LockError,
}

/// A studio row with its persisted binding
#[derive(Debug, Clone, PartialEq)]
pub struct StoredStudio {
    pub profile: StudioProfile,
    pub bound_source_id: Option<String>,
}

/// Database connection wrapper
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    /// Initialize database tables
    fn init(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockError)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sources (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                multicast_address TEXT NOT NULL,
                port INTEGER NOT NULL DEFAULT 5004,
                sample_rate INTEGER NOT NULL DEFAULT 48000,
                channels INTEGER NOT NULL DEFAULT 2,
                payload_type INTEGER NOT NULL DEFAULT 96,
                samples_per_packet INTEGER NOT NULL DEFAULT 48,
                description TEXT,
                enabled INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS studios (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                color TEXT NOT NULL DEFAULT '#2196F3',
                bound_source_id TEXT
            );",
        )?;
        Ok(())
    }

    /// Insert or replace a source
    pub fn save_source(&self, source: &Source) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockError)?;
        conn.execute(
            "INSERT OR REPLACE INTO sources
             (id, name, multicast_address, port, sample_rate, channels,
              payload_type, samples_per_packet, description, enabled)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                source.id,
                source.name,
                source.multicast_address.to_string(),
                source.port,
                source.codec.sample_rate,
                source.codec.channels,
                source.codec.payload_type,
                source.codec.samples_per_packet,
                source.description,
                source.enabled,
            ],
        )?;
        Ok(())
    }

    pub fn delete_source(&self, id: &str) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockError)?;
        conn.execute("DELETE FROM sources WHERE id = ?", [id])?;
        Ok(())
    }

    pub fn load_sources(&self) -> Result<Vec<Source>, DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockError)?;
        let mut stmt = conn.prepare(
            "SELECT id, name, multicast_address, port, sample_rate, channels,
                    payload_type, samples_per_packet, description, enabled
             FROM sources ORDER BY name",
        )?;
        let sources = stmt
            .query_map([], source_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sources)
    }

    /// Insert or update a studio's profile, leaving its binding untouched
    pub fn save_studio(&self, profile: &StudioProfile) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockError)?;
        conn.execute(
            "INSERT INTO studios (id, name, description, color)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                color = excluded.color",
            params![profile.id, profile.name, profile.description, profile.color],
        )?;
        Ok(())
    }

    pub fn delete_studio(&self, id: &str) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockError)?;
        conn.execute("DELETE FROM studios WHERE id = ?", [id])?;
        Ok(())
    }

    /// Record which source a studio is bound to (`None` when unbound)
    pub fn set_studio_binding(
        &self,
        studio_id: &str,
        source_id: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockError)?;
        conn.execute(
            "UPDATE studios SET bound_source_id = ? WHERE id = ?",
            params![source_id, studio_id],
        )?;
        Ok(())
    }

    pub fn load_studios(&self) -> Result<Vec<StoredStudio>, DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockError)?;
        let mut stmt = conn.prepare(
            "SELECT id, name, description, color, bound_source_id FROM studios ORDER BY name",
        )?;
        let studios = stmt
            .query_map([], |row| {
                Ok(StoredStudio {
                    profile: StudioProfile {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                        color: row.get(3)?,
                    },
                    bound_source_id: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(studios)
    }
}

fn source_from_row(row: &Row<'_>) -> rusqlite::Result<Source> {
    let address: String = row.get(2)?;
    let multicast_address: IpAddr = address
        .parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;

    Ok(Source {
        id: row.get(0)?,
        name: row.get(1)?,
        multicast_address,
        port: row.get(3)?,
        codec: CodecParams {
            sample_rate: row.get(4)?,
            channels: row.get(5)?,
            payload_type: row.get(6)?,
            samples_per_packet: row.get(7)?,
        },
        description: row.get(8)?,
        enabled: row.get(9)?,
    })
}
