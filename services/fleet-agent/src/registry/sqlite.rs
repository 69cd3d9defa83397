//! SQLite-backed tenant registry.
//!
//! Queries are single-row lookups on an indexed table, so they run inline on
//! the calling task under a mutex rather than on the blocking pool.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use fleet_id::TenantId;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{RegistryError, TenantRegistry};

/// SQLite tenant registry.
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
}

impl SqliteRegistry {
    /// Open or create a registry at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let registry = Self {
            conn: Mutex::new(conn),
        };
        registry.init_schema()?;

        Ok(registry)
    }

    /// Open an in-memory registry (for testing).
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory()?;
        let registry = Self {
            conn: Mutex::new(conn),
        };
        registry.init_schema()?;
        Ok(registry)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init_schema(&self) -> Result<(), RegistryError> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tenants (
                tenant_id TEXT PRIMARY KEY,
                port INTEGER NOT NULL UNIQUE,
                created_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("Registry schema initialized");
        Ok(())
    }
}

fn port_from_row(value: i64) -> Result<u16, RegistryError> {
    u16::try_from(value).map_err(|_| RegistryError::Invalid(format!("port {value} out of range")))
}

#[async_trait]
impl TenantRegistry for SqliteRegistry {
    async fn get_port(&self, tenant: &TenantId) -> Result<Option<u16>, RegistryError> {
        let port: Option<i64> = self
            .conn()
            .query_row(
                "SELECT port FROM tenants WHERE tenant_id = ?1",
                params![tenant.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        port.map(port_from_row).transpose()
    }

    async fn set_port(&self, tenant: &TenantId, port: u16) -> Result<(), RegistryError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT port FROM tenants WHERE tenant_id = ?1",
                params![tenant.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(existing) = existing {
            let existing = port_from_row(existing)?;
            if existing == port {
                return Ok(());
            }
            return Err(RegistryError::AlreadyAssigned {
                tenant: tenant.clone(),
                existing,
            });
        }

        let owner: Option<String> = tx
            .query_row(
                "SELECT tenant_id FROM tenants WHERE port = ?1",
                params![port],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(owner) = owner {
            return Err(RegistryError::PortTaken {
                port,
                owner: TenantId::parse(&owner)?,
            });
        }

        tx.execute(
            "INSERT INTO tenants (tenant_id, port, created_at) VALUES (?1, ?2, ?3)",
            params![tenant.as_str(), port, chrono::Utc::now().timestamp()],
        )?;
        tx.commit()?;

        debug!(tenant = %tenant, port, "Port assignment persisted");
        Ok(())
    }

    async fn all_tenants(&self) -> Result<Vec<TenantId>, RegistryError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT tenant_id FROM tenants ORDER BY created_at, rowid")?;

        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        ids.iter()
            .map(|id| TenantId::parse(id).map_err(Into::into))
            .collect()
    }

    async fn all_ports(&self) -> Result<Vec<u16>, RegistryError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT port FROM tenants ORDER BY port")?;

        let ports = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        ports.into_iter().map(port_from_row).collect()
    }
}
