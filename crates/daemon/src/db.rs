use preview_common::LeaseInfo;
use rusqlite::{Connection, Result, params};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::Duration;
use std::fs;

// The primary key is what keeps two supervisors from leasing the same port.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS leases (
    port INTEGER PRIMARY KEY,
    deck TEXT NOT NULL,
    allocated_at TEXT NOT NULL
);
"#;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize the database at the given path, creating the directory if needed.
pub fn init_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ok();
    }

    let conn = Connection::open(path)?;
    prepare(conn)
}

/// Private in-memory database, for tests and throwaway runs.
pub fn init_memory_db() -> Result<Connection> {
    prepare(Connection::open_in_memory()?)
}

fn prepare(conn: Connection) -> Result<Connection> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Get the default database path (~/.deck-preview/ports.db)
pub fn default_db_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".deck-preview")
        .join("ports.db")
}

/// All leased ports, ascending.
pub fn leased_ports(conn: &Connection) -> Result<Vec<u16>> {
    let mut stmt = conn.prepare("SELECT port FROM leases ORDER BY port ASC")?;
    let ports = stmt
        .query_map([], |row| row.get::<_, u16>(0))?
        .collect::<Result<Vec<_>>>()?;
    Ok(ports)
}

/// Load all leases, ascending by port.
pub fn load_leases(conn: &Connection) -> Result<Vec<LeaseInfo>> {
    let mut stmt = conn.prepare("SELECT port, deck, allocated_at FROM leases ORDER BY port ASC")?;

    let lease_iter = stmt.query_map([], |row| {
        let port: u16 = row.get(0)?;
        let deck: String = row.get(1)?;
        let allocated_at_str: String = row.get(2)?;

        let allocated_at = DateTime::parse_from_rfc3339(&allocated_at_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(LeaseInfo {
            port,
            deck,
            allocated_at,
        })
    })?;

    lease_iter.collect()
}

/// Insert a lease unless the port is already taken.
///
/// Returns `false` when another writer got there first.
pub fn insert_lease(conn: &Connection, lease: &LeaseInfo) -> Result<bool> {
    let rows = conn.execute(
        "INSERT OR IGNORE INTO leases (port, deck, allocated_at) VALUES (?1, ?2, ?3)",
        params![lease.port, lease.deck, lease.allocated_at.to_rfc3339()],
    )?;
    Ok(rows > 0)
}

/// Delete a lease from the database.
pub fn delete_lease(conn: &Connection, port: u16) -> Result<bool> {
    let rows = conn.execute("DELETE FROM leases WHERE port = ?1", params![port])?;
    Ok(rows > 0)
}
