//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Current schema version recorded in `schema_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Create the schema if needed and record its version.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS speed_tests (
            id INTEGER PRIMARY KEY,
            created_at TEXT NOT NULL,
            download_mbps REAL NOT NULL,
            upload_mbps REAL NOT NULL,
            ping_ms REAL NOT NULL,
            jitter_ms REAL,
            packet_loss_pct REAL,
            endpoint_id INTEGER NOT NULL,
            endpoint_name TEXT NOT NULL,
            endpoint_location TEXT,
            isp TEXT,
            external_ip TEXT,
            result_url TEXT,
            selection TEXT NOT NULL,
            ping_low_ms REAL,
            ping_high_ms REAL,
            download_latency_iqm_ms REAL,
            download_latency_low_ms REAL,
            download_latency_high_ms REAL,
            download_jitter_ms REAL,
            upload_latency_iqm_ms REAL,
            upload_latency_low_ms REAL,
            upload_latency_high_ms REAL,
            upload_jitter_ms REAL,
            download_bytes INTEGER,
            upload_bytes INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_speed_tests_created ON speed_tests(created_at);
        CREATE INDEX IF NOT EXISTS idx_speed_tests_endpoint ON speed_tests(endpoint_id);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}
