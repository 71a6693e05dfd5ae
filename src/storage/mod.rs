//! SQLite storage layer -- measurement records, schema, migrations.

pub mod schema;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};

use crate::throughput::{LoadedLatency, SpeedTestResult, TransferDetail, TrialError};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// One completed measurement cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub timestamp: DateTime<Utc>,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub ping_ms: f64,
    pub jitter_ms: Option<f64>,
    pub packet_loss_pct: Option<f64>,
    pub endpoint_id: u32,
    pub endpoint_name: String,
    pub endpoint_location: Option<String>,
    pub isp: Option<String>,
    pub external_ip: Option<String>,
    pub result_url: Option<String>,
    pub selection: String,
    pub detail: TransferDetail,
}

impl MeasurementRecord {
    /// Build a record from a provider result. Missing throughput or ping makes
    /// the result unusable as a measurement.
    pub fn from_result(result: &SpeedTestResult, selection: &str) -> Result<Self, TrialError> {
        let missing = |field: &str| TrialError::Malformed {
            reason: format!("result from endpoint {} has no {}", result.endpoint.id, field),
        };
        let trial = &result.trial;
        Ok(Self {
            timestamp: trial.timestamp,
            download_mbps: trial.download_mbps.ok_or_else(|| missing("download"))?,
            upload_mbps: trial.upload_mbps.ok_or_else(|| missing("upload"))?,
            ping_ms: trial.ping_ms.ok_or_else(|| missing("ping"))?,
            jitter_ms: trial.jitter_ms,
            packet_loss_pct: result.packet_loss_pct,
            endpoint_id: result.endpoint.id.0,
            endpoint_name: result.endpoint.name.clone(),
            endpoint_location: result.endpoint.display_location(),
            isp: result.isp.clone(),
            external_ip: result.external_ip.clone(),
            result_url: result.result_url.clone(),
            selection: selection.to_string(),
            detail: result.detail,
        })
    }
}

/// Append-only destination for completed measurements.
pub trait RecordSink: Send + Sync {
    fn append_record(&self, record: &MeasurementRecord) -> Result<()>;
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// [`RecordSink`] backed by the `speed_tests` table.
#[derive(Clone)]
pub struct SqliteRecordSink {
    pool: Pool,
}

impl SqliteRecordSink {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn open(path: &str) -> Result<Self> {
        Ok(Self::new(open_pool(path)?))
    }

    /// Most recent records, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<MeasurementRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT created_at, download_mbps, upload_mbps, ping_ms, jitter_ms, packet_loss_pct,
                    endpoint_id, endpoint_name, endpoint_location, isp, external_ip, result_url,
                    selection, ping_low_ms, ping_high_ms,
                    download_latency_iqm_ms, download_latency_low_ms, download_latency_high_ms,
                    download_jitter_ms,
                    upload_latency_iqm_ms, upload_latency_low_ms, upload_latency_high_ms,
                    upload_jitter_ms,
                    download_bytes, upload_bytes
             FROM speed_tests ORDER BY id DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map(rusqlite::params![limit as i64], |row| {
            let created_at: String = row.get(0)?;
            let timestamp = DateTime::parse_from_rfc3339(&created_at)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        0,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;
            Ok(MeasurementRecord {
                timestamp,
                download_mbps: row.get(1)?,
                upload_mbps: row.get(2)?,
                ping_ms: row.get(3)?,
                jitter_ms: row.get(4)?,
                packet_loss_pct: row.get(5)?,
                endpoint_id: row.get(6)?,
                endpoint_name: row.get(7)?,
                endpoint_location: row.get(8)?,
                isp: row.get(9)?,
                external_ip: row.get(10)?,
                result_url: row.get(11)?,
                selection: row.get(12)?,
                detail: TransferDetail {
                    ping_low_ms: row.get(13)?,
                    ping_high_ms: row.get(14)?,
                    download_latency: LoadedLatency {
                        iqm_ms: row.get(15)?,
                        low_ms: row.get(16)?,
                        high_ms: row.get(17)?,
                        jitter_ms: row.get(18)?,
                    },
                    upload_latency: LoadedLatency {
                        iqm_ms: row.get(19)?,
                        low_ms: row.get(20)?,
                        high_ms: row.get(21)?,
                        jitter_ms: row.get(22)?,
                    },
                    download_bytes: row.get::<_, Option<i64>>(23)?.map(|b| b as u64),
                    upload_bytes: row.get::<_, Option<i64>>(24)?.map(|b| b as u64),
                },
            })
        })?;

        let mut list = Vec::new();
        for r in rows {
            list.push(r?);
        }
        Ok(list)
    }
}

impl RecordSink for SqliteRecordSink {
    fn append_record(&self, m: &MeasurementRecord) -> Result<()> {
        let d = &m.detail;
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO speed_tests (created_at, download_mbps, upload_mbps, ping_ms, jitter_ms,
                packet_loss_pct, endpoint_id, endpoint_name, endpoint_location, isp, external_ip,
                result_url, selection, ping_low_ms, ping_high_ms,
                download_latency_iqm_ms, download_latency_low_ms, download_latency_high_ms,
                download_jitter_ms,
                upload_latency_iqm_ms, upload_latency_low_ms, upload_latency_high_ms,
                upload_jitter_ms,
                download_bytes, upload_bytes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)",
            rusqlite::params![
                m.timestamp.to_rfc3339(),
                m.download_mbps,
                m.upload_mbps,
                m.ping_ms,
                m.jitter_ms,
                m.packet_loss_pct,
                m.endpoint_id,
                m.endpoint_name,
                m.endpoint_location,
                m.isp,
                m.external_ip,
                m.result_url,
                m.selection,
                d.ping_low_ms,
                d.ping_high_ms,
                d.download_latency.iqm_ms,
                d.download_latency.low_ms,
                d.download_latency.high_ms,
                d.download_latency.jitter_ms,
                d.upload_latency.iqm_ms,
                d.upload_latency.low_ms,
                d.upload_latency.high_ms,
                d.upload_latency.jitter_ms,
                d.download_bytes.map(|b| b as i64),
                d.upload_bytes.map(|b| b as i64),
            ],
        )
        .context("Failed to insert speed test record")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throughput::{Endpoint, EndpointId, TrialResult};

    fn sample_result(download: Option<f64>) -> SpeedTestResult {
        SpeedTestResult {
            trial: TrialResult {
                endpoint_id: EndpointId(48238),
                download_mbps: download,
                upload_mbps: Some(20.0),
                ping_ms: Some(12.5),
                jitter_ms: Some(1.1),
                timestamp: "2024-05-01T12:00:00Z".parse().unwrap(),
            },
            endpoint: Endpoint {
                id: EndpointId(48238),
                name: "Example Net".to_string(),
                location: Some("Berlin".to_string()),
                country: Some("Germany".to_string()),
                distance_km: None,
            },
            isp: Some("Example ISP".to_string()),
            external_ip: Some("203.0.113.7".to_string()),
            packet_loss_pct: None,
            result_url: None,
            detail: TransferDetail::default(),
        }
    }

    #[test]
    fn test_record_from_result() {
        let rec = MeasurementRecord::from_result(&sample_result(Some(100.0)), "cached").unwrap();
        assert_eq!(rec.download_mbps, 100.0);
        assert_eq!(rec.endpoint_id, 48238);
        assert_eq!(rec.endpoint_location.as_deref(), Some("Berlin, Germany"));
        assert_eq!(rec.selection, "cached");
    }

    #[test]
    fn test_record_requires_throughput() {
        let err = MeasurementRecord::from_result(&sample_result(None), "cached").unwrap_err();
        assert!(matches!(err, TrialError::Malformed { .. }));
    }

    #[test]
    fn test_sqlite_sink_appends_and_reads_back() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = dir.path().join("data").join("speedwatch.db");
        let sink = SqliteRecordSink::open(db.to_str().unwrap()).unwrap();

        let mut loaded = sample_result(Some(90.0));
        loaded.detail = TransferDetail {
            ping_low_ms: Some(11.0),
            ping_high_ms: Some(14.5),
            download_latency: LoadedLatency {
                iqm_ms: Some(48.5),
                low_ms: Some(13.0),
                high_ms: Some(210.0),
                jitter_ms: Some(9.75),
            },
            upload_latency: LoadedLatency {
                iqm_ms: Some(31.0),
                ..LoadedLatency::default()
            },
            download_bytes: Some(150_000_000),
            upload_bytes: None,
        };
        let first = MeasurementRecord::from_result(&loaded, "cached").unwrap();
        let second =
            MeasurementRecord::from_result(&sample_result(Some(95.0)), "provider_default").unwrap();
        sink.append_record(&first).unwrap();
        sink.append_record(&second).unwrap();

        let recent = sink.recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0], second);
        assert_eq!(recent[1], first);
    }
}
