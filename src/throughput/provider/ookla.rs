//! Ookla Speedtest CLI adapter.
//!
//! Runs `speedtest --format=json` and `speedtest --servers --format=json`
//! and maps their output onto the provider traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{EndpointDirectory, MeasurementPort};
use crate::throughput::{
    bytes_per_sec_to_mbps, Endpoint, EndpointId, LoadedLatency, SpeedTestResult, TrialError,
    TrialResult, TransferDetail,
};

pub struct OoklaProvider {
    path: String,
    accept_license: bool,
}

impl OoklaProvider {
    pub fn new(path: impl Into<String>, accept_license: bool) -> Self {
        Self {
            path: path.into(),
            accept_license,
        }
    }

    /// Version string of the installed CLI, or `None` if it cannot be run.
    pub async fn version(&self) -> Option<String> {
        let output = tokio::process::Command::new(&self.path)
            .arg("--version")
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout);
        text.lines().next().map(|l| l.trim().to_string())
    }

    fn license_args(&self) -> &'static [&'static str] {
        if self.accept_license {
            &["--accept-license", "--accept-gdpr"]
        } else {
            &[]
        }
    }

    async fn invoke(&self, args: &[String]) -> Result<std::process::Output, TrialError> {
        debug!(path = %self.path, ?args, "spawning speedtest");
        tokio::process::Command::new(&self.path)
            .args(args)
            .args(self.license_args())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| TrialError::Launch {
                reason: format!("{}: {}", self.path, e),
            })
    }
}

#[async_trait]
impl MeasurementPort for OoklaProvider {
    async fn run_trial(&self, endpoint: Option<EndpointId>) -> Result<SpeedTestResult, TrialError> {
        let mut args = vec!["--format=json".to_string()];
        if let Some(id) = endpoint {
            args.push(format!("--server-id={}", id));
        }

        let output = self.invoke(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&stderr, endpoint));
        }

        parse_result(&String::from_utf8_lossy(&output.stdout))
    }
}

#[async_trait]
impl EndpointDirectory for OoklaProvider {
    async fn list_candidates(&self, limit: usize) -> Result<Vec<Endpoint>, TrialError> {
        let args = vec!["--servers".to_string(), "--format=json".to_string()];
        let output = self.invoke(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&stderr, None));
        }

        let mut servers = parse_server_list(&String::from_utf8_lossy(&output.stdout))?;
        servers.truncate(limit);
        Ok(servers)
    }
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawResult {
    timestamp: Option<String>,
    ping: Option<RawPing>,
    download: Option<RawTransfer>,
    upload: Option<RawTransfer>,
    #[serde(rename = "packetLoss")]
    packet_loss: Option<f64>,
    isp: Option<String>,
    interface: Option<RawInterface>,
    server: Option<RawServer>,
    result: Option<RawLink>,
}

#[derive(Debug, Deserialize)]
struct RawPing {
    latency: Option<f64>,
    jitter: Option<f64>,
    low: Option<f64>,
    high: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawTransfer {
    bandwidth: Option<f64>,
    bytes: Option<u64>,
    latency: Option<RawLoadedLatency>,
}

#[derive(Debug, Deserialize)]
struct RawLoadedLatency {
    iqm: Option<f64>,
    low: Option<f64>,
    high: Option<f64>,
    jitter: Option<f64>,
}

impl RawTransfer {
    fn loaded_latency(&self) -> LoadedLatency {
        self.latency
            .as_ref()
            .map(|l| LoadedLatency {
                iqm_ms: l.iqm,
                low_ms: l.low,
                high_ms: l.high,
                jitter_ms: l.jitter,
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct RawInterface {
    #[serde(rename = "externalIp")]
    external_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawLink {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    id: Option<RawId>,
    name: Option<String>,
    location: Option<String>,
    country: Option<String>,
    distance: Option<f64>,
}

/// Server ids arrive as numbers from some CLI versions and strings from others.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawId {
    Num(u64),
    Text(String),
}

impl RawId {
    fn to_endpoint_id(&self) -> Option<EndpointId> {
        match self {
            RawId::Num(n) => u32::try_from(*n).ok().filter(|n| *n > 0).map(EndpointId),
            RawId::Text(s) => s.parse().ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawServerList {
    #[serde(default)]
    servers: Vec<RawServer>,
}

impl RawServer {
    fn into_endpoint(self) -> Option<Endpoint> {
        let id = self.id.as_ref()?.to_endpoint_id()?;
        Some(Endpoint {
            id,
            name: self.name.unwrap_or_else(|| format!("server {}", id)),
            location: self.location,
            country: self.country,
            distance_km: self.distance,
        })
    }
}

/// Locate the result document in CLI stdout.
///
/// The CLI normally prints a single JSON line, but progress or log lines can
/// precede it; the last parseable object wins.
fn extract_json(stdout: &str) -> Option<serde_json::Value> {
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(stdout.trim()) {
        return Some(v);
    }
    stdout
        .lines()
        .rev()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line.trim()).ok())
        .find(|v| v.get("type").and_then(|t| t.as_str()) != Some("log"))
}

/// Parse `speedtest --format=json` output into a [`SpeedTestResult`].
///
/// Missing throughput figures are kept as `None` for the caller to judge;
/// a missing or unusable server block is `Malformed`.
pub fn parse_result(stdout: &str) -> Result<SpeedTestResult, TrialError> {
    let json = extract_json(stdout).ok_or_else(|| TrialError::Malformed {
        reason: "no JSON document in speedtest output".to_string(),
    })?;
    let raw: RawResult =
        serde_json::from_value(json).map_err(|e| TrialError::Malformed {
            reason: e.to_string(),
        })?;

    let endpoint = raw
        .server
        .and_then(RawServer::into_endpoint)
        .ok_or_else(|| TrialError::Malformed {
            reason: "result carries no usable server id".to_string(),
        })?;

    let timestamp = raw
        .timestamp
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let ping = raw.ping.as_ref();
    let download = raw.download.as_ref();
    let upload = raw.upload.as_ref();
    let trial = TrialResult {
        endpoint_id: endpoint.id,
        download_mbps: download
            .and_then(|d| d.bandwidth)
            .map(bytes_per_sec_to_mbps),
        upload_mbps: upload.and_then(|u| u.bandwidth).map(bytes_per_sec_to_mbps),
        ping_ms: ping.and_then(|p| p.latency),
        jitter_ms: ping.and_then(|p| p.jitter),
        timestamp,
    };
    let detail = TransferDetail {
        ping_low_ms: ping.and_then(|p| p.low),
        ping_high_ms: ping.and_then(|p| p.high),
        download_latency: download.map(RawTransfer::loaded_latency).unwrap_or_default(),
        upload_latency: upload.map(RawTransfer::loaded_latency).unwrap_or_default(),
        download_bytes: download.and_then(|d| d.bytes),
        upload_bytes: upload.and_then(|u| u.bytes),
    };

    Ok(SpeedTestResult {
        trial,
        endpoint,
        isp: raw.isp,
        external_ip: raw.interface.and_then(|i| i.external_ip),
        packet_loss_pct: raw.packet_loss,
        result_url: raw.result.and_then(|r| r.url),
        detail,
    })
}

/// Parse `speedtest --servers --format=json` output, preserving provider order.
pub fn parse_server_list(stdout: &str) -> Result<Vec<Endpoint>, TrialError> {
    let json = extract_json(stdout).ok_or_else(|| TrialError::Malformed {
        reason: "no JSON document in server list output".to_string(),
    })?;
    let list: RawServerList = serde_json::from_value(json).map_err(|e| TrialError::Malformed {
        reason: e.to_string(),
    })?;

    let total = list.servers.len();
    let endpoints: Vec<Endpoint> = list
        .servers
        .into_iter()
        .filter_map(RawServer::into_endpoint)
        .collect();
    if endpoints.len() < total {
        warn!(
            skipped = total - endpoints.len(),
            "server list entries without a usable id were skipped"
        );
    }
    Ok(endpoints)
}

/// Map a failed CLI run onto a trial failure kind using its stderr text.
pub fn classify_failure(stderr: &str, endpoint: Option<EndpointId>) -> TrialError {
    let reason = stderr.trim().to_string();
    let lower = reason.to_lowercase();

    if lower.contains("429") || lower.contains("too many requests") || lower.contains("rate limit") {
        return TrialError::ProviderRateLimited { reason };
    }

    let endpoint_label = endpoint
        .map(|id| id.to_string())
        .unwrap_or_else(|| "provider default".to_string());

    if lower.contains("no servers defined")
        || lower.contains("server not found")
        || lower.contains("cannot find server")
        || lower.contains("invalid server")
    {
        return TrialError::EndpointUnavailable {
            endpoint: endpoint_label,
            reason,
        };
    }

    if lower.contains("resolve host")
        || lower.contains("network is unreachable")
        || lower.contains("cannot open socket")
        || lower.contains("connection refused")
        || lower.contains("could not retrieve or read configuration")
    {
        return TrialError::NetworkUnreachable { reason };
    }

    match endpoint {
        Some(_) => TrialError::EndpointUnavailable {
            endpoint: endpoint_label,
            reason,
        },
        None => TrialError::NetworkUnreachable { reason },
    }
}
