//! Human-readable formatting of measurements, rankings, and server lists.

use crate::selection::DiscoveryOutcome;
use crate::storage::MeasurementRecord;
use crate::throughput::Endpoint;

/// Format a bandwidth figure, switching to Gbps above 1000 Mbps.
pub fn format_speed(mbps: f64) -> String {
    if mbps >= 1000.0 {
        format!("{:.2} Gbps", mbps / 1000.0)
    } else {
        format!("{:.1} Mbps", mbps)
    }
}

/// One-line summary of a completed measurement.
pub fn format_summary(record: &MeasurementRecord) -> String {
    let mut summary = format!(
        "down {} / up {}, ping {:.1}ms via {} (ID: {}, {})",
        format_speed(record.download_mbps),
        format_speed(record.upload_mbps),
        record.ping_ms,
        record.endpoint_name,
        record.endpoint_id,
        record.selection,
    );

    if let Some(jitter) = record.jitter_ms {
        summary.push_str(&format!(", jitter: {:.2}ms", jitter));
    }
    if let Some(loss) = record.packet_loss_pct {
        summary.push_str(&format!(", loss: {:.2}%", loss));
    }
    let loaded = (
        record.detail.download_latency.iqm_ms,
        record.detail.upload_latency.iqm_ms,
    );
    if let (Some(down), Some(up)) = loaded {
        summary.push_str(&format!(", loaded ping: {:.1}ms down / {:.1}ms up", down, up));
    }

    summary
}

/// Table row for a candidate server.
pub fn format_endpoint_row(endpoint: &Endpoint) -> String {
    let distance = endpoint
        .distance_km
        .map(|d| format!("{:.1} km", d))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{:>8} | {:<25} | {:<30} | {}",
        endpoint.id,
        truncate(&endpoint.name, 25),
        truncate(&endpoint.display_location().unwrap_or_default(), 30),
        distance
    )
}

/// Ranking table lines, best first.
pub fn format_ranking(outcome: &DiscoveryOutcome) -> Vec<String> {
    outcome
        .ranking
        .ranked
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let name = outcome
                .endpoint(s.endpoint_id)
                .map(|e| e.name.as_str())
                .unwrap_or("?");
            format!(
                "#{:<4} {:<25} {:>8}  {:>12}  {:>8.1} ms  score {:.2}",
                i + 1,
                truncate(name, 25),
                s.endpoint_id,
                format_speed(s.download_mbps),
                s.ping_ms,
                s.score
            )
        })
        .collect()
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throughput::{EndpointId, TransferDetail};

    fn record(download: f64) -> MeasurementRecord {
        MeasurementRecord {
            timestamp: chrono::Utc::now(),
            download_mbps: download,
            upload_mbps: 245.3,
            ping_ms: 11.2,
            jitter_ms: Some(0.05),
            packet_loss_pct: None,
            endpoint_id: 48238,
            endpoint_name: "Example Net".to_string(),
            endpoint_location: None,
            isp: None,
            external_ip: None,
            result_url: None,
            selection: "cached".to_string(),
            detail: TransferDetail::default(),
        }
    }

    #[test]
    fn test_format_summary_gbps() {
        let summary = format_summary(&record(1412.0));
        assert!(summary.contains("1.41 Gbps"));
        assert!(summary.contains("245.3 Mbps"));
        assert!(summary.contains("ID: 48238"));
        assert!(summary.contains("jitter: 0.05ms"));
        assert!(!summary.contains("loss"));
        assert!(!summary.contains("loaded"));
    }

    #[test]
    fn test_format_summary_with_loaded_latency() {
        let mut rec = record(300.0);
        rec.detail.download_latency.iqm_ms = Some(48.5);
        rec.detail.upload_latency.iqm_ms = Some(31.04);
        let summary = format_summary(&rec);
        assert!(summary.contains("loaded ping: 48.5ms down / 31.0ms up"));
    }

    #[test]
    fn test_endpoint_row_without_distance_or_location() {
        let row = format_endpoint_row(&Endpoint {
            id: EndpointId(1270),
            name: "A very long server name that keeps going".to_string(),
            location: None,
            country: None,
            distance_km: None,
        });
        assert!(row.contains("1270"));
        assert!(row.trim_end().ends_with('-'));
        assert!(!row.contains("keeps going"));
    }
}
