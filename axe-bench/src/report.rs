//! Rankings and the JSON results file.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::Result;
use crate::tracing::prelude::*;
use crate::types::RunResult;

/// Entries in each ranking.
pub const TOP_N: usize = 5;

/// A result with its 1-based position in a ranking.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RankedResult {
    pub rank: usize,
    #[serde(flatten)]
    pub result: RunResult,
}

/// Contents of `bitaxe_benchmark_results_<device>.json`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BenchmarkReport {
    pub device: String,
    /// RFC 3339, UTC.
    pub generated_at: String,
    pub all_results: Vec<RunResult>,
    pub top_performers: Vec<RankedResult>,
    pub most_efficient: Vec<RankedResult>,
}

impl BenchmarkReport {
    pub fn new(device: impl Into<String>, results: &[RunResult]) -> Self {
        let generated_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();

        Self {
            device: device.into(),
            generated_at,
            all_results: results.to_vec(),
            top_performers: rank(top_by_hashrate(results)),
            most_efficient: rank(top_by_efficiency(results)),
        }
    }
}

/// Valid results with the highest average hashrate, best first.
pub fn top_by_hashrate(results: &[RunResult]) -> Vec<RunResult> {
    let mut valid: Vec<RunResult> = results.iter().filter(|r| r.valid).cloned().collect();
    valid.sort_by(|a, b| b.average_hashrate.total_cmp(&a.average_hashrate));
    valid.truncate(TOP_N);
    valid
}

/// Valid results with the lowest J/TH, best first.
pub fn top_by_efficiency(results: &[RunResult]) -> Vec<RunResult> {
    let mut valid: Vec<RunResult> = results.iter().filter(|r| r.valid).cloned().collect();
    valid.sort_by(|a, b| a.efficiency_jth.total_cmp(&b.efficiency_jth));
    valid.truncate(TOP_N);
    valid
}

fn rank(results: Vec<RunResult>) -> Vec<RankedResult> {
    results
        .into_iter()
        .enumerate()
        .map(|(i, result)| RankedResult { rank: i + 1, result })
        .collect()
}

/// File name for a device's results. Characters that don't belong in a
/// file name are replaced with `_`.
pub fn file_name_for(device: &str) -> String {
    let sanitized: String = device
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("bitaxe_benchmark_results_{sanitized}.json")
}

/// Writes the report for one device, replacing the previous contents.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    device: String,
    path: PathBuf,
}

impl ReportWriter {
    pub fn new(directory: impl AsRef<Path>, device: impl Into<String>) -> Self {
        let device = device.into();
        let path = directory.as_ref().join(file_name_for(&device));
        Self { device, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn save(&self, results: &[RunResult]) -> Result<BenchmarkReport> {
        let report = BenchmarkReport::new(self.device.clone(), results);
        let json = serde_json::to_string_pretty(&report)?;
        tokio::fs::write(&self.path, json).await?;

        debug!(path = %self.path.display(), results = results.len(), "Saved results");
        Ok(report)
    }
}

/// Human-readable rankings for the terminal.
pub fn format_summary(report: &BenchmarkReport) -> String {
    let mut out = String::new();

    if report.top_performers.is_empty() {
        out.push_str("No valid results.\n");
        return out;
    }

    let _ = writeln!(out, "Top {} by hashrate:", report.top_performers.len());
    for entry in &report.top_performers {
        push_line(&mut out, entry);
    }

    let _ = writeln!(out, "\nTop {} by efficiency:", report.most_efficient.len());
    for entry in &report.most_efficient {
        push_line(&mut out, entry);
    }

    out
}

fn push_line(out: &mut String, entry: &RankedResult) {
    let r = &entry.result;
    let _ = write!(
        out,
        "  {}. {:>17}  {:7.1} GH/s  {:5.2} J/TH  {:4.1}°C",
        entry.rank,
        r.configuration.to_string(),
        r.average_hashrate,
        r.efficiency_jth,
        r.average_temperature,
    );
    if let Some(vr) = r.average_vr_temp {
        let _ = write!(out, "  VR {vr:4.1}°C");
    }
    let _ = writeln!(out, "  {:5.1}W", r.average_power);
}
