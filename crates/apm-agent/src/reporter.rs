//! Reporter that writes harvested reports to the log.
//!
//! Useful when no collector transport is wired in: every report is
//! serialized to JSON and emitted at `info` level.

use apm_metrics::harvest::{HarvestReport, ReportError, Reporter};
use async_trait::async_trait;
use tracing::info;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl LogReporter {
    pub fn render(report: &HarvestReport) -> Result<String, ReportError> {
        serde_json::to_string(report).map_err(|e| ReportError::Rejected(e.to_string()))
    }
}

#[async_trait]
impl Reporter for LogReporter {
    async fn send(&self, report: &HarvestReport) -> Result<(), ReportError> {
        let rendered = Self::render(report)?;
        info!(records = report.len(), "Harvest report: {rendered}");
        Ok(())
    }
}
