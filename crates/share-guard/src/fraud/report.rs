use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::error::Result;
use crate::shares::Share;

/// One fraud detection as written to the report log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudReport {
    pub reason: String,
    pub share: Share,
    pub ts: f64,
}

#[async_trait::async_trait]
pub trait ReportSink: Send + Sync {
    async fn append(&self, report: &FraudReport) -> Result<()>;
}

/// Appends reports to a file, one JSON object per line.
#[derive(Debug, Clone)]
pub struct JsonlReportSink {
    path: PathBuf,
}

impl JsonlReportSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl ReportSink for JsonlReportSink {
    async fn append(&self, report: &FraudReport) -> Result<()> {
        let mut line = serde_json::to_string(report)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
