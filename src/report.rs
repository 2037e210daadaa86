//! Run summary and export functionality

use crate::config::Config;
use crate::device::{DeviceState, DeviceStats};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

/// Complete run summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Summary metadata
    pub metadata: SummaryMetadata,
    /// Advertised device and transport
    pub device: DeviceSummary,
    /// Configured timing
    pub cadence: CadenceSummary,
    /// What the device did
    pub activity: DeviceStats,
    /// State the device was left in
    pub final_state: DeviceState,
    /// True if the run ended on Ctrl+C before the device closed itself
    pub interrupted: bool,
}

/// Summary metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryMetadata {
    /// When the device was created
    pub started_at: String,
    /// When the summary was generated
    pub finished_at: String,
    /// Application version
    pub version: String,
    /// Run duration in seconds
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub backend: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceSummary {
    pub initial_delay_ms: u64,
    pub period_ms: u64,
    pub release_delay_ms: u64,
    pub cycle_limit: u32,
}

impl RunSummary {
    /// Create a new run summary
    pub fn new(
        started_at: DateTime<Utc>,
        start_time: Instant,
        config: &Config,
        backend: &str,
        activity: DeviceStats,
        final_state: DeviceState,
        interrupted: bool,
    ) -> Self {
        let duration_secs = start_time.elapsed().as_secs_f64();
        let now: DateTime<Utc> = Utc::now();

        Self {
            metadata: SummaryMetadata {
                started_at: started_at.to_rfc3339(),
                finished_at: now.to_rfc3339(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                duration_secs,
            },
            device: DeviceSummary {
                name: config.device.name.clone(),
                vendor_id: config.device.vendor_id,
                product_id: config.device.product_id,
                backend: backend.to_string(),
            },
            cadence: CadenceSummary {
                initial_delay_ms: config.cadence.initial_delay_ms,
                period_ms: config.cadence.period_ms,
                release_delay_ms: config.cadence.release_delay_ms,
                cycle_limit: config.cadence.cycle_limit,
            },
            activity,
            final_state,
            interrupted,
        }
    }

    /// True if every configured cycle ran
    pub fn completed(&self) -> bool {
        self.activity.cycles >= self.cadence.cycle_limit
    }

    /// Export summary to JSON file
    pub fn export_json(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }

    /// Export summary to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
