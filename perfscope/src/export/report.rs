use std::io::Write;

use serde::Serialize;

use crate::analysis::LogStatsSnapshot;
use crate::domain::{CurrentState, ExportError};
use crate::patching::ModeSummary;
use crate::profiling::ProfileLog;

/// Summary of one profiling session, written by `--json`
#[derive(Debug, Serialize)]
pub struct SessionReport {
    pub mode: Option<String>,
    pub state: String,
    #[serde(rename = "elapsedSecs")]
    pub elapsed_secs: f64,
    pub logs: Vec<ProfileLog>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub statistics: Vec<LogStatsSnapshot>,
    pub modes: Vec<ModeSummary>,
    #[serde(rename = "keyCollisions")]
    pub key_collisions: u64,
}

impl SessionReport {
    pub fn new(mode: Option<String>, state: CurrentState, elapsed_secs: f64) -> Self {
        Self {
            mode,
            state: state.to_string(),
            elapsed_secs,
            logs: Vec::new(),
            statistics: Vec::new(),
            modes: Vec::new(),
            key_collisions: 0,
        }
    }

    pub fn export<W: Write>(&self, writer: W) -> Result<(), ExportError> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}
