use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::domain::ExportError;
use crate::profiling::{ProfileRegistry, Sample};

/// One history row: the key, then every duration in milliseconds.
#[derive(Debug, Clone, PartialEq)]
struct HistoryRow {
    key: String,
    durations: Vec<f64>,
}

/// Headerless comma-separated history table
///
/// One row per measurement key, oldest sample first:
///
/// ```text
/// World.Tick,0.412,0.398,0.455
/// Music.Update,0.051,0.049
/// ```
#[derive(Debug, Default)]
pub struct HistoryExporter {
    rows: Vec<HistoryRow>,
}

impl HistoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot every profiler in `registry`, sorted by key.
    pub fn from_registry(registry: &ProfileRegistry) -> Self {
        let mut exporter = Self::new();
        for profiler in registry.profilers() {
            exporter.add_history(profiler.key(), &profiler.history());
        }
        exporter.rows.sort_by(|a, b| a.key.cmp(&b.key));
        exporter
    }

    pub fn add_history(&mut self, key: &str, history: &[Sample]) {
        self.rows.push(HistoryRow {
            key: key.to_string(),
            durations: history.iter().map(|s| s.duration_ms).collect(),
        });
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn export<W: Write>(&self, mut writer: W) -> Result<(), ExportError> {
        for row in &self.rows {
            // First cell is always the whole key
            write!(writer, "{}", row.key.replace(',', ";"))?;
            for duration in &row.durations {
                write!(writer, ",{duration}")?;
            }
            writeln!(writer)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn export_to_path(&self, path: &Path) -> Result<(), ExportError> {
        let file = File::create(path)?;
        self.export(BufWriter::new(file))
    }
}
