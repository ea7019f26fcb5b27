//! History and session export
//!
//! `csv` writes the raw per-key history table; `report` writes a JSON
//! summary of the session (logs, statistics, modes).

pub mod csv;
pub mod report;

pub use csv::HistoryExporter;
pub use report::SessionReport;
