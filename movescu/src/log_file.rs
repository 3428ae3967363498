//! The retrieve log line, appended once a retrieval completes.
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Local};
use dicom_qr::storage::StorageStats;
use dicom_qr::{Completion, CompletionHook, TemporaryStorage};
use snafu::Report;
use tracing::{error, info};

/// Writes one line to a log file
/// describing the retrieval and what was received in storage.
#[derive(Debug)]
pub struct MoveLog {
    path: PathBuf,
    storage: TemporaryStorage,
    config: String,
    reference: String,
}

impl MoveLog {
    /// `config` is echoed as the provider's address,
    /// and `reference` as the match keys requested.
    pub fn new(
        path: PathBuf,
        storage: TemporaryStorage,
        config: impl Into<String>,
        reference: impl Into<String>,
    ) -> Self {
        MoveLog {
            path,
            storage,
            config: config.into(),
            reference: reference.into(),
        }
    }

    fn append(&self, completion: &Completion) -> std::io::Result<()> {
        let stats = self.storage.stats().unwrap_or_else(|e| {
            error!("{}", Report::from_error(e));
            StorageStats::default()
        });
        let line = format_line(
            &Local::now(),
            completion,
            stats,
            &self.config,
            &self.reference,
        );
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())
    }
}

impl CompletionHook for MoveLog {
    fn on_complete(&mut self, completion: &Completion) {
        match self.append(completion) {
            Ok(()) => info!("Retrieval logged to {}", self.path.display()),
            Err(e) => error!(
                "Could not write to {}: {}",
                self.path.display(),
                Report::from_error(e)
            ),
        }
    }
}

/// Build the log line, including its leading line break.
pub fn format_line(
    timestamp: &DateTime<Local>,
    completion: &Completion,
    stats: StorageStats,
    config: &str,
    reference: &str,
) -> String {
    let elapsed = completion.elapsed.as_millis();
    format!(
        "\n{} *INFO* MoveSCU:dicom association:{} nbFiles:{} size:{} time:{} rate:{} config:{} ref:{}",
        timestamp.format("%d.%m.%Y %H:%M:%S%.3f"),
        completion.association_time.as_millis(),
        stats.files,
        stats.bytes,
        elapsed,
        format_rate(stats.bytes, elapsed),
        config,
        reference,
    )
}

/// Bytes per millisecond, with at most two decimal places.
pub fn format_rate(bytes: u64, millis: u128) -> String {
    let rate = bytes as f64 / millis.max(1) as f64;
    let text = format!("{:.2}", rate);
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}
