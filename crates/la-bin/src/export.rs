//! CSV export of captured sessions.
//!
//! One row per sample: `sample,time_s,<channel>...`, channel columns holding 0/1.

use anyhow::{Context, Result};
use la_core::CaptureSession;
use std::io::Write;
use std::path::Path;

pub fn write_csv<W: Write>(session: &CaptureSession, writer: W) -> Result<usize> {
    let mut csv = csv::Writer::from_writer(writer);

    let mut header = vec!["sample".to_string(), "time_s".to_string()];
    header.extend(session.capture_channels.iter().map(|c| c.display_name()));
    csv.write_record(&header)?;

    let rows = session
        .capture_channels
        .iter()
        .filter_map(|c| c.samples.as_ref().map(Vec::len))
        .max()
        .unwrap_or(0);
    let period = if session.frequency > 0 {
        1.0 / session.frequency as f64
    } else {
        0.0
    };

    for i in 0..rows {
        let mut record = Vec::with_capacity(header.len());
        record.push(i.to_string());
        record.push(format!("{:.9}", i as f64 * period));
        for channel in &session.capture_channels {
            let value = channel
                .samples
                .as_ref()
                .and_then(|s| s.get(i))
                .map(|v| if *v != 0 { "1" } else { "0" })
                .unwrap_or("");
            record.push(value.to_string());
        }
        csv.write_record(&record)?;
    }
    csv.flush()?;
    Ok(rows)
}

pub fn write_csv_file(session: &CaptureSession, path: &Path) -> Result<usize> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    write_csv(session, file)
}

/// Number of level changes in a channel's samples.
pub fn transitions(samples: &[u8]) -> usize {
    samples.windows(2).filter(|w| w[0] != w[1]).count()
}
