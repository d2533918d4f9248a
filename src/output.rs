use std::io::{self, Write};

use serde::Serialize;

use crate::domain::{Detection, DetectionBatch};
use crate::pipeline::{ProgressEvent, ProgressSink};

#[derive(Debug, Serialize)]
struct DetectionEnvelope<'a> {
    detection_data: &'a DetectionBatch,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_batch(batch: &DetectionBatch) -> io::Result<()> {
        Self::print_json(&DetectionEnvelope {
            detection_data: batch,
        })
    }

    pub fn print_detections(detections: &[Detection]) -> io::Result<()> {
        Self::print_json(&detections)
    }

    pub fn render_batch(batch: &DetectionBatch) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&DetectionEnvelope {
            detection_data: batch,
        })
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Forwards progress events to the tracing subscriber.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => {
                tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message)
            }
            None => tracing::info!("{}", event.message),
        }
    }
}
