use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::domain::{
    Coordinates, Detection, NormalizedAudio, ObservationPeriod, TemporalHint, TemporalInput,
};
use crate::error::SoundscanError;

pub const MIN_CONFIDENCE: f64 = 0.25;
pub const OVERLAP: f64 = 0.5;

pub const DEFAULT_CLASSIFIER_PROGRAM: &str = "birdnet-analyze";

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierRequest<'a> {
    pub audio_path: &'a Path,
    pub coordinates: Option<Coordinates>,
    pub temporal: TemporalHint,
    pub min_confidence: f64,
    pub overlap: f64,
    /// Time the classifier may spend on this request before it is abandoned.
    pub time_limit: Option<Duration>,
}

/// Acoustic species classifier, e.g. a BirdNET model.
pub trait Classifier: Send + Sync {
    fn detect(&self, request: &ClassifierRequest<'_>) -> Result<Vec<Detection>, SoundscanError>;
}

impl<T: Classifier + ?Sized> Classifier for &T {
    fn detect(&self, request: &ClassifierRequest<'_>) -> Result<Vec<Detection>, SoundscanError> {
        (**self).detect(request)
    }
}

/// Runs the classifier with the fixed analysis parameters and checks its output.
#[derive(Clone)]
pub struct ClassificationAdapter<C: Classifier> {
    classifier: C,
    temporal_input: TemporalInput,
}

impl<C: Classifier> ClassificationAdapter<C> {
    pub fn new(classifier: C, temporal_input: TemporalInput) -> Self {
        Self {
            classifier,
            temporal_input,
        }
    }

    pub fn classify(
        &self,
        audio: &NormalizedAudio,
        coordinates: Option<Coordinates>,
        observed_on: ObservationPeriod,
        time_limit: Option<Duration>,
    ) -> Result<Vec<Detection>, SoundscanError> {
        self.classify_path(
            &audio.key.to_string(),
            &audio.path,
            coordinates,
            observed_on,
            time_limit,
        )
    }

    /// `recording` names the input in errors and logs.
    pub fn classify_path(
        &self,
        recording: &str,
        path: &Path,
        coordinates: Option<Coordinates>,
        observed_on: ObservationPeriod,
        time_limit: Option<Duration>,
    ) -> Result<Vec<Detection>, SoundscanError> {
        let request = ClassifierRequest {
            audio_path: path,
            coordinates,
            temporal: observed_on.hint(self.temporal_input),
            min_confidence: MIN_CONFIDENCE,
            overlap: OVERLAP,
            time_limit,
        };
        let failed = |cause: String| SoundscanError::ClassificationFailed {
            recording: recording.to_string(),
            cause,
        };

        let detections = self
            .classifier
            .detect(&request)
            .map_err(|err| match err {
                SoundscanError::Timeout { .. } => err,
                SoundscanError::ClassificationFailed { cause, .. } => failed(cause),
                other => failed(other.to_string()),
            })?
            .into_iter()
            .map(Detection::ensure_label)
            .collect::<Vec<_>>();
        for detection in &detections {
            detection.validate().map_err(&failed)?;
        }
        info!(recording, detections = detections.len(), "classified");
        Ok(detections)
    }
}

/// Classifier backed by an external analyzer process that prints detections as JSON.
#[derive(Debug, Clone)]
pub struct CommandClassifier {
    program: Option<PathBuf>,
    name: String,
    prefix_args: Vec<String>,
}

impl CommandClassifier {
    pub fn new(program: &str, prefix_args: Vec<String>) -> Self {
        let candidate = Path::new(program);
        let resolved = if candidate.components().count() > 1 {
            candidate.exists().then(|| candidate.to_path_buf())
        } else {
            find_in_path(program)
        };
        Self {
            program: resolved,
            name: program.to_string(),
            prefix_args,
        }
    }

    pub fn is_available(&self) -> bool {
        self.program.is_some()
    }

    pub fn command_args(&self, request: &ClassifierRequest<'_>) -> Vec<String> {
        let mut args = self.prefix_args.clone();
        args.push(request.audio_path.to_string_lossy().to_string());
        args.push("--min-conf".to_string());
        args.push(request.min_confidence.to_string());
        args.push("--overlap".to_string());
        args.push(request.overlap.to_string());
        if let Some(coordinates) = request.coordinates {
            args.push("--lat".to_string());
            args.push(coordinates.latitude.to_string());
            args.push("--lon".to_string());
            args.push(coordinates.longitude.to_string());
        }
        match request.temporal {
            TemporalHint::Date(date) => {
                args.push("--date".to_string());
                args.push(date.format("%Y-%m-%d").to_string());
            }
            TemporalHint::Week(week) => {
                args.push("--week".to_string());
                args.push(week.to_string());
            }
        }
        args
    }
}

impl Classifier for CommandClassifier {
    fn detect(&self, request: &ClassifierRequest<'_>) -> Result<Vec<Detection>, SoundscanError> {
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| SoundscanError::MissingTool(self.name.clone()))?;
        let args = self.command_args(request);
        debug!(program = %program.display(), ?args, "running classifier");
        let output = run_bounded(program, &args, request.time_limit)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let cause = if stderr.is_empty() {
                format!("command failed: {}", program.display())
            } else {
                stderr
            };
            return Err(SoundscanError::ClassificationFailed {
                recording: request.audio_path.display().to_string(),
                cause,
            });
        }
        serde_json::from_slice(&output.stdout).map_err(|err| {
            SoundscanError::ClassificationFailed {
                recording: request.audio_path.display().to_string(),
                cause: format!("invalid classifier output: {err}"),
            }
        })
    }
}

struct ProcessOutput {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Runs `program` to completion, killing it once `time_limit` has passed.
fn run_bounded(
    program: &Path,
    args: &[String],
    time_limit: Option<Duration>,
) -> Result<ProcessOutput, SoundscanError> {
    let started = Instant::now();
    let failed = |cause: String| SoundscanError::ClassificationFailed {
        recording: program.display().to_string(),
        cause,
    };
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| failed(err.to_string()))?;

    // Pipes are drained on their own threads so a chatty child cannot stall on a full buffer.
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let status = loop {
        if let Some(status) = child.try_wait().map_err(|err| failed(err.to_string()))? {
            break status;
        }
        if let Some(limit) = time_limit
            && started.elapsed() >= limit
        {
            if let Err(err) = child.kill() {
                warn!(program = %program.display(), "failed to kill classifier: {err}");
            }
            let _ = child.wait();
            return Err(SoundscanError::Timeout {
                elapsed_ms: started.elapsed().as_millis(),
            });
        }
        thread::sleep(POLL_INTERVAL);
    };

    Ok(ProcessOutput {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = pipe.read_to_end(&mut buffer);
        buffer
    })
}

fn collect(handle: Option<thread::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn command_args_omit_missing_location() {
        let classifier = CommandClassifier::new("birdnet-analyze", vec!["analyze".to_string()]);
        let date = NaiveDate::from_ymd_opt(2025, 10, 11).unwrap();
        let request = ClassifierRequest {
            audio_path: Path::new("/tmp/recording_1.wav"),
            coordinates: None,
            temporal: TemporalHint::Date(date),
            min_confidence: MIN_CONFIDENCE,
            overlap: OVERLAP,
            time_limit: None,
        };
        let args = classifier.command_args(&request);
        assert_eq!(
            args,
            vec![
                "analyze",
                "/tmp/recording_1.wav",
                "--min-conf",
                "0.25",
                "--overlap",
                "0.5",
                "--date",
                "2025-10-11",
            ]
        );
    }

    #[test]
    fn command_args_use_week_when_requested() {
        let classifier = CommandClassifier::new("birdnet-analyze", Vec::new());
        let request = ClassifierRequest {
            audio_path: Path::new("a.wav"),
            coordinates: Some(Coordinates::new(43.0, -89.4).unwrap()),
            temporal: TemporalHint::Week(40),
            min_confidence: MIN_CONFIDENCE,
            overlap: OVERLAP,
            time_limit: None,
        };
        let args = classifier.command_args(&request);
        assert!(args.windows(2).any(|w| w == ["--lat", "43"]));
        assert!(args.windows(2).any(|w| w == ["--lon", "-89.4"]));
        assert!(args.windows(2).any(|w| w == ["--week", "40"]));
        assert!(!args.contains(&"--date".to_string()));
    }

    fn shell_request(time_limit: Option<Duration>) -> ClassifierRequest<'static> {
        ClassifierRequest {
            audio_path: Path::new("recording_1.wav"),
            coordinates: None,
            temporal: TemporalHint::Week(38),
            min_confidence: MIN_CONFIDENCE,
            overlap: OVERLAP,
            time_limit,
        }
    }

    #[cfg(unix)]
    #[test]
    fn command_output_is_parsed() {
        let script = r#"echo '[{"common_name":"Marsh Tit","scientific_name":"Poecile palustris","start_time":0.0,"end_time":3.0,"confidence":0.8}]'"#;
        let classifier = CommandClassifier::new(
            "sh",
            vec!["-c".to_string(), script.to_string(), "sh".to_string()],
        );
        let detections = classifier
            .detect(&shell_request(Some(Duration::from_secs(10))))
            .unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].common_name, "Marsh Tit");
    }

    #[cfg(unix)]
    #[test]
    fn slow_command_is_killed_at_time_limit() {
        let classifier = CommandClassifier::new(
            "sh",
            vec!["-c".to_string(), "exec sleep 5".to_string(), "sh".to_string()],
        );
        let started = Instant::now();
        let err = classifier
            .detect(&shell_request(Some(Duration::from_millis(200))))
            .unwrap_err();
        assert!(matches!(err, SoundscanError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
