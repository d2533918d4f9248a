use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::assets::ensure_assets;
use crate::audio;
use crate::classifier::{ClassificationAdapter, Classifier};
use crate::domain::{
    Coordinates, Detection, DetectionBatch, Observation, ObservationPeriod, ObservationRef,
    RecordingKey, SoundAssetRef, TemporalInput,
};
use crate::download::{AssetDownloader, download};
use crate::error::SoundscanError;
use crate::inat::{ObservationClient, fetch_observation};
use crate::workspace::Workspace;

/// Boreal Chickadee observation with one recording.
pub const SAMPLE_SINGLE_RECORDING: &str = "https://www.inaturalist.org/observations/333479462";
/// Marsh Tit observation with several recordings.
pub const SAMPLE_MULTIPLE_RECORDINGS: &str = "https://www.inaturalist.org/observations/332146765";

/// How a pipeline answers requests. Anything but `Live` is meant for development.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ResponseMode {
    #[default]
    Live,
    /// Return a fixed batch without touching the network or the classifier.
    CannedDetections {
        #[serde(default = "sample_detections")]
        batch: DetectionBatch,
    },
    /// Ignore the requested observation and always process this one.
    FixedObservation { observation: String },
}

pub fn sample_detections() -> DetectionBatch {
    DetectionBatch::from_ordered(vec![vec![
        Detection::new(
            "Mountain Chickadee",
            "Poecile gambeli",
            12.5,
            15.5,
            0.29550546407699585,
        ),
        Detection::new(
            "Boreal Chickadee",
            "Poecile hudsonicus",
            17.5,
            20.5,
            0.5595659017562866,
        ),
    ]])
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub workers: usize,
    pub run_timeout: Option<Duration>,
    pub temporal_input: TemporalInput,
    pub require_assets: bool,
    pub response_mode: ResponseMode,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: 2,
            run_timeout: None,
            temporal_input: TemporalInput::Date,
            require_assets: false,
            response_mode: ResponseMode::Live,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Sync {
    fn event(&self, event: ProgressEvent);
}

/// Observation-to-detections pipeline.
pub struct Pipeline<O: ObservationClient, D: AssetDownloader, C: Classifier> {
    workspace: Workspace,
    observations: O,
    downloader: D,
    adapter: ClassificationAdapter<C>,
    options: PipelineOptions,
}

impl<O: ObservationClient, D: AssetDownloader, C: Classifier> Pipeline<O, D, C> {
    pub fn new(
        workspace: Workspace,
        observations: O,
        downloader: D,
        classifier: C,
        options: PipelineOptions,
    ) -> Self {
        let adapter = ClassificationAdapter::new(classifier, options.temporal_input);
        Self {
            workspace,
            observations,
            downloader,
            adapter,
            options,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Runs one observation, given by id or URL, through download, normalization
    /// and classification. Scratch storage is emptied before returning, on every path.
    pub fn run(
        &self,
        observation: &str,
        sink: &dyn ProgressSink,
    ) -> Result<DetectionBatch, SoundscanError> {
        let observation = match &self.options.response_mode {
            ResponseMode::Live => observation,
            ResponseMode::CannedDetections { batch } => {
                sink.event(ProgressEvent {
                    message: "phase=Done; canned detections".to_string(),
                    elapsed: None,
                });
                return Ok(batch.clone());
            }
            ResponseMode::FixedObservation { observation } => observation.as_str(),
        };
        let id: ObservationRef = observation.parse()?;
        let deadline = Deadline::start(self.options.run_timeout);

        let scratch = self.workspace.acquire()?;
        let outcome = self.run_in(&id, scratch.path(), &deadline, sink);
        scratch.release();

        match &outcome {
            Ok(batch) => info!(%id, recordings = batch.len(), "run finished"),
            Err(err) => warn!(%id, "run failed: {err}"),
        }
        sink.event(ProgressEvent {
            message: "phase=Done".to_string(),
            elapsed: Some(deadline.elapsed()),
        });
        outcome
    }

    /// Classifies a local audio file directly, with no observation lookup.
    pub fn run_file(
        &self,
        path: &Path,
        latitude: f64,
        longitude: f64,
        unix_timestamp: i64,
    ) -> Result<Vec<Detection>, SoundscanError> {
        let coordinates = Coordinates::new(latitude, longitude)?;
        let observed_on = ObservationPeriod::from_unix_timestamp(unix_timestamp)?;
        if !path.is_file() {
            return Err(SoundscanError::Filesystem(format!(
                "audio file not found: {}",
                path.display()
            )));
        }
        self.adapter.classify_path(
            &path.display().to_string(),
            path,
            Some(coordinates),
            observed_on,
            self.options.run_timeout,
        )
    }

    fn run_in(
        &self,
        id: &ObservationRef,
        dir: &Path,
        deadline: &Deadline,
        sink: &dyn ProgressSink,
    ) -> Result<DetectionBatch, SoundscanError> {
        sink.event(ProgressEvent {
            message: format!("phase=Fetch; observation {id}"),
            elapsed: None,
        });
        let observation = fetch_observation(&self.observations, id)?;
        deadline.check()?;
        ensure_assets(id, &observation.sound_assets, self.options.require_assets)?;

        let results = self.process_recordings(&observation, dir, deadline, sink)?;
        // The last stage may have run past the limit; a late batch is still a timeout.
        deadline.check()?;
        Ok(DetectionBatch::from_ordered(results))
    }

    /// Processes recordings on a bounded set of workers. Results are slotted by
    /// asset position, so completion order never affects recording keys.
    fn process_recordings(
        &self,
        observation: &Observation,
        dir: &Path,
        deadline: &Deadline,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<Vec<Detection>>, SoundscanError> {
        let assets = &observation.sound_assets;
        if assets.is_empty() {
            return Ok(Vec::new());
        }
        let workers = self.options.workers.clamp(1, assets.len());
        let next = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);
        let slots: Mutex<Vec<Option<Result<Vec<Detection>, SoundscanError>>>> =
            Mutex::new((0..assets.len()).map(|_| None).collect());

        let (next, abort, shared) = (&next, &abort, &slots);
        thread::scope(|scope| {
            let handles = (0..workers)
                .map(|_| {
                    scope.spawn(move || {
                        loop {
                            if abort.load(Ordering::SeqCst) {
                                break;
                            }
                            let idx = next.fetch_add(1, Ordering::SeqCst);
                            let Some(asset) = assets.get(idx) else {
                                break;
                            };
                            let key = RecordingKey::new(idx + 1);
                            let result =
                                self.process_recording(key, asset, observation, dir, deadline, sink);
                            if result.is_err() {
                                abort.store(true, Ordering::SeqCst);
                            }
                            if let Ok(mut slots) = shared.lock() {
                                slots[idx] = Some(result);
                            }
                        }
                    })
                })
                .collect::<Vec<_>>();
            for handle in handles {
                if let Err(payload) = handle.join() {
                    std::panic::resume_unwind(payload);
                }
            }
        });

        let slots = slots
            .into_inner()
            .map_err(|_| SoundscanError::Filesystem("recording results poisoned".to_string()))?;
        // Positions are handed out in order, so any unprocessed slot sits after the
        // first failure and the scan below surfaces the lowest-numbered error.
        let mut ordered = Vec::with_capacity(assets.len());
        for result in slots.into_iter().flatten() {
            ordered.push(result?);
        }
        Ok(ordered)
    }

    fn process_recording(
        &self,
        key: RecordingKey,
        asset: &SoundAssetRef,
        observation: &Observation,
        dir: &Path,
        deadline: &Deadline,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<Detection>, SoundscanError> {
        let started = Instant::now();
        deadline.check()?;
        sink.event(ProgressEvent {
            message: format!("phase=Download; {key}"),
            elapsed: None,
        });
        let local = download(&self.downloader, asset, key, dir)?;

        deadline.check()?;
        sink.event(ProgressEvent {
            message: format!("phase=Normalize; {key} format={}", asset.format),
            elapsed: None,
        });
        let normalized = audio::normalize(&local)?;

        deadline.check()?;
        sink.event(ProgressEvent {
            message: format!("phase=Classify; {key}"),
            elapsed: None,
        });
        let detections = self.adapter.classify(
            &normalized,
            observation.coordinates,
            observation.observed_on,
            deadline.remaining(),
        )?;
        sink.event(ProgressEvent {
            message: format!("{key} detections={}", detections.len()),
            elapsed: Some(started.elapsed()),
        });
        Ok(detections)
    }
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    started: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    fn start(limit: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left before the limit, or `None` when the run is unbounded.
    fn remaining(&self) -> Option<Duration> {
        self.limit
            .map(|limit| limit.saturating_sub(self.elapsed()))
    }

    fn check(&self) -> Result<(), SoundscanError> {
        match self.limit {
            Some(limit) if self.elapsed() >= limit => Err(SoundscanError::Timeout {
                elapsed_ms: self.elapsed().as_millis(),
            }),
            _ => Ok(()),
        }
    }
}
