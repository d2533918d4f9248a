use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Datelike, NaiveDate};
use regex::Regex;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::SoundscanError;

static OBSERVATION_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9-]+$").expect("observation id regex"));

/// Observation identifier, parsed from a bare id or a full observation URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObservationRef(String);

impl ObservationRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObservationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ObservationRef {
    type Err = SoundscanError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let without_suffix = trimmed
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .trim_end_matches('/');
        let candidate = match without_suffix.rfind('/') {
            Some(idx) => &without_suffix[idx + 1..],
            None => without_suffix,
        };
        // Observation ids always carry a digit; this rejects path words like `observations`.
        let has_digit = candidate.bytes().any(|byte| byte.is_ascii_digit());
        if !has_digit || !OBSERVATION_ID_RE.is_match(candidate) {
            return Err(SoundscanError::InvalidObservationRef(value.to_string()));
        }
        Ok(Self(candidate.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, SoundscanError> {
        let lat_ok = latitude.is_finite() && (-90.0..=90.0).contains(&latitude);
        let lon_ok = longitude.is_finite() && (-180.0..=180.0).contains(&longitude);
        if !lat_ok || !lon_ok {
            return Err(SoundscanError::InvalidCoordinates(format!(
                "lat={latitude}, lon={longitude}"
            )));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }
}

/// Temporal input handed to the classifier. Exactly one form is ever supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalHint {
    Date(NaiveDate),
    Week(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemporalInput {
    #[default]
    Date,
    Week,
}

/// Calendar day an observation was made on; time of day is not tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationPeriod(NaiveDate);

impl ObservationPeriod {
    pub fn from_ymd(year: i32, month: u32, day: u32) -> Result<Self, SoundscanError> {
        NaiveDate::from_ymd_opt(year, month, day)
            .map(Self)
            .ok_or_else(|| {
                SoundscanError::MalformedResponse(format!(
                    "invalid observed_on date {year}-{month}-{day}"
                ))
            })
    }

    pub fn from_unix_timestamp(timestamp: i64) -> Result<Self, SoundscanError> {
        DateTime::from_timestamp(timestamp, 0)
            .map(|datetime| Self(datetime.date_naive()))
            .ok_or(SoundscanError::InvalidTimestamp(timestamp))
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// Week bucket in BirdNET's 48-week year (four weeks per month).
    pub fn week_48(&self) -> u8 {
        let month = self.0.month() as u8;
        let day = self.0.day() as u8;
        (month - 1) * 4 + ((day - 1) / 7 + 1).min(4)
    }

    pub fn hint(&self, input: TemporalInput) -> TemporalHint {
        match input {
            TemporalInput::Date => TemporalHint::Date(self.0),
            TemporalInput::Week => TemporalHint::Week(self.week_48()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SoundAssetRef {
    pub source_url: String,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub id: ObservationRef,
    pub coordinates: Option<Coordinates>,
    pub observed_on: ObservationPeriod,
    pub sound_assets: Vec<SoundAssetRef>,
}

/// Recording position within an observation, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordingKey(usize);

impl RecordingKey {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for RecordingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "recording_{}", self.0)
    }
}

impl FromStr for RecordingKey {
    type Err = SoundscanError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value
            .strip_prefix("recording_")
            .and_then(|index| index.parse::<usize>().ok())
            .filter(|index| *index > 0)
            .map(Self)
            .ok_or_else(|| SoundscanError::MalformedResponse(format!("bad recording key {value}")))
    }
}

#[derive(Debug, Clone)]
pub struct LocalAsset<'a> {
    pub key: RecordingKey,
    pub path: PathBuf,
    pub source: &'a SoundAssetRef,
}

#[derive(Debug, Clone)]
pub struct NormalizedAudio {
    pub key: RecordingKey,
    pub path: PathBuf,
    pub sample_rate: u32,
    pub frames: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub common_name: String,
    pub scientific_name: String,
    pub start_time: f64,
    pub end_time: f64,
    pub confidence: f64,
    #[serde(default)]
    pub label: String,
}

impl Detection {
    pub fn new(
        common_name: impl Into<String>,
        scientific_name: impl Into<String>,
        start_time: f64,
        end_time: f64,
        confidence: f64,
    ) -> Self {
        let common_name = common_name.into();
        let scientific_name = scientific_name.into();
        let label = format!("{scientific_name}_{common_name}");
        Self {
            common_name,
            scientific_name,
            start_time,
            end_time,
            confidence,
            label,
        }
    }

    /// Parses a `Scientific name_Common name` classifier label.
    pub fn from_label(label: &str, start_time: f64, end_time: f64, confidence: f64) -> Self {
        let (scientific_name, common_name) = label.split_once('_').unwrap_or((label, label));
        Self {
            common_name: common_name.to_string(),
            scientific_name: scientific_name.to_string(),
            start_time,
            end_time,
            confidence,
            label: label.to_string(),
        }
    }

    pub(crate) fn ensure_label(mut self) -> Self {
        if self.label.is_empty() {
            self.label = format!("{}_{}", self.scientific_name, self.common_name);
        }
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        let ordered = self.start_time < self.end_time;
        if !ordered {
            return Err(format!(
                "detection '{}' has start {} not before end {}",
                self.label, self.start_time, self.end_time
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!(
                "detection '{}' has confidence {} outside [0, 1]",
                self.label, self.confidence
            ));
        }
        Ok(())
    }
}

/// Detections grouped per recording, in the order recordings appear on the observation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionBatch {
    recordings: Vec<(RecordingKey, Vec<Detection>)>,
}

impl DetectionBatch {
    /// Builds a batch from per-recording results listed in asset order.
    pub fn from_ordered(results: Vec<Vec<Detection>>) -> Self {
        let recordings = results
            .into_iter()
            .enumerate()
            .map(|(idx, detections)| (RecordingKey::new(idx + 1), detections))
            .collect();
        Self { recordings }
    }

    pub fn len(&self) -> usize {
        self.recordings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recordings.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = RecordingKey> + '_ {
        self.recordings.iter().map(|(key, _)| *key)
    }

    pub fn get(&self, key: &str) -> Option<&[Detection]> {
        let key: RecordingKey = key.parse().ok()?;
        self.recordings
            .iter()
            .find(|(candidate, _)| *candidate == key)
            .map(|(_, detections)| detections.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (RecordingKey, &[Detection])> {
        self.recordings
            .iter()
            .map(|(key, detections)| (*key, detections.as_slice()))
    }
}

impl Serialize for DetectionBatch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.recordings.len()))?;
        for (key, detections) in &self.recordings {
            map.serialize_entry(&key.to_string(), detections)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for DetectionBatch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BatchVisitor;

        impl<'de> Visitor<'de> for BatchVisitor {
            type Value = DetectionBatch;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a map of recording_<n> keys to detection arrays")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut recordings = Vec::new();
                while let Some((key, detections)) =
                    access.next_entry::<String, Vec<Detection>>()?
                {
                    let key: RecordingKey = key
                        .parse()
                        .map_err(<A::Error as serde::de::Error>::custom)?;
                    let detections = detections.into_iter().map(Detection::ensure_label).collect();
                    recordings.push((key, detections));
                }
                Ok(DetectionBatch { recordings })
            }
        }

        deserializer.deserialize_map(BatchVisitor)
    }
}
