use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::classifier::DEFAULT_CLASSIFIER_PROGRAM;
use crate::domain::TemporalInput;
use crate::error::SoundscanError;
use crate::inat::DEFAULT_API_BASE_URL;
use crate::pipeline::{PipelineOptions, ResponseMode};
use crate::workspace::Workspace;

pub const DEFAULT_CONFIG_FILE: &str = "soundscan.json";
pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub temp_root: Option<String>,
    #[serde(default)]
    pub isolate_runs: Option<bool>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
    #[serde(default)]
    pub classifier: Option<ClassifierEntry>,
    #[serde(default)]
    pub temporal_input: Option<TemporalInput>,
    #[serde(default)]
    pub require_assets: Option<bool>,
    #[serde(default)]
    pub response_mode: Option<ResponseMode>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ClassifierEntry {
    Shorthand(String),
    Detailed(ClassifierEntryObject),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClassifierEntryObject {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub api_base_url: String,
    pub temp_root: Utf8PathBuf,
    pub isolate_runs: bool,
    pub workers: usize,
    pub request_timeout: Duration,
    pub run_timeout: Option<Duration>,
    pub classifier_program: String,
    pub classifier_args: Vec<String>,
    pub temporal_input: TemporalInput,
    pub require_assets: bool,
    pub response_mode: ResponseMode,
}

impl ResolvedConfig {
    pub fn workspace(&self) -> Workspace {
        Workspace::new(self.temp_root.clone(), self.isolate_runs)
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            workers: self.workers,
            run_timeout: self.run_timeout,
            temporal_input: self.temporal_input,
            require_assets: self.require_assets,
            response_mode: self.response_mode.clone(),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `soundscan.json` when present. Without either, defaults apply.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, SoundscanError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| SoundscanError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| SoundscanError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, SoundscanError> {
        let temp_root = match config.temp_root {
            Some(root) if !root.trim().is_empty() => Utf8PathBuf::from(root),
            _ => Workspace::default_root()?,
        };

        let workers = config.workers.unwrap_or(DEFAULT_WORKERS);
        if workers == 0 {
            return Err(SoundscanError::ConfigParse(
                "workers must be at least 1".to_string(),
            ));
        }

        let (classifier_program, classifier_args) = match config.classifier {
            Some(ClassifierEntry::Shorthand(program)) => (program, Vec::new()),
            Some(ClassifierEntry::Detailed(obj)) => (obj.program, obj.args),
            None => (DEFAULT_CLASSIFIER_PROGRAM.to_string(), Vec::new()),
        };

        Ok(ResolvedConfig {
            api_base_url: config
                .api_base_url
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            temp_root,
            isolate_runs: config.isolate_runs.unwrap_or(true),
            workers,
            request_timeout: Duration::from_secs(
                config
                    .request_timeout_secs
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
            run_timeout: config.run_timeout_secs.map(Duration::from_secs),
            classifier_program,
            classifier_args,
            temporal_input: config.temporal_input.unwrap_or_default(),
            require_assets: config.require_assets.unwrap_or(false),
            response_mode: config.response_mode.unwrap_or_default(),
        })
    }
}
