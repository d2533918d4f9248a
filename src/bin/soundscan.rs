use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use inat_soundscan::classifier::CommandClassifier;
use inat_soundscan::config::{ConfigLoader, ResolvedConfig};
use inat_soundscan::download::HttpAssetDownloader;
use inat_soundscan::error::SoundscanError;
use inat_soundscan::inat::{InatHttpClient, http_client};
use inat_soundscan::output::{JsonOutput, LogProgress};
use inat_soundscan::pipeline::Pipeline;

#[derive(Parser)]
#[command(name = "soundscan")]
#[command(about = "Species detections for iNaturalist sound recordings")]
#[command(version, author)]
struct Cli {
    /// Path to a JSON config file (defaults to ./soundscan.json when present)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Abort a run after this many seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Detect species in every recording of an observation")]
    Observation(ObservationArgs),
    #[command(about = "Detect species in a local audio file")]
    File(FileArgs),
}

#[derive(Args)]
struct ObservationArgs {
    /// Observation id or URL
    observation: String,
}

#[derive(Args)]
struct FileArgs {
    path: PathBuf,
    #[arg(allow_hyphen_values = true)]
    latitude: f64,
    #[arg(allow_hyphen_values = true)]
    longitude: f64,
    timestamp: i64,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<SoundscanError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SoundscanError) -> u8 {
    match error {
        SoundscanError::InvalidObservationRef(_)
        | SoundscanError::InvalidCoordinates(_)
        | SoundscanError::InvalidTimestamp(_)
        | SoundscanError::ConfigRead(_)
        | SoundscanError::ConfigParse(_)
        | SoundscanError::NoAssetsFound(_) => 2,
        SoundscanError::UpstreamUnavailable(_)
        | SoundscanError::UpstreamStatus { .. }
        | SoundscanError::MalformedResponse(_)
        | SoundscanError::DownloadFailed { .. }
        | SoundscanError::ClassificationFailed { .. }
        | SoundscanError::MissingTool(_) => 3,
        SoundscanError::Timeout { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    if let Some(secs) = cli.timeout {
        config.run_timeout = Some(Duration::from_secs(secs));
    }
    let pipeline = build_pipeline(&config)?;

    match cli.command {
        Commands::Observation(args) => {
            let batch = pipeline.run(&args.observation, &LogProgress)?;
            JsonOutput::print_batch(&batch).into_diagnostic()?;
        }
        Commands::File(args) => {
            let detections =
                pipeline.run_file(&args.path, args.latitude, args.longitude, args.timestamp)?;
            JsonOutput::print_detections(&detections).into_diagnostic()?;
        }
    }
    Ok(())
}

fn build_pipeline(
    config: &ResolvedConfig,
) -> Result<Pipeline<InatHttpClient, HttpAssetDownloader, CommandClassifier>, SoundscanError> {
    let observations = InatHttpClient::new(&config.api_base_url, config.request_timeout)?;
    let downloader = HttpAssetDownloader::new(http_client(config.request_timeout)?);
    let classifier =
        CommandClassifier::new(&config.classifier_program, config.classifier_args.clone());
    if !classifier.is_available() {
        tracing::warn!(
            program = config.classifier_program.as_str(),
            "classifier not found on PATH"
        );
    }
    Ok(Pipeline::new(
        config.workspace(),
        observations,
        downloader,
        classifier,
        config.pipeline_options(),
    ))
}
