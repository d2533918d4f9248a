//! Audio normalization to the classifier's canonical input.
//!
//! Every downloaded recording, whatever its container, is decoded with symphonia,
//! downmixed to a single channel and written as 16-bit PCM WAV at its native
//! sample rate.

use std::fs::File;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavSpec, WavWriter};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, info, trace};

use crate::domain::{LocalAsset, NormalizedAudio, RecordingKey};
use crate::error::SoundscanError;

/// Declared format tokens the decoder is built to handle.
pub const SUPPORTED_FORMATS: &[&str] = &[
    "wav", "wave", "mp3", "m4a", "mp4", "aac", "flac", "ogg", "oga", "caf", "aif", "aiff",
];

pub fn is_supported_format(format: &str) -> bool {
    format.is_empty() || SUPPORTED_FORMATS.contains(&format)
}

pub fn normalized_path(destination_dir: &Path, key: RecordingKey) -> PathBuf {
    destination_dir.join(format!("{key}.wav"))
}

/// Re-encodes a downloaded asset next to itself, replacing any stale output.
pub fn normalize(asset: &LocalAsset<'_>) -> Result<NormalizedAudio, SoundscanError> {
    let format = asset.source.format.as_str();
    if !is_supported_format(format) {
        return Err(SoundscanError::UnsupportedFormat {
            format: format.to_string(),
            path: asset.path.clone(),
        });
    }
    let destination_dir = asset.path.parent().unwrap_or_else(|| Path::new("."));
    let output = normalized_path(destination_dir, asset.key);

    let decoded = decode_mono(&asset.path, format)?;
    let frames = write_wav(&output, &decoded)?;
    info!(
        key = %asset.key,
        sample_rate = decoded.sample_rate,
        frames,
        "normalized recording"
    );

    Ok(NormalizedAudio {
        key: asset.key,
        path: output,
        sample_rate: decoded.sample_rate,
        frames,
    })
}

#[derive(Debug)]
pub struct MonoAudio {
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

pub fn decode_mono(path: &Path, format: &str) -> Result<MonoAudio, SoundscanError> {
    let codec_error = |reason: String| SoundscanError::CodecError {
        path: path.to_path_buf(),
        reason,
    };

    let file = File::open(path).map_err(|err| codec_error(format!("open: {err}")))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if !format.is_empty() {
        hint.with_extension(format);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|err| match err {
            SymphoniaError::Unsupported(_) => SoundscanError::UnsupportedFormat {
                format: format.to_string(),
                path: path.to_path_buf(),
            },
            other => codec_error(format!("probe: {other}")),
        })?;
    let mut reader = probed.format;

    let track = reader
        .tracks()
        .iter()
        .find(|track| track.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| codec_error("no audio track".to_string()))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|err| match err {
            SymphoniaError::Unsupported(_) => SoundscanError::UnsupportedFormat {
                format: format.to_string(),
                path: path.to_path_buf(),
            },
            other => codec_error(format!("decoder: {other}")),
        })?;

    let mut sample_rate = codec_params.sample_rate;
    let mut samples = Vec::new();
    loop {
        let packet = match reader.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(err) => return Err(codec_error(format!("packet: {err}"))),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(err)) => {
                trace!("skipping corrupt frame: {err}");
                continue;
            }
            Err(err) => return Err(codec_error(format!("decode: {err}"))),
        };

        let spec = *decoded.spec();
        sample_rate.get_or_insert(spec.rate);
        let channels = spec.channels.count().max(1);
        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        samples.extend(
            buffer
                .samples()
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
        );
    }

    let sample_rate = sample_rate.ok_or_else(|| codec_error("unknown sample rate".to_string()))?;
    if samples.is_empty() {
        return Err(codec_error("no audio samples decoded".to_string()));
    }
    debug!(path = %path.display(), sample_rate, frames = samples.len(), "decoded");
    Ok(MonoAudio {
        sample_rate,
        samples,
    })
}

fn write_wav(output: &Path, audio: &MonoAudio) -> Result<u64, SoundscanError> {
    let codec_error = |reason: String| SoundscanError::CodecError {
        path: output.to_path_buf(),
        reason,
    };
    let spec = WavSpec {
        channels: 1,
        sample_rate: audio.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer =
        WavWriter::create(output, spec).map_err(|err| codec_error(format!("create: {err}")))?;
    for sample in &audio.samples {
        let value = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
        writer
            .write_sample(value)
            .map_err(|err| codec_error(format!("write: {err}")))?;
    }
    writer
        .finalize()
        .map_err(|err| codec_error(format!("finalize: {err}")))?;
    Ok(audio.samples.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_tokens() {
        assert!(is_supported_format("m4a"));
        assert!(is_supported_format("wav"));
        assert!(is_supported_format(""));
        assert!(!is_supported_format("jpg"));
    }

    #[test]
    fn canonical_path_is_positional() {
        let path = normalized_path(Path::new("/tmp/run"), RecordingKey::new(1));
        assert_eq!(path, PathBuf::from("/tmp/run/recording_1.wav"));
    }
}
