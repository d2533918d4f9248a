use percent_encoding::percent_decode_str;
use reqwest::Url;
use serde_json::Value;
use tracing::debug;

use crate::domain::{ObservationRef, SoundAssetRef};
use crate::error::SoundscanError;

/// Collects the sound recordings of one observation result, in upstream order.
pub fn extract_sound_assets(result: &Value) -> Result<Vec<SoundAssetRef>, SoundscanError> {
    let sounds = match result.get("sounds") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(value) => value.as_array().ok_or_else(|| {
            SoundscanError::MalformedResponse("sounds is not an array".to_string())
        })?,
    };

    sounds
        .iter()
        .enumerate()
        .map(|(idx, sound)| {
            let url = sound
                .get("file_url")
                .and_then(|value| value.as_str())
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| {
                    SoundscanError::MalformedResponse(format!("sound {} has no file_url", idx + 1))
                })?;
            let format = infer_format(url);
            debug!(url, format = format.as_str(), "sound asset");
            Ok(SoundAssetRef {
                source_url: url.to_string(),
                format,
            })
        })
        .collect()
}

/// Lowercased extension of the last path segment, ignoring query and fragment.
pub fn infer_format(url: &str) -> String {
    let raw_path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
    };
    let path = percent_decode_str(&raw_path).decode_utf8_lossy();
    let file_name = path.rsplit('/').next().unwrap_or_default();
    match file_name.rfind('.') {
        Some(idx) => file_name[idx + 1..].to_ascii_lowercase(),
        None => String::new(),
    }
}

pub fn ensure_assets(
    id: &ObservationRef,
    assets: &[SoundAssetRef],
    required: bool,
) -> Result<(), SoundscanError> {
    if required && assets.is_empty() {
        return Err(SoundscanError::NoAssetsFound(id.to_string()));
    }
    Ok(())
}
