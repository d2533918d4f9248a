use std::fs::File;
use std::path::{Path, PathBuf};

use reqwest::blocking::Client;
use tracing::{debug, info};

use crate::domain::{LocalAsset, RecordingKey, SoundAssetRef};
use crate::error::SoundscanError;

pub trait AssetDownloader: Send + Sync {
    /// Writes the asset body to `destination`, replacing any existing file.
    fn fetch_to(&self, asset: &SoundAssetRef, destination: &Path) -> Result<(), SoundscanError>;
}

impl<T: AssetDownloader + ?Sized> AssetDownloader for &T {
    fn fetch_to(&self, asset: &SoundAssetRef, destination: &Path) -> Result<(), SoundscanError> {
        (**self).fetch_to(asset, destination)
    }
}

#[derive(Clone)]
pub struct HttpAssetDownloader {
    client: Client,
}

impl HttpAssetDownloader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl AssetDownloader for HttpAssetDownloader {
    fn fetch_to(&self, asset: &SoundAssetRef, destination: &Path) -> Result<(), SoundscanError> {
        let failed = |cause: String| SoundscanError::DownloadFailed {
            url: asset.source_url.clone(),
            cause,
        };
        let mut response = self
            .client
            .get(&asset.source_url)
            .send()
            .map_err(|err| failed(err.to_string()))?;
        if !response.status().is_success() {
            return Err(failed(format!("status {}", response.status().as_u16())));
        }
        let mut file = File::create(destination).map_err(|err| failed(err.to_string()))?;
        let bytes =
            std::io::copy(&mut response, &mut file).map_err(|err| failed(err.to_string()))?;
        debug!(url = asset.source_url.as_str(), bytes, "asset body written");
        Ok(())
    }
}

pub fn download_path(destination_dir: &Path, key: RecordingKey, format: &str) -> PathBuf {
    if format.is_empty() {
        destination_dir.join(format!("download_{}", key.index()))
    } else {
        destination_dir.join(format!("download_{}.{format}", key.index()))
    }
}

/// Downloads one asset into `destination_dir`, named after its recording position.
pub fn download<'a, D: AssetDownloader + ?Sized>(
    downloader: &D,
    asset: &'a SoundAssetRef,
    key: RecordingKey,
    destination_dir: &Path,
) -> Result<LocalAsset<'a>, SoundscanError> {
    let path = download_path(destination_dir, key, &asset.format);
    info!(%key, url = asset.source_url.as_str(), "downloading sound");
    downloader.fetch_to(asset, &path)?;
    Ok(LocalAsset {
        key,
        path,
        source: asset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_names_are_positional() {
        let dir = Path::new("/tmp/run");
        assert_eq!(
            download_path(dir, RecordingKey::new(2), "m4a"),
            PathBuf::from("/tmp/run/download_2.m4a")
        );
        assert_eq!(
            download_path(dir, RecordingKey::new(3), ""),
            PathBuf::from("/tmp/run/download_3")
        );
    }
}
