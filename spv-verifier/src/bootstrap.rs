use std::path::Path;
use std::time::Duration;

use log::{debug, info, warn};
use spv_types::{Header, RETARGET_INTERVAL};

use crate::config::Config;
use crate::error::{ChainError, StoreError};
use crate::rules::Rules;
use crate::store::HeaderStore;

/// Makes sure the headers file exists, fetching the configured archive on
/// first run. The archive is an optimization, never an authority: on any
/// download failure the engine starts from an empty file and syncs from
/// peers instead.
pub async fn init_headers_file(path: &Path, config: &Config) -> Result<(), StoreError> {
    if path.exists() {
        return Ok(());
    }

    let timeout = Duration::from_secs(config.download_timeout_secs);
    info!(target: "verifier", "downloading {}", config.headers_url);
    match download_archive(&config.headers_url, timeout).await {
        Ok(mut bytes) => {
            // Drop a trailing partial record so the store can open the file.
            let usable = bytes.len() - bytes.len() % Header::SIZE;
            if usable < bytes.len() {
                warn!(
                    target: "verifier",
                    "archive has {} trailing bytes, discarding them",
                    bytes.len() - usable
                );
                bytes.truncate(usable);
            }
            std::fs::write(path, &bytes)?;
            info!(
                target: "verifier",
                "archive delivered {} headers",
                usable / Header::SIZE
            );
        }
        Err(err) => {
            warn!(target: "verifier", "download failed ({err}), creating empty file");
            std::fs::File::create(path)?;
        }
    }
    Ok(())
}

async fn download_archive(url: &str, connect_timeout: Duration) -> Result<Vec<u8>, reqwest::Error> {
    let client = reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()?;
    let response = client.get(url).send().await?.error_for_status()?;
    Ok(response.bytes().await?.to_vec())
}

/// Walks every complete difficulty window in the store through chunk
/// validation, truncating the file at the first invalid window boundary.
pub fn validate_archive(store: &HeaderStore, rules: &Rules) -> Result<(), ChainError> {
    let Some(tip) = store.tip_height() else {
        return Ok(());
    };

    let complete_epochs = (tip + 1) / RETARGET_INTERVAL;
    for epoch in 0..complete_epochs {
        let Some(data) = store.read_chunk(epoch)? else {
            break;
        };
        match rules.validate_chunk(epoch, &data) {
            Ok(()) => debug!(target: "verifier", "archive epoch {epoch} validated"),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(
                    target: "verifier",
                    "archive invalid in epoch {epoch} ({err}), truncating"
                );
                store.truncate(epoch * RETARGET_INTERVAL)?;
                break;
            }
        }
    }
    Ok(())
}
