use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use serde::Deserialize;

/// Name of the header file inside the data directory.
pub const HEADERS_FILE: &str = "blockchain_headers";

const DEFAULT_HEADERS_URL: &str = "https://headers.electrum.org/blockchain_headers";

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    /// Directory holding the `blockchain_headers` file.
    pub data_dir: PathBuf,
    /// Precomputed header archive fetched on first run.
    pub headers_url: String,
    /// Connect timeout for the archive download.
    pub download_timeout_secs: u64,
    /// Sleep between tip scans when no peer has news.
    pub poll_interval_secs: u64,
    /// Per-poll wait for a `get_header` reply.
    pub request_timeout_secs: u64,
    /// Polls before a pending `get_header` counts as a peer timeout.
    pub request_retries: u32,
    /// Deepest walk-back accepted before a candidate chain is abandoned.
    pub max_reorg_depth: u64,
    /// How long a flagged peer is skipped.
    pub peer_cooldown_secs: u64,
    /// Walk the bootstrap archive through chunk validation before serving.
    pub validate_archive: bool,
    /// Accept headers without checking proof of work. Testing only.
    pub skip_pow_verification: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            headers_url: DEFAULT_HEADERS_URL.to_string(),
            download_timeout_secs: 30,
            poll_interval_secs: 1,
            request_timeout_secs: 1,
            request_retries: 30,
            max_reorg_depth: 2016,
            peer_cooldown_secs: 600,
            validate_archive: false,
            skip_pow_verification: false,
        }
    }
}

impl Config {
    /// Loads a TOML config file. `DATA_DIR` and `HEADERS_URL` environment
    /// variables override the file.
    ///
    /// # Errors
    /// * config file does not exist
    /// * incorrect config
    pub fn load(file: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(file.as_ref()).context("Failed to read config file")?;
        let mut config: Config = toml::from_str(&raw).context("Failed to parse config file")?;

        if let Ok(dir) = std::env::var("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var("HEADERS_URL") {
            config.headers_url = url;
        }

        Ok(config)
    }

    pub fn headers_path(&self) -> PathBuf {
        self.data_dir.join(HEADERS_FILE)
    }
}
