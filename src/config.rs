use crate::client::DEFAULT_REQUEST_TIMEOUT;
use crate::paths::default_token_path;
use crate::projection::DEFAULT_DISPLAY_COUNT;
use crate::scheduler::{DEFAULT_POLL_INTERVAL, PollSchedule};
use anyhow::{Context, Result, bail};
use log::{debug, info};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080/api";
pub const BASE_URL_ENV: &str = "CITOSCAN_API_URL";

/// Deserialized from TOML; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub base_url: Option<String>,
    pub poll_interval: Option<String>,
    pub request_timeout: Option<String>,
    pub display_count: Option<usize>,
    pub token_path: Option<PathBuf>,
}

/// Resolved settings with every value concrete.
#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: String,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub display_count: usize,
    pub token_path: PathBuf,
}

impl Config {
    pub fn poll_schedule(&self) -> PollSchedule {
        PollSchedule {
            every: self.poll_interval,
        }
    }
}

/// Values given on the command line; `None` leaves the file or default in place.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub base_url: Option<String>,
    pub poll_interval: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub display_count: Option<usize>,
}

impl ConfigFile {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("failed to parse config")
    }

    /// Missing file reads as all defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                info!("config: loaded {}", path.display());
                Self::parse(&text).with_context(|| format!("in {}", path.display()))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("config: {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(err) => {
                Err(err).with_context(|| format!("failed to read config {}", path.display()))
            }
        }
    }

    /// Applies defaults, then `env_base_url`, then `overrides`, and validates.
    pub fn resolve(self, env_base_url: Option<String>, overrides: Overrides) -> Result<Config> {
        let mut base_url = self
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        if let Some(url) = env_base_url.filter(|url| !url.trim().is_empty()) {
            debug!("config: {BASE_URL_ENV} override base_url={url}");
            base_url = url;
        }
        if let Some(url) = overrides.base_url {
            debug!("config: CLI override base_url={url}");
            base_url = url;
        }
        reqwest::Url::parse(&base_url).with_context(|| format!("invalid base_url {base_url}"))?;

        let poll_interval = match overrides.poll_interval {
            Some(every) => every,
            None => parse_duration_field("poll_interval", self.poll_interval)?
                .unwrap_or(DEFAULT_POLL_INTERVAL),
        };
        let request_timeout = match overrides.request_timeout {
            Some(timeout) => timeout,
            None => parse_duration_field("request_timeout", self.request_timeout)?
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        };
        let display_count = overrides
            .display_count
            .or(self.display_count)
            .unwrap_or(DEFAULT_DISPLAY_COUNT);

        if poll_interval.is_zero() {
            bail!("poll_interval must be greater than 0");
        }
        if request_timeout.is_zero() {
            bail!("request_timeout must be greater than 0");
        }
        if display_count == 0 {
            bail!("display_count must be greater than 0");
        }

        Ok(Config {
            base_url,
            poll_interval,
            request_timeout,
            display_count,
            token_path: self.token_path.unwrap_or_else(default_token_path),
        })
    }
}

fn parse_duration_field(name: &str, value: Option<String>) -> Result<Option<Duration>> {
    value
        .map(|raw| {
            humantime::parse_duration(raw.trim())
                .with_context(|| format!("invalid {name} {raw:?}"))
        })
        .transpose()
}
