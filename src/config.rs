use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

pub const DEFAULT_GEOCODE_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/geocode/json";
const DEFAULT_PACING_MS: u64 = 200;
const MAX_PACING_MS: u64 = 10_000;
const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
const DEFAULT_FAILURE_SUMMARY_LIMIT: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PacingStrategy {
    Fixed,
    Backoff,
}

impl PacingStrategy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fixed" => Some(PacingStrategy::Fixed),
            "backoff" => Some(PacingStrategy::Backoff),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub geocode_endpoint: String,
    pub geocode_pacing_ms: u64,
    pub geocode_pacing: PacingStrategy,
    pub geocode_timeout_secs: u64,
    pub geocode_backoff_max_ms: u64,
    pub failure_summary_limit: usize,
    pub google_maps_api_key: Option<SecretString>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub geocode_endpoint: String,
    pub geocode_pacing_ms: u64,
    pub geocode_pacing: PacingStrategy,
    pub geocode_timeout_secs: u64,
    pub geocode_backoff_max_ms: u64,
    pub failure_summary_limit: usize,
    pub has_google_maps_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            geocode_endpoint: env::var("GEOCODE_ENDPOINT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_GEOCODE_ENDPOINT.to_string()),
            geocode_pacing_ms: parse_u64("GEOCODE_PACING_MS", DEFAULT_PACING_MS)
                .min(MAX_PACING_MS),
            geocode_pacing: env::var("GEOCODE_PACING")
                .ok()
                .and_then(|v| PacingStrategy::parse(&v))
                .unwrap_or(PacingStrategy::Fixed),
            geocode_timeout_secs: parse_u64("GEOCODE_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS).max(1),
            geocode_backoff_max_ms: parse_u64("GEOCODE_BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS),
            failure_summary_limit: parse_usize(
                "FAILURE_SUMMARY_LIMIT",
                DEFAULT_FAILURE_SUMMARY_LIMIT,
            ),
            google_maps_api_key: env::var("GOOGLE_MAPS_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(|v| SecretString::new(v.into())),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            geocode_endpoint: self.geocode_endpoint.clone(),
            geocode_pacing_ms: self.geocode_pacing_ms,
            geocode_pacing: self.geocode_pacing,
            geocode_timeout_secs: self.geocode_timeout_secs,
            geocode_backoff_max_ms: self.geocode_backoff_max_ms,
            failure_summary_limit: self.failure_summary_limit,
            has_google_maps_key: self.google_maps_api_key.is_some(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            geocode_endpoint: DEFAULT_GEOCODE_ENDPOINT.to_string(),
            geocode_pacing_ms: DEFAULT_PACING_MS,
            geocode_pacing: PacingStrategy::Fixed,
            geocode_timeout_secs: DEFAULT_TIMEOUT_SECS,
            geocode_backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            failure_summary_limit: DEFAULT_FAILURE_SUMMARY_LIMIT,
            google_maps_api_key: None,
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}
