use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, anyhow};

use crate::provider::DEFAULT_API_URL;
use crate::telemetry::LogFormat;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 15;
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MEETING_EXPIRY_MINS: u64 = 120;

/// Process configuration, read once at startup from the environment and `.env`.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub daily_api_key: String,
    pub daily_api_url: String,
    pub daily_hook_hmac: String,
    pub oc_public_key: String,
    pub oc_backend_url: String,
    pub reconcile_interval: Duration,
    pub call_timeout: Duration,
    pub meeting_expiry: Duration,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| anyhow!("{key} must be set"))
        };
        let parsed = |key: &str, default: u64| -> anyhow::Result<u64> {
            match lookup(key) {
                Some(value) => value.trim().parse().with_context(|| format!("{key} must be a whole number")),
                None => Ok(default),
            }
        };

        let port = match lookup("PORT") {
            Some(value) => value.trim().parse::<u16>().context("PORT must be a valid port number")?,
            None => DEFAULT_PORT,
        };
        let log_format = match lookup("LOG_FORMAT") {
            Some(value) => LogFormat::from_str(&value).map_err(|err| anyhow!("LOG_FORMAT: {err}"))?,
            None => LogFormat::default(),
        };

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            port,
            daily_api_key: required("DAILY_API_KEY")?,
            daily_api_url: lookup("DAILY_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_owned()),
            daily_hook_hmac: required("DAILY_HOOK_HMAC")?,
            oc_public_key: required("OC_PUBLIC")?,
            oc_backend_url: required("OC_BACKEND_URL")?,
            reconcile_interval: Duration::from_secs(parsed("RECONCILE_INTERVAL_SECS", DEFAULT_RECONCILE_INTERVAL_SECS)?),
            call_timeout: Duration::from_secs(parsed("CALL_TIMEOUT_SECS", DEFAULT_CALL_TIMEOUT_SECS)?),
            meeting_expiry: Duration::from_secs(60 * parsed("MEETING_EXPIRY_MINS", DEFAULT_MEETING_EXPIRY_MINS)?),
            log_format,
        })
    }
}
