//! Runtime configuration.
//!
//! Everything is read from the process environment once at startup (the
//! binary loads a `.env` file first, if present). Credentials are optional;
//! without them the bridge waits for a manual `POST /auth/login`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::warn;

use crate::auth::Credentials;

/// Application name used for the default data directory
const APP_NAME: &str = "monarch-bridge";

/// Session file name inside the default data directory
const SESSION_FILE_NAME: &str = "session.json";

/// Keep-alive interval in seconds. The remote drops idle sessions after
/// roughly an hour.
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 900;

/// Upper bound for any single remote call, in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";

pub const DEFAULT_API_URL: &str = "https://api.monarchmoney.com";

#[derive(Debug, Clone)]
pub struct Config {
    pub credentials: Option<Credentials>,
    pub session_file: PathBuf,
    pub keep_alive_interval: Duration,
    pub request_timeout: Duration,
    pub bind_addr: String,
    pub api_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let credentials = match (get("MONARCH_EMAIL"), get("MONARCH_PASSWORD")) {
            (Some(email), Some(password)) => {
                let mut creds = Credentials::new(email, password);
                creds.mfa_secret = get("MONARCH_MFA_SECRET");
                Some(creds)
            }
            (Some(_), None) | (None, Some(_)) => {
                warn!("Only one of MONARCH_EMAIL / MONARCH_PASSWORD is set; automatic login disabled");
                None
            }
            (None, None) => None,
        };

        let session_file = match get("SESSION_FILE") {
            Some(path) => PathBuf::from(path),
            None => default_session_file(),
        };

        let keep_alive_interval =
            parse_secs(get("KEEP_ALIVE_INTERVAL"), DEFAULT_KEEP_ALIVE_SECS, "KEEP_ALIVE_INTERVAL")?;
        let request_timeout = parse_secs(
            get("REQUEST_TIMEOUT"),
            DEFAULT_REQUEST_TIMEOUT_SECS,
            "REQUEST_TIMEOUT",
        )?;

        Ok(Self {
            credentials,
            session_file,
            keep_alive_interval,
            request_timeout,
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            api_url: get("MONARCH_API_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
        })
    }
}

fn parse_secs(raw: Option<String>, default: u64, name: &str) -> Result<Duration> {
    let secs = match raw {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("{} must be a whole number of seconds", name))?,
        None => default,
    };
    if secs == 0 {
        bail!("{} must be greater than zero", name);
    }
    Ok(Duration::from_secs(secs))
}

fn default_session_file() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join(APP_NAME))
        .unwrap_or_else(|| PathBuf::from("./data"))
        .join(SESSION_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert!(config.credentials.is_none());
        assert_eq!(config.keep_alive_interval, Duration::from_secs(900));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR);
        assert!(config.session_file.ends_with("session.json"));
    }

    #[test]
    fn test_credentials_and_secret() {
        let config = config_from(&[
            ("MONARCH_EMAIL", "me@example.com"),
            ("MONARCH_PASSWORD", "pw"),
            ("MONARCH_MFA_SECRET", "JBSWY3DPEHPK3PXP"),
            ("SESSION_FILE", "/data/session.json"),
        ])
        .unwrap();
        let creds = config.credentials.unwrap();
        assert_eq!(creds.email, "me@example.com");
        assert_eq!(creds.mfa_secret.as_deref(), Some("JBSWY3DPEHPK3PXP"));
        assert_eq!(config.session_file, PathBuf::from("/data/session.json"));
    }

    #[test]
    fn test_partial_credentials_are_ignored() {
        let config = config_from(&[("MONARCH_EMAIL", "me@example.com")]).unwrap();
        assert!(config.credentials.is_none());

        let config = config_from(&[("MONARCH_EMAIL", "me@example.com"), ("MONARCH_PASSWORD", " ")])
            .unwrap();
        assert!(config.credentials.is_none());
    }

    #[test]
    fn test_invalid_intervals() {
        assert!(config_from(&[("KEEP_ALIVE_INTERVAL", "soon")]).is_err());
        assert!(config_from(&[("REQUEST_TIMEOUT", "0")]).is_err());
        let config = config_from(&[("KEEP_ALIVE_INTERVAL", "60")]).unwrap();
        assert_eq!(config.keep_alive_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_api_url_trailing_slash() {
        let config = config_from(&[("MONARCH_API_URL", "http://localhost:9000/")]).unwrap();
        assert_eq!(config.api_url, "http://localhost:9000");
    }
}
