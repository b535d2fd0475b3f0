/// Configuration management
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_DATA_DIR: &str = ".nutrisync";

/// Where conversations, messages and the outbound queue live
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreBackend {
    /// Embedded sled database (local development, tests)
    Sled { data_dir: PathBuf },
    /// Hosted relational store exposed over a PostgREST-style HTTP API
    Rest { base_url: String, api_key: String },
}

/// Session and store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Store backend
    pub store: StoreBackend,

    /// Messages per page, for both pagination and the newest-window poll
    pub page_size: usize,

    /// Poll interval while new messages keep arriving
    pub poll_interval: Duration,

    /// Upper bound for the poll backoff after empty or failed ticks
    pub max_poll_backoff: Duration,

    /// Timeout applied to every store request
    pub request_timeout: Duration,

    /// Consecutive failed ticks before the failure is surfaced to the view
    pub failure_surface_threshold: u32,

    /// How far apart an optimistic row and its authoritative copy may be in time
    pub optimistic_match_window: Duration,

    /// Queue priority for automated replies (lower = more urgent)
    pub default_priority: i32,

    /// Queue priority for replies written by a human operator
    pub operator_priority: i32,

    /// Length of the delivery window opened at `scheduled_for`
    pub delivery_window: Duration,

    /// Operator this console acts for
    pub operator_id: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreBackend::Sled {
                data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            },
            page_size: 30,
            poll_interval: Duration::from_secs(5),
            max_poll_backoff: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
            failure_surface_threshold: 3,
            optimistic_match_window: Duration::from_secs(120),
            default_priority: 5,
            operator_priority: 1,
            delivery_window: Duration::from_secs(24 * 60 * 60),
            operator_id: None,
        }
    }
}

impl Config {
    /// Parse flags from command line arguments.
    ///
    /// Returns the config plus every positional (non-flag) argument, in order.
    /// `args[0]` is the program name and is skipped.
    pub fn from_args(args: &[String]) -> Result<(Self, Vec<String>)> {
        let mut config = Self::default();
        let mut positional = Vec::new();
        let mut data_dir: Option<PathBuf> = None;
        let mut rest_url: Option<String> = None;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--data-dir" => {
                    let path = flag_value(args, i, "--data-dir requires a path argument")?;
                    data_dir = Some(PathBuf::from(path));
                    i += 2;
                }
                "--rest-url" => {
                    let url = flag_value(args, i, "--rest-url requires a URL argument")?;
                    rest_url = Some(url.to_string());
                    i += 2;
                }
                "--page-size" => {
                    let n = flag_value(args, i, "--page-size requires a number")?;
                    config.page_size = n.parse::<usize>().map_err(|_| {
                        SyncError::Config("--page-size must be a positive number".to_string())
                    })?;
                    i += 2;
                }
                "--poll-secs" => {
                    let n = flag_value(args, i, "--poll-secs requires a number")?;
                    config.poll_interval = parse_secs(n, "--poll-secs")?;
                    i += 2;
                }
                "--max-backoff-secs" => {
                    let n = flag_value(args, i, "--max-backoff-secs requires a number")?;
                    config.max_poll_backoff = parse_secs(n, "--max-backoff-secs")?;
                    i += 2;
                }
                "--operator" => {
                    let id = flag_value(args, i, "--operator requires an operator id")?;
                    config.operator_id = Some(id.to_string());
                    i += 2;
                }
                other => {
                    positional.push(other.to_string());
                    i += 1;
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(url) = std::env::var("NUTRISYNC_REST_URL") {
            rest_url = Some(url);
        }
        if let Ok(id) = std::env::var("NUTRISYNC_OPERATOR_ID") {
            config.operator_id = Some(id);
        }
        if let Some(secs) = std::env::var("NUTRISYNC_POLL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.poll_interval = Duration::from_secs(secs);
        }

        if let Some(base_url) = rest_url {
            let api_key = std::env::var("NUTRISYNC_API_KEY").map_err(|_| {
                SyncError::Config("NUTRISYNC_API_KEY must be set for the REST store".to_string())
            })?;
            config.store = StoreBackend::Rest { base_url, api_key };
        } else if let Some(data_dir) = data_dir {
            config.store = StoreBackend::Sled { data_dir };
        }

        if config.max_poll_backoff < config.poll_interval {
            config.max_poll_backoff = config.poll_interval;
        }

        config.validate()?;
        Ok((config, positional))
    }

    /// Reject values the scheduler and pager cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(SyncError::Config("page_size must be at least 1".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(SyncError::Config("poll_interval must be positive".to_string()));
        }
        if self.max_poll_backoff < self.poll_interval {
            return Err(SyncError::Config(
                "max_poll_backoff must not be shorter than poll_interval".to_string(),
            ));
        }
        if let StoreBackend::Rest { base_url, .. } = &self.store {
            if !base_url.starts_with("http://") {
                return Err(SyncError::Config(format!(
                    "REST store URL must be http:// (got {})",
                    base_url
                )));
            }
        }
        Ok(())
    }
}

fn flag_value<'a>(args: &'a [String], i: usize, missing: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| SyncError::Config(missing.to_string()))
}

fn parse_secs(value: &str, flag: &str) -> Result<Duration> {
    value
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| SyncError::Config(format!("{} must be a number of seconds", flag)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_from_args_flags_and_positionals() {
        let (config, rest) = Config::from_args(&args(&[
            "core",
            "client-42",
            "--data-dir",
            "/tmp/ns",
            "--page-size",
            "10",
            "--poll-secs",
            "2",
            "--operator",
            "op-7",
        ]))
        .unwrap();

        assert_eq!(rest, vec!["client-42".to_string()]);
        assert_eq!(config.page_size, 10);
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.operator_id.as_deref(), Some("op-7"));
        assert_eq!(
            config.store,
            StoreBackend::Sled {
                data_dir: PathBuf::from("/tmp/ns")
            }
        );
    }

    #[test]
    fn test_from_args_rejects_zero_page_size() {
        let result = Config::from_args(&args(&["core", "--page-size", "0"]));
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[test]
    fn test_from_args_missing_flag_value() {
        let result = Config::from_args(&args(&["core", "--data-dir"]));
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[test]
    fn test_backoff_is_raised_to_interval() {
        let (config, _) =
            Config::from_args(&args(&["core", "--poll-secs", "90", "--max-backoff-secs", "30"]))
                .unwrap();
        assert_eq!(config.max_poll_backoff, Duration::from_secs(90));
    }
}
