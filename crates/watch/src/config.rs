use std::time::Duration;

use jobsync_client::config::ConnectionConfig;
use jobsync_client::poller::PollConfig;
use jobsync_client::reconnect::ReconnectPolicy;
use jobsync_client::tracker::PollMode;

/// Daemon configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Job stream WebSocket URL.
    pub ws_url: String,
    /// Job status REST collection URL.
    pub api_url: String,
    /// Jobs to watch, in the order given.
    pub job_ids: Vec<String>,
    pub connection: ConnectionConfig,
    pub poll: PollConfig,
    pub poll_mode: PollMode,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("{var} has invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl WatchConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                          | Default    |
    /// |----------------------------------|------------|
    /// | `JOBSYNC_WS_URL`                 | required   |
    /// | `JOBSYNC_API_URL`                | required   |
    /// | `JOBSYNC_JOB_IDS`                | required (comma separated) |
    /// | `JOBSYNC_AUTH_TOKEN`             | none       |
    /// | `JOBSYNC_HEARTBEAT_SECS`         | `30`       |
    /// | `JOBSYNC_PONG_TIMEOUT_SECS`      | `5`        |
    /// | `JOBSYNC_RECONNECT_INITIAL_MS`   | `1000`     |
    /// | `JOBSYNC_RECONNECT_MAX_MS`       | `30000`    |
    /// | `JOBSYNC_RECONNECT_MULTIPLIER`   | `1.5`      |
    /// | `JOBSYNC_RECONNECT_MAX_ATTEMPTS` | `10`       |
    /// | `JOBSYNC_QUEUE_CAPACITY`         | `100`      |
    /// | `JOBSYNC_POLL_INTERVAL_SECS`     | `3`        |
    /// | `JOBSYNC_POLL_MODE`              | `fallback` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &'static str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |var: &'static str| get(var).ok_or(ConfigError::Missing(var));

        let ws_url = required("JOBSYNC_WS_URL")?;
        let api_url = required("JOBSYNC_API_URL")?;

        let job_ids: Vec<String> = required("JOBSYNC_JOB_IDS")?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if job_ids.is_empty() {
            return Err(ConfigError::Missing("JOBSYNC_JOB_IDS"));
        }

        let heartbeat_secs: u64 = parse_or(&get, "JOBSYNC_HEARTBEAT_SECS", 30)?;
        let pong_timeout_secs: u64 = parse_or(&get, "JOBSYNC_PONG_TIMEOUT_SECS", 5)?;
        let initial_ms: u64 = parse_or(&get, "JOBSYNC_RECONNECT_INITIAL_MS", 1000)?;
        let max_ms: u64 = parse_or(&get, "JOBSYNC_RECONNECT_MAX_MS", 30_000)?;
        let multiplier: f64 = parse_or(&get, "JOBSYNC_RECONNECT_MULTIPLIER", 1.5)?;
        let max_attempts: u32 = parse_or(&get, "JOBSYNC_RECONNECT_MAX_ATTEMPTS", 10)?;
        let queue_capacity: usize = parse_or(&get, "JOBSYNC_QUEUE_CAPACITY", 100)?;
        let poll_secs: u64 = parse_or(&get, "JOBSYNC_POLL_INTERVAL_SECS", 3)?;

        ensure_positive("JOBSYNC_HEARTBEAT_SECS", heartbeat_secs)?;
        ensure_positive("JOBSYNC_PONG_TIMEOUT_SECS", pong_timeout_secs)?;
        ensure_positive("JOBSYNC_POLL_INTERVAL_SECS", poll_secs)?;
        if !(multiplier.is_finite() && multiplier >= 1.0) {
            return Err(ConfigError::Invalid {
                var: "JOBSYNC_RECONNECT_MULTIPLIER",
                value: multiplier.to_string(),
                reason: "must be at least 1.0".into(),
            });
        }

        let poll_mode = match get("JOBSYNC_POLL_MODE") {
            None => PollMode::default(),
            Some(value) => PollMode::parse(&value).ok_or_else(|| ConfigError::Invalid {
                var: "JOBSYNC_POLL_MODE",
                value,
                reason: "expected 'fallback' or 'always'".into(),
            })?,
        };

        let mut connection = ConnectionConfig::new(ws_url.clone())
            .with_heartbeat(
                Duration::from_secs(heartbeat_secs),
                Duration::from_secs(pong_timeout_secs),
            )
            .with_reconnect(ReconnectPolicy {
                initial_delay: Duration::from_millis(initial_ms),
                max_delay: Duration::from_millis(max_ms),
                multiplier,
                max_attempts,
            })
            .with_queue_capacity(queue_capacity);
        if let Some(token) = get("JOBSYNC_AUTH_TOKEN") {
            connection = connection.with_auth_token(token);
        }

        Ok(Self {
            ws_url,
            api_url,
            job_ids,
            connection,
            poll: PollConfig {
                interval: Duration::from_secs(poll_secs),
            },
            poll_mode,
        })
    }
}

fn parse_or<T>(
    get: &impl Fn(&'static str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(var) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn ensure_positive(var: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(())
}
