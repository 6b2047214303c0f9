use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use naturalis_comfyui::job::{JobOptions, SideArtifact};
use naturalis_comfyui::reconnect::ReconnectConfig;
use naturalis_comfyui::session::SessionConfig;

/// Worker configuration loaded from environment variables.
///
/// All fields have defaults suitable for a ComfyUI instance on the same
/// machine.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// `host:port` of the ComfyUI server (default: `127.0.0.1:8188`).
    pub comfyui_address: String,
    /// Bound on each `POST /prompt` request (default: 30 s).
    pub enqueue_timeout: Duration,
    pub session: SessionConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                   | Default          |
    /// |---------------------------|------------------|
    /// | `COMFYUI_ADDRESS`         | `127.0.0.1:8188` |
    /// | `ENQUEUE_TIMEOUT_SECS`    | `30`             |
    /// | `COMPLETION_TIMEOUT_SECS` | `600` (`0` = no limit) |
    /// | `RECONNECT_DELAY_MS`      | `1000`           |
    /// | `JOB_RETRIES`             | `1`              |
    /// | `PROBE_BEFORE_JOB`        | `true`           |
    /// | `SIDE_ARTIFACT_PATH`      | unset            |
    /// | `CLEAR_SIDE_ARTIFACT`     | `false`          |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let comfyui_address = lookup("COMFYUI_ADDRESS")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "127.0.0.1:8188".into());

        let enqueue_timeout_secs: u64 = parse_var(
            &lookup,
            "ENQUEUE_TIMEOUT_SECS",
            30,
            "a positive number of seconds",
        )?;
        if enqueue_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "ENQUEUE_TIMEOUT_SECS",
                value: "0".into(),
                expected: "a positive number of seconds",
            });
        }

        let timeout_secs: u64 = parse_var(
            &lookup,
            "COMPLETION_TIMEOUT_SECS",
            600,
            "a whole number of seconds",
        )?;
        let delay_ms: u64 = parse_var(
            &lookup,
            "RECONNECT_DELAY_MS",
            1000,
            "a whole number of milliseconds",
        )?;
        let max_job_retries: u32 =
            parse_var(&lookup, "JOB_RETRIES", 1, "a non-negative integer")?;
        let probe_before_job = parse_flag(&lookup, "PROBE_BEFORE_JOB", true)?;
        let clear_before_submit = parse_flag(&lookup, "CLEAR_SIDE_ARTIFACT", false)?;

        let side_artifact = lookup("SIDE_ARTIFACT_PATH")
            .filter(|s| !s.trim().is_empty())
            .map(|path| SideArtifact {
                path: PathBuf::from(path.trim()),
                clear_before_submit,
            });

        Ok(Self {
            comfyui_address,
            enqueue_timeout: Duration::from_secs(enqueue_timeout_secs),
            session: SessionConfig {
                reconnect: ReconnectConfig {
                    delay: Duration::from_millis(delay_ms),
                    max_job_retries,
                },
                probe_before_job,
                job: JobOptions {
                    completion_timeout: (timeout_secs > 0)
                        .then(|| Duration::from_secs(timeout_secs)),
                    side_artifact,
                },
            },
        })
    }

    /// WebSocket base URL, e.g. `ws://127.0.0.1:8188`.
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.comfyui_address)
    }

    /// REST base URL, e.g. `http://127.0.0.1:8188`.
    pub fn api_url(&self) -> String {
        format!("http://{}", self.comfyui_address)
    }
}

fn parse_var<F, T>(
    lookup: &F,
    var: &'static str,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            var,
            value,
            expected,
        }),
    }
}

fn parse_flag<F>(lookup: &F, var: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(var) else {
        return Ok(default);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value,
            expected: "a boolean (true/false)",
        }),
    }
}
