use std::time::Duration;

use crate::client::ServerEndpoint;
use crate::waiter::DEFAULT_COMPLETION_TIMEOUT;

/// Connection and job settings loaded from environment variables.
///
/// All fields have defaults suitable for a ComfyUI instance running on
/// the local machine.
#[derive(Debug, Clone, PartialEq)]
pub struct ComfyUIConfig {
    /// `host:port` of the ComfyUI server (default: `127.0.0.1:8188`).
    pub endpoint: String,
    /// Use `wss`/`https` (default: `false`).
    pub secure: bool,
    /// Deadline for a submitted prompt to finish (default: 300 s).
    pub completion_timeout: Duration,
    /// Randomize seeds before each submission (default: `true`).
    pub avoid_cache: bool,
}

/// An environment variable was set to something unusable.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

impl Default for ComfyUIConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:8188".into(),
            secure: false,
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
            avoid_cache: true,
        }
    }
}

impl ComfyUIConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                | Default          |
    /// |------------------------|------------------|
    /// | `COMFYUI_ENDPOINT`     | `127.0.0.1:8188` |
    /// | `COMFYUI_SECURE`       | `false`          |
    /// | `COMFYUI_TIMEOUT_SECS` | `300`            |
    /// | `COMFYUI_AVOID_CACHE`  | `true`           |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let endpoint = lookup("COMFYUI_ENDPOINT")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.endpoint);

        let secure = match lookup("COMFYUI_SECURE") {
            Some(value) => parse_bool("COMFYUI_SECURE", &value)?,
            None => defaults.secure,
        };

        let completion_timeout = match lookup("COMFYUI_TIMEOUT_SECS") {
            Some(value) => match value.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    return Err(ConfigError::Invalid {
                        var: "COMFYUI_TIMEOUT_SECS",
                        expected: "a positive number of seconds",
                        value,
                    })
                }
            },
            None => defaults.completion_timeout,
        };

        let avoid_cache = match lookup("COMFYUI_AVOID_CACHE") {
            Some(value) => parse_bool("COMFYUI_AVOID_CACHE", &value)?,
            None => defaults.avoid_cache,
        };

        Ok(Self {
            endpoint,
            secure,
            completion_timeout,
            avoid_cache,
        })
    }

    pub fn server_endpoint(&self) -> ServerEndpoint {
        ServerEndpoint::new(self.endpoint.clone(), self.secure)
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            expected: "a boolean",
            value: value.to_string(),
        }),
    }
}
