use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{ProviderError, Result};

pub const DEFAULT_PORT: u16 = 8084;

const ENV_PREFIX: &str = "TRACEDX_";

/// Provider configuration. Every field can be set in the optional TOML file
/// and overridden by a `TRACEDX_`-prefixed environment variable carrying the
/// upper-snake-case field name, e.g. `TRACEDX_CODEC_RESPONSE_TIMEOUT_MS`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    /// JSON snapshot the in-memory store backend is seeded from.
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,

    #[serde(default = "default_codec_response_timeout_ms")]
    pub codec_response_timeout_ms: u64,
    #[serde(default = "default_codec_pending_batch_limit")]
    pub codec_pending_batch_limit: usize,
    #[serde(default)]
    pub codec_use_pin_attributes: bool,
    #[serde(default = "default_codec_request_thread_pool")]
    pub codec_request_thread_pool: usize,
    #[serde(default = "default_codec_callback_thread_pool")]
    pub codec_callback_thread_pool: usize,

    #[serde(default = "default_send_empty_delay_ms")]
    pub send_empty_delay_ms: u64,
    #[serde(default = "default_sse_event_search_step")]
    pub sse_event_search_step: usize,
    #[serde(default = "default_event_search_chunk_size")]
    pub event_search_chunk_size: usize,
    #[serde(default = "default_event_search_pipeline_buffer")]
    pub event_search_pipeline_buffer: usize,
    #[serde(default = "default_keep_alive_timeout_ms")]
    pub keep_alive_timeout_ms: u64,
    #[serde(default = "default_event_search_gap_ms")]
    pub event_search_gap_ms: u64,
    #[serde(default = "default_db_retry_delay_ms")]
    pub db_retry_delay_ms: u64,
    #[serde(default = "default_db_retry_attempts")]
    pub db_retry_attempts: u32,
    #[serde(default = "default_sse_search_delay_ms")]
    pub sse_search_delay_ms: u64,
    #[serde(default = "default_message_search_pipeline_buffer")]
    pub message_search_pipeline_buffer: usize,
    #[serde(default = "default_max_messages_limit")]
    pub max_messages_limit: usize,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_codec_response_timeout_ms() -> u64 {
    6_000
}

fn default_codec_pending_batch_limit() -> usize {
    16
}

fn default_codec_request_thread_pool() -> usize {
    4
}

fn default_codec_callback_thread_pool() -> usize {
    4
}

fn default_send_empty_delay_ms() -> u64 {
    100
}

fn default_sse_event_search_step() -> usize {
    200
}

fn default_event_search_chunk_size() -> usize {
    64
}

fn default_event_search_pipeline_buffer() -> usize {
    10
}

fn default_keep_alive_timeout_ms() -> u64 {
    5_000
}

fn default_event_search_gap_ms() -> u64 {
    60_000
}

fn default_db_retry_delay_ms() -> u64 {
    5_000
}

fn default_db_retry_attempts() -> u32 {
    5
}

fn default_sse_search_delay_ms() -> u64 {
    1_000
}

fn default_message_search_pipeline_buffer() -> usize {
    25
}

fn default_max_messages_limit() -> usize {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            snapshot_path: None,
            codec_response_timeout_ms: default_codec_response_timeout_ms(),
            codec_pending_batch_limit: default_codec_pending_batch_limit(),
            codec_use_pin_attributes: false,
            codec_request_thread_pool: default_codec_request_thread_pool(),
            codec_callback_thread_pool: default_codec_callback_thread_pool(),
            send_empty_delay_ms: default_send_empty_delay_ms(),
            sse_event_search_step: default_sse_event_search_step(),
            event_search_chunk_size: default_event_search_chunk_size(),
            event_search_pipeline_buffer: default_event_search_pipeline_buffer(),
            keep_alive_timeout_ms: default_keep_alive_timeout_ms(),
            event_search_gap_ms: default_event_search_gap_ms(),
            db_retry_delay_ms: default_db_retry_delay_ms(),
            db_retry_attempts: default_db_retry_attempts(),
            sse_search_delay_ms: default_sse_search_delay_ms(),
            message_search_pipeline_buffer: default_message_search_pipeline_buffer(),
            max_messages_limit: default_max_messages_limit(),
        }
    }
}

impl Config {
    pub fn codec_response_timeout(&self) -> Duration {
        Duration::from_millis(self.codec_response_timeout_ms)
    }

    pub fn send_empty_delay(&self) -> Duration {
        Duration::from_millis(self.send_empty_delay_ms)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms)
    }

    pub fn event_search_gap(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.event_search_gap_ms as i64)
    }

    pub fn db_retry_delay(&self) -> Duration {
        Duration::from_millis(self.db_retry_delay_ms)
    }

    pub fn sse_search_delay(&self) -> Duration {
        Duration::from_millis(self.sse_search_delay_ms)
    }

    /// All numeric knobs must be strictly positive.
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, u64); 13] = [
            ("codec_response_timeout_ms", self.codec_response_timeout_ms),
            (
                "codec_pending_batch_limit",
                self.codec_pending_batch_limit as u64,
            ),
            (
                "codec_request_thread_pool",
                self.codec_request_thread_pool as u64,
            ),
            (
                "codec_callback_thread_pool",
                self.codec_callback_thread_pool as u64,
            ),
            ("send_empty_delay_ms", self.send_empty_delay_ms),
            ("sse_event_search_step", self.sse_event_search_step as u64),
            (
                "event_search_chunk_size",
                self.event_search_chunk_size as u64,
            ),
            (
                "event_search_pipeline_buffer",
                self.event_search_pipeline_buffer as u64,
            ),
            ("keep_alive_timeout_ms", self.keep_alive_timeout_ms),
            ("db_retry_delay_ms", self.db_retry_delay_ms),
            ("sse_search_delay_ms", self.sse_search_delay_ms),
            (
                "message_search_pipeline_buffer",
                self.message_search_pipeline_buffer as u64,
            ),
            ("max_messages_limit", self.max_messages_limit as u64),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(ProviderError::Config(format!(
                    "{name} must be a positive number"
                )));
            }
        }
        if self.db_retry_attempts == 0 {
            return Err(ProviderError::Config(
                "db_retry_attempts must be a positive number".into(),
            ));
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<()> {
        apply_env_u16(&mut self.port, "PORT")?;
        if let Some(path) = env_var("SNAPSHOT_PATH") {
            self.snapshot_path = Some(PathBuf::from(path));
        }
        apply_env_u64(
            &mut self.codec_response_timeout_ms,
            "CODEC_RESPONSE_TIMEOUT_MS",
        )?;
        apply_env_usize(
            &mut self.codec_pending_batch_limit,
            "CODEC_PENDING_BATCH_LIMIT",
        )?;
        apply_env_bool(
            &mut self.codec_use_pin_attributes,
            "CODEC_USE_PIN_ATTRIBUTES",
        )?;
        apply_env_usize(
            &mut self.codec_request_thread_pool,
            "CODEC_REQUEST_THREAD_POOL",
        )?;
        apply_env_usize(
            &mut self.codec_callback_thread_pool,
            "CODEC_CALLBACK_THREAD_POOL",
        )?;
        apply_env_u64(&mut self.send_empty_delay_ms, "SEND_EMPTY_DELAY_MS")?;
        apply_env_usize(&mut self.sse_event_search_step, "SSE_EVENT_SEARCH_STEP")?;
        apply_env_usize(&mut self.event_search_chunk_size, "EVENT_SEARCH_CHUNK_SIZE")?;
        apply_env_usize(
            &mut self.event_search_pipeline_buffer,
            "EVENT_SEARCH_PIPELINE_BUFFER",
        )?;
        apply_env_u64(&mut self.keep_alive_timeout_ms, "KEEP_ALIVE_TIMEOUT_MS")?;
        apply_env_u64(&mut self.event_search_gap_ms, "EVENT_SEARCH_GAP_MS")?;
        apply_env_u64(&mut self.db_retry_delay_ms, "DB_RETRY_DELAY_MS")?;
        apply_env_u32(&mut self.db_retry_attempts, "DB_RETRY_ATTEMPTS")?;
        apply_env_u64(&mut self.sse_search_delay_ms, "SSE_SEARCH_DELAY_MS")?;
        apply_env_usize(
            &mut self.message_search_pipeline_buffer,
            "MESSAGE_SEARCH_PIPELINE_BUFFER",
        )?;
        apply_env_usize(&mut self.max_messages_limit, "MAX_MESSAGES_LIMIT")?;
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim().parse::<T>().map_err(|_| {
        ProviderError::Config(format!("invalid value '{raw}' for {ENV_PREFIX}{name}"))
    })
}

fn apply_env_u64(target: &mut u64, name: &str) -> Result<()> {
    if let Some(raw) = env_var(name) {
        *target = parse_env(name, &raw)?;
    }
    Ok(())
}

fn apply_env_u32(target: &mut u32, name: &str) -> Result<()> {
    if let Some(raw) = env_var(name) {
        *target = parse_env(name, &raw)?;
    }
    Ok(())
}

fn apply_env_u16(target: &mut u16, name: &str) -> Result<()> {
    if let Some(raw) = env_var(name) {
        *target = parse_env(name, &raw)?;
    }
    Ok(())
}

fn apply_env_usize(target: &mut usize, name: &str) -> Result<()> {
    if let Some(raw) = env_var(name) {
        *target = parse_env(name, &raw)?;
    }
    Ok(())
}

fn apply_env_bool(target: &mut bool, name: &str) -> Result<()> {
    if let Some(raw) = env_var(name) {
        *target = match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            other => {
                return Err(ProviderError::Config(format!(
                    "invalid value '{other}' for {ENV_PREFIX}{name}"
                )));
            }
        };
    }
    Ok(())
}

/// Load the configuration file when present, fall back to defaults otherwise,
/// then apply environment overrides and validate.
pub fn load_or_default(path: Option<PathBuf>) -> Result<Config> {
    let mut config = match path {
        Some(path) if path.exists() => {
            let contents = fs::read_to_string(&path)?;
            toml::from_str(&contents)?
        }
        Some(path) => {
            return Err(ProviderError::Config(format!(
                "configuration file {} does not exist",
                path.display()
            )));
        }
        None => Config::default(),
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn zero_knob_is_rejected() {
        let config = Config {
            send_empty_delay_ms: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_values_survive_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = 9191\nmax_messages_limit = 42").unwrap();
        let config = load_or_default(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.port, 9191);
        assert_eq!(config.max_messages_limit, 42);
        assert_eq!(
            config.codec_pending_batch_limit,
            default_codec_pending_batch_limit()
        );
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_or_default(Some(PathBuf::from("/definitely/not/here.toml"))).is_err());
    }
}
