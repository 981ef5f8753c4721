use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::audio::{BackendKind, CaptureSource};
use crate::error::{RelayError, Result};

/// Sample rates a session may run at.
pub const SUPPORTED_SAMPLE_RATES: [u32; 2] = [44_100, 48_000];

#[derive(Debug, Clone, Serialize)]
pub struct RelayConfig {
    // 引擎选择
    pub backend: BackendKind,
    pub native_sample_rate: u32,
    pub fallback_sample_rate: u32,

    // 帧缓冲大小 = 平台最小缓冲 × multiplier
    pub buffer_multiplier: usize,
    pub min_period_samples: usize,

    // 增益
    pub default_volume: f32,
    pub max_volume: f32,

    pub capture_source: CaptureSource,

    // 设备
    pub capture_device: String,
    pub playback_device: String,
    pub require_headset_output: bool,

    // 时序
    pub read_backoff: Duration,
    pub max_consecutive_errors: u32,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub realtime_priority: i32,
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RelayError::Config(format!("Failed to parse {} from {:?}", name, value)))
}

impl RelayConfig {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self> {
        let config = Self {
            backend: parse_env("RELAY_BACKEND", env!("RELAY_BACKEND"))?,
            native_sample_rate: parse_env(
                "RELAY_NATIVE_SAMPLE_RATE",
                env!("RELAY_NATIVE_SAMPLE_RATE"),
            )?,
            fallback_sample_rate: parse_env(
                "RELAY_FALLBACK_SAMPLE_RATE",
                env!("RELAY_FALLBACK_SAMPLE_RATE"),
            )?,
            buffer_multiplier: parse_env(
                "RELAY_BUFFER_MULTIPLIER",
                env!("RELAY_BUFFER_MULTIPLIER"),
            )?,
            min_period_samples: parse_env(
                "RELAY_MIN_PERIOD_SAMPLES",
                env!("RELAY_MIN_PERIOD_SAMPLES"),
            )?,
            default_volume: parse_env("RELAY_DEFAULT_VOLUME", env!("RELAY_DEFAULT_VOLUME"))?,
            max_volume: parse_env("RELAY_MAX_VOLUME", env!("RELAY_MAX_VOLUME"))?,
            capture_source: parse_env("RELAY_CAPTURE_SOURCE", env!("RELAY_CAPTURE_SOURCE"))?,

            capture_device: env!("CAPTURE_DEVICE").to_string(),
            playback_device: env!("PLAYBACK_DEVICE").to_string(),
            require_headset_output: parse_env(
                "REQUIRE_HEADSET_OUTPUT",
                env!("REQUIRE_HEADSET_OUTPUT"),
            )?,

            read_backoff: Duration::from_millis(parse_env(
                "READ_BACKOFF_MS",
                env!("READ_BACKOFF_MS"),
            )?),
            max_consecutive_errors: parse_env(
                "MAX_CONSECUTIVE_ERRORS",
                env!("MAX_CONSECUTIVE_ERRORS"),
            )?,
            start_timeout: Duration::from_millis(parse_env(
                "START_TIMEOUT_MS",
                env!("START_TIMEOUT_MS"),
            )?),
            stop_timeout: Duration::from_millis(parse_env(
                "STOP_TIMEOUT_MS",
                env!("STOP_TIMEOUT_MS"),
            )?),
            realtime_priority: parse_env("REALTIME_PRIORITY", env!("REALTIME_PRIORITY"))?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Values used when the build-time configuration cannot be parsed.
    pub fn builtin() -> Self {
        Self {
            backend: BackendKind::Native,
            native_sample_rate: 48_000,
            fallback_sample_rate: 44_100,
            buffer_multiplier: 2,
            min_period_samples: 256,
            default_volume: 1.0,
            max_volume: 4.0,
            capture_source: CaptureSource::Unprocessed,
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
            require_headset_output: false,
            read_backoff: Duration::from_millis(2),
            max_consecutive_errors: 50,
            start_timeout: Duration::from_millis(2000),
            stop_timeout: Duration::from_millis(500),
            realtime_priority: 80,
        }
    }

    /// Reject settings the relay cannot run with. Called before any port opens.
    pub fn validate(&self) -> Result<()> {
        for (name, rate) in [
            ("native_sample_rate", self.native_sample_rate),
            ("fallback_sample_rate", self.fallback_sample_rate),
        ] {
            if !SUPPORTED_SAMPLE_RATES.contains(&rate) {
                return Err(RelayError::Config(format!(
                    "{} must be one of {:?}, got {}",
                    name, SUPPORTED_SAMPLE_RATES, rate
                )));
            }
        }
        if self.buffer_multiplier == 0 {
            return Err(RelayError::Config("buffer_multiplier must be at least 1".into()));
        }
        if self.min_period_samples == 0 {
            return Err(RelayError::Config("min_period_samples must be at least 1".into()));
        }
        if !self.max_volume.is_finite() || self.max_volume <= 0.0 {
            return Err(RelayError::Config(format!(
                "max_volume must be a positive number, got {}",
                self.max_volume
            )));
        }
        if !self.default_volume.is_finite()
            || self.default_volume < 0.0
            || self.default_volume > self.max_volume
        {
            return Err(RelayError::Config(format!(
                "default_volume must lie in [0, {}], got {}",
                self.max_volume, self.default_volume
            )));
        }
        if self.max_consecutive_errors == 0 {
            return Err(RelayError::Config(
                "max_consecutive_errors must be at least 1".into(),
            ));
        }
        if self.read_backoff.is_zero() {
            return Err(RelayError::Config("read_backoff_ms must be at least 1".into()));
        }
        if self.stop_timeout.is_zero() || self.start_timeout.is_zero() {
            return Err(RelayError::Config("start/stop timeouts must be non-zero".into()));
        }
        Ok(())
    }

    pub fn sample_rate_for(&self, backend: BackendKind) -> u32 {
        match backend {
            BackendKind::Native => self.native_sample_rate,
            BackendKind::Fallback => self.fallback_sample_rate,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::new().unwrap_or_else(|e| {
            log::warn!("Invalid build-time relay configuration ({}), using built-in defaults", e);
            Self::builtin()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shipped_config_toml_is_valid() {
        let config = RelayConfig::new().expect("config.toml should parse");
        assert!(SUPPORTED_SAMPLE_RATES.contains(&config.native_sample_rate));
        assert!(config.buffer_multiplier >= 1);
    }

    #[test]
    fn builtin_defaults_validate() {
        let config = RelayConfig::builtin();
        config.validate().unwrap();
        assert_eq!(config.sample_rate_for(BackendKind::Native), 48_000);
        assert_eq!(config.sample_rate_for(BackendKind::Fallback), 44_100);
    }

    #[test]
    fn rejects_unsupported_sample_rate() {
        let mut config = RelayConfig::builtin();
        config.fallback_sample_rate = 22_050;
        assert!(matches!(config.validate(), Err(RelayError::Config(_))));
    }

    #[test]
    fn rejects_default_volume_above_ceiling() {
        let mut config = RelayConfig::builtin();
        config.default_volume = 8.0;
        assert!(matches!(config.validate(), Err(RelayError::Config(_))));

        config.default_volume = f32::NAN;
        assert!(matches!(config.validate(), Err(RelayError::Config(_))));
    }

    #[test]
    fn rejects_zero_multiplier() {
        let mut config = RelayConfig::builtin();
        config.buffer_multiplier = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::builtin();
        config.max_consecutive_errors = 0;
        assert!(matches!(config.validate(), Err(RelayError::Config(_))));

        let mut config = RelayConfig::builtin();
        config.read_backoff = Duration::ZERO;
        assert!(matches!(config.validate(), Err(RelayError::Config(_))));
    }
}
