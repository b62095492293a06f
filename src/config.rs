use std::env;
use std::time::Duration;

use crate::engine::EngineSettings;
use crate::error::AppError;
use crate::notify::DEFAULT_INBOX_CAPACITY;

/// Upper bound for `NO_ANSWER_TIMEOUT_SECS`, one day.
pub const MAX_NO_ANSWER_TIMEOUT_SECS: i64 = 86_400;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub event_buffer_size: usize,
    pub inbox_capacity: usize,
    pub match_radius_degrees: f64,
    pub no_answer_timeout_secs: i64,
    pub sweep_interval_secs: u64,
    pub tx_timeout_ms: u64,
    pub wide_tx_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            event_buffer_size: 1024,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            match_radius_degrees: 0.01,
            no_answer_timeout_secs: 300,
            sweep_interval_secs: 30,
            tx_timeout_ms: 10_000,
            wide_tx_timeout_ms: 30_000,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        let config = Self {
            http_port: parse_or_default("HTTP_PORT", defaults.http_port)?,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", defaults.event_buffer_size)?,
            inbox_capacity: parse_or_default("INBOX_CAPACITY", defaults.inbox_capacity)?,
            match_radius_degrees: parse_or_default(
                "MATCH_RADIUS_DEGREES",
                defaults.match_radius_degrees,
            )?,
            no_answer_timeout_secs: parse_or_default(
                "NO_ANSWER_TIMEOUT_SECS",
                defaults.no_answer_timeout_secs,
            )?,
            sweep_interval_secs: parse_or_default("SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs)?,
            tx_timeout_ms: parse_or_default("TX_TIMEOUT_MS", defaults.tx_timeout_ms)?,
            wide_tx_timeout_ms: parse_or_default("WIDE_TX_TIMEOUT_MS", defaults.wide_tx_timeout_ms)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if !self.match_radius_degrees.is_finite() || self.match_radius_degrees <= 0.0 {
            return Err(AppError::Internal(
                "MATCH_RADIUS_DEGREES must be a positive number".to_string(),
            ));
        }
        if self.no_answer_timeout_secs <= 0 || self.no_answer_timeout_secs > MAX_NO_ANSWER_TIMEOUT_SECS {
            return Err(AppError::Internal(format!(
                "NO_ANSWER_TIMEOUT_SECS must be in 1..={MAX_NO_ANSWER_TIMEOUT_SECS}"
            )));
        }
        if self.inbox_capacity == 0 {
            return Err(AppError::Internal("INBOX_CAPACITY must be > 0".to_string()));
        }
        if self.sweep_interval_secs == 0 || self.tx_timeout_ms == 0 || self.wide_tx_timeout_ms == 0 {
            return Err(AppError::Internal(
                "sweep interval and transaction timeouts must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            match_radius_degrees: self.match_radius_degrees,
            no_answer_timeout: chrono::Duration::try_seconds(self.no_answer_timeout_secs)
                .unwrap_or_else(|| EngineSettings::default().no_answer_timeout),
            tx_timeout: Duration::from_millis(self.tx_timeout_ms),
            wide_tx_timeout: Duration::from_millis(self.wide_tx_timeout_ms),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, MAX_NO_ANSWER_TIMEOUT_SECS};

    #[test]
    fn defaults_pass_validation() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn non_positive_radius_is_rejected() {
        let config = Config {
            match_radius_degrees: 0.0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn engine_settings_carry_the_timeouts() {
        let settings = Config::default().engine_settings();
        assert_eq!(settings.tx_timeout.as_millis(), 10_000);
        assert_eq!(settings.wide_tx_timeout.as_millis(), 30_000);
        assert_eq!(settings.no_answer_timeout.num_seconds(), 300);
    }

    #[test]
    fn out_of_range_no_answer_timeout_is_rejected() {
        let config = Config {
            no_answer_timeout_secs: i64::MAX,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            no_answer_timeout_secs: MAX_NO_ANSWER_TIMEOUT_SECS,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unrepresentable_timeout_falls_back_to_the_default() {
        let settings = Config {
            no_answer_timeout_secs: i64::MAX,
            ..Config::default()
        }
        .engine_settings();
        assert_eq!(settings.no_answer_timeout.num_seconds(), 300);
    }
}
