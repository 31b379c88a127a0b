use dotenvy::dotenv;
use std::env;
use thiserror::Error;

use crate::models::BrokerTarget;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,

    pub mqtt_host: String,
    pub mqtt_port: String,
    pub mqtt_username: String,
    pub mqtt_password: String,
    pub mqtt_client_id: String,

    /// Topics subscribed at startup, merged into the stored topic list.
    pub startup_topics: Vec<String>,

    pub route_service_url: String,
    pub route_timeout_ms: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Config {
    /// Bounds-check the route lookup timeout.
    fn validate_timeouts(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;

        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.route_timeout_ms) {
            return Err(ConfigError::ParsingError(format!(
                "ROUTE_TIMEOUT_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file

        let config = Self {
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "fleet_telemetry.db".to_string()),

            // May stay empty for one-shot commands; required before connecting.
            mqtt_host: env::var("MQTT_HOST").unwrap_or_default(),
            // Kept as the raw string; the session validates it at connect time.
            mqtt_port: env::var("MQTT_PORT").unwrap_or_else(|_| "1883".to_string()),
            mqtt_username: env::var("MQTT_USERNAME").unwrap_or_default(),
            mqtt_password: env::var("MQTT_PASSWORD").unwrap_or_default(),
            mqtt_client_id: env::var("MQTT_CLIENT_ID").unwrap_or_default(),

            startup_topics: env::var("MQTT_TOPICS")
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),

            route_service_url: env::var("ROUTE_SERVICE_URL")
                .unwrap_or_else(|_| "https://router.project-osrm.org".to_string()),
            route_timeout_ms: env::var("ROUTE_TIMEOUT_MS")
                .unwrap_or_else(|_| "10000".to_string())
                .parse::<u64>()
                .map_err(|_| {
                    ConfigError::ParsingError("ROUTE_TIMEOUT_MS must be a valid number".to_string())
                })?,
        };

        config.validate_timeouts()?;

        Ok(config)
    }

    /// The broker target described by the environment, used for the
    /// automatic connection at startup.
    pub fn default_broker(&self) -> BrokerTarget {
        BrokerTarget {
            name: "default".to_string(),
            host: self.mqtt_host.clone(),
            port: self.mqtt_port.clone(),
            username: self.mqtt_username.clone(),
            password: self.mqtt_password.clone(),
            client_id: self.mqtt_client_id.clone(),
        }
    }
}
