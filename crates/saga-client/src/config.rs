use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use saga_realtime::health::HealthConfig;
use saga_realtime::turn::TurnConfig;
use saga_realtime::SupervisorConfig;
use saga_sync::{ActionsConfig, HistoryConfig};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub store_url: String,
    pub api_key: String,
    pub db_path: PathBuf,
    pub max_reconnect_attempts: u32,
    pub health_interval: Duration,
    pub history_limit: usize,
    pub turn_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            store_url: "http://localhost:54321".into(),
            api_key: String::new(),
            db_path: PathBuf::from("saga.db"),
            max_reconnect_attempts: 5,
            health_interval: Duration::from_secs(300),
            history_limit: saga_sync::history::DEFAULT_HISTORY_LIMIT,
            turn_timeout: Duration::from_secs(45),
        }
    }
}

impl ClientConfig {
    /// Reads `SAGA_*` variables. Call `dotenvy::dotenv()` first to pick up a
    /// `.env` file.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            store_url: lookup("SAGA_STORE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.store_url),
            api_key: lookup("SAGA_API_KEY").unwrap_or(defaults.api_key),
            db_path: lookup("SAGA_DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            max_reconnect_attempts: parse(&lookup, "SAGA_MAX_RECONNECT_ATTEMPTS", defaults.max_reconnect_attempts)?,
            health_interval: Duration::from_secs(parse(
                &lookup,
                "SAGA_HEALTH_INTERVAL_SECS",
                defaults.health_interval.as_secs(),
            )?),
            history_limit: parse(&lookup, "SAGA_HISTORY_LIMIT", defaults.history_limit)?,
            turn_timeout: Duration::from_secs(parse(
                &lookup,
                "SAGA_TURN_TIMEOUT_SECS",
                defaults.turn_timeout.as_secs(),
            )?),
        })
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            max_attempts: self.max_reconnect_attempts,
            ..SupervisorConfig::default()
        }
    }

    pub fn health(&self) -> HealthConfig {
        HealthConfig {
            interval: self.health_interval,
            ..HealthConfig::default()
        }
    }

    pub fn history(&self) -> HistoryConfig {
        HistoryConfig {
            limit: self.history_limit,
        }
    }

    pub fn turn(&self) -> TurnConfig {
        TurnConfig {
            timeout: self.turn_timeout,
        }
    }

    pub fn actions(&self) -> ActionsConfig {
        ActionsConfig::default()
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().with_context(|| format!("invalid {key}: {raw:?}")),
        None => Ok(default),
    }
}
