// src/config.rs
use crate::models::Cents;
use rust_decimal::Decimal;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEV_SESSION_SECRET: &str = "paper-trader-dev-secret";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub session_secret: String,
    pub session_ttl: Duration,
    pub starting_cash: Cents,
    pub bcrypt_cost: u32,
    pub alphavantage_api_key: Option<String>,
    pub quote_timeout: Duration,
}

impl Config {
    /// Reads settings from the process environment, after loading `.env` if present.
    pub fn from_env() -> Result<Config, ConfigError> {
        dotenv::dotenv().ok();

        let session_secret = match env::var("SESSION_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ if cfg!(debug_assertions) => DEV_SESSION_SECRET.to_string(),
            _ => return Err(ConfigError::Missing("SESSION_SECRET")),
        };

        let starting_cash: Decimal = parse_or("STARTING_CASH", Decimal::new(1_000_000, 2))?;
        let starting_cash = Cents::from_decimal(starting_cash)
            .filter(|cash| *cash >= Cents::ZERO)
            .ok_or_else(|| ConfigError::Invalid {
                key: "STARTING_CASH",
                value: starting_cash.to_string(),
            })?;

        let bcrypt_cost: u32 = parse_or("BCRYPT_COST", bcrypt::DEFAULT_COST)?;
        if !(4..=31).contains(&bcrypt_cost) {
            return Err(ConfigError::Invalid {
                key: "BCRYPT_COST",
                value: bcrypt_cost.to_string(),
            });
        }

        Ok(Config {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://finance.db?mode=rwc".to_string()),
            bind_addr: parse_or("BIND_ADDR", SocketAddr::from(([127, 0, 0, 1], 3030)))?,
            session_secret,
            session_ttl: Duration::from_secs(parse_or("SESSION_TTL_SECS", 86_400)?),
            starting_cash,
            bcrypt_cost,
            alphavantage_api_key: env::var("ALPHAVANTAGE_API_KEY")
                .ok()
                .filter(|key| !key.is_empty()),
            quote_timeout: Duration::from_secs(parse_or("QUOTE_TIMEOUT_SECS", 10)?),
        })
    }
}

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
impl Config {
    pub fn for_tests() -> Config {
        Config {
            database_url: "sqlite::memory:".to_string(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            session_secret: "test-secret".to_string(),
            session_ttl: Duration::from_secs(3600),
            starting_cash: Cents(1_000_000),
            bcrypt_cost: 4,
            alphavantage_api_key: None,
            quote_timeout: Duration::from_secs(1),
        }
    }
}
