use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::aggregate::{default_required_columns, DEFAULT_BATCH_ROWS};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub workers: usize,
    pub retry: RetryPolicy,
    pub required_columns: Vec<String>,
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
    pub batch_rows: usize,
    pub port: u16,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 4,
            retry: RetryPolicy::default(),
            required_columns: default_required_columns(),
            upload_dir: PathBuf::from("data/uploads"),
            output_dir: PathBuf::from("data/outputs"),
            batch_rows: DEFAULT_BATCH_ROWS,
            port: 3600,
        }
    }
}

impl Config {
    /// Reads overrides from the environment. Unset variables keep their
    /// defaults; set but unparsable ones are an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let workers = parse_positive(&lookup, "SALESAGG_WORKERS", defaults.workers)?;
        let attempts = parse_positive(&lookup, "SALESAGG_RETRIES", defaults.retry.max_attempts)?;
        let delay_ms = parse_or(
            &lookup,
            "SALESAGG_RETRY_DELAY_MS",
            defaults.retry.delay.as_millis() as u64,
        )?;
        let batch_rows = parse_positive(&lookup, "SALESAGG_BATCH_ROWS", defaults.batch_rows)?;
        let port = parse_or(&lookup, "PORT", defaults.port)?;

        let required_columns = match lookup("SALESAGG_REQUIRED_COLUMNS") {
            Some(raw) => {
                let columns: Vec<String> = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|column| !column.is_empty())
                    .map(str::to_owned)
                    .collect();
                if columns.is_empty() {
                    return Err(ConfigError::Invalid {
                        name: "SALESAGG_REQUIRED_COLUMNS",
                        reason: "no column names given".to_owned(),
                    });
                }
                columns
            }
            None => defaults.required_columns,
        };

        let upload_dir = lookup("SALESAGG_UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.upload_dir);
        let output_dir = lookup("SALESAGG_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.output_dir);

        Ok(Config {
            workers,
            retry: RetryPolicy::new(attempts, Duration::from_millis(delay_ms)),
            required_columns,
            upload_dir,
            output_dir,
            batch_rows,
            port,
        })
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_positive<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let value = parse_or(lookup, name, default)?;
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            name,
            reason: "must be greater than zero".to_owned(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.workers, 4);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.delay, Duration::from_secs(2));
        assert_eq!(
            config.required_columns,
            vec!["Department Name", "Date", "Number of Sales"]
        );
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("SALESAGG_WORKERS", "8"),
            ("SALESAGG_RETRIES", "5"),
            ("SALESAGG_RETRY_DELAY_MS", "250"),
            ("SALESAGG_REQUIRED_COLUMNS", "Department Name, Number of Sales"),
            ("SALESAGG_OUTPUT_DIR", "/srv/out"),
            ("PORT", "8080"),
        ]))
        .unwrap();

        assert_eq!(config.workers, 8);
        assert_eq!(config.retry, RetryPolicy::new(5, Duration::from_millis(250)));
        assert_eq!(config.required_columns, vec!["Department Name", "Number of Sales"]);
        assert_eq!(config.output_dir, PathBuf::from("/srv/out"));
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn test_rejects_zero_workers() {
        let err = Config::from_lookup(lookup(&[("SALESAGG_WORKERS", "0")])).unwrap_err();
        assert!(err.to_string().contains("SALESAGG_WORKERS"));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Config::from_lookup(lookup(&[("SALESAGG_RETRIES", "many")])).is_err());
        assert!(Config::from_lookup(lookup(&[("SALESAGG_REQUIRED_COLUMNS", " , ")])).is_err());
    }
}
