use std::{num::NonZeroU32, time::Duration};

use anyhow::Context;
use serde::{Deserialize, de::DeserializeOwned};

/// The env vars the pipeline reads. Everything but the database url has a default.
#[derive(Debug, Deserialize)]
pub struct PipelineEnv {
    database_url: String,
    #[serde(default = "default_anex_base_url")]
    anex_base_url: String,
    #[serde(default = "default_max_concurrent_requests")]
    max_concurrent_requests: usize,
    #[serde(default = "default_request_timeout_secs")]
    request_timeout_secs: u64,
    #[serde(default = "default_bulk_insert_size")]
    bulk_insert_size: usize,
    #[serde(default)]
    batch_retries: u32,
    #[serde(default = "default_requests_per_second")]
    requests_per_second: u32,
    #[serde(default = "default_ms_between_requests")]
    ms_between_requests: u64,
    #[serde(default = "default_db_max_connections")]
    db_max_connections: u32,
}

fn default_anex_base_url() -> String {
    "https://anex.us".to_string()
}

fn default_max_concurrent_requests() -> usize {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_bulk_insert_size() -> usize {
    5000
}

fn default_requests_per_second() -> u32 {
    80
}

fn default_ms_between_requests() -> u64 {
    10
}

fn default_db_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub anex_base_url: String,
    pub concurrency: usize,
    pub request_timeout: Duration,
    pub batch_size: usize,
    pub batch_retries: u32,
    pub requests_per_second: NonZeroU32,
    pub min_request_gap: Duration,
    pub db_max_connections: u32,
}

impl PipelineConfig {
    pub fn new() -> anyhow::Result<Self> {
        PipelineEnv::load_from_env()?.try_into()
    }
}

impl TryFrom<PipelineEnv> for PipelineConfig {
    type Error = anyhow::Error;

    fn try_from(env: PipelineEnv) -> anyhow::Result<Self> {
        anyhow::ensure!(
            env.max_concurrent_requests > 0,
            "MAX_CONCURRENT_REQUESTS must be at least 1"
        );
        anyhow::ensure!(env.bulk_insert_size > 0, "BULK_INSERT_SIZE must be at least 1");
        let requests_per_second = NonZeroU32::new(env.requests_per_second)
            .context("REQUESTS_PER_SECOND must be at least 1")?;
        Ok(Self {
            database_url: env.database_url,
            anex_base_url: env.anex_base_url,
            concurrency: env.max_concurrent_requests,
            request_timeout: Duration::from_secs(env.request_timeout_secs),
            batch_size: env.bulk_insert_size,
            batch_retries: env.batch_retries,
            requests_per_second,
            min_request_gap: Duration::from_millis(env.ms_between_requests),
            db_max_connections: env.db_max_connections,
        })
    }
}

// Extension trait.
pub trait LoadFromEnv: DeserializeOwned {
    fn load_from_env() -> anyhow::Result<Self> {
        // Don't throw an error if .env file doesn't exist.
        let _ = dotenv::dotenv();
        let config =
            envy::from_env::<Self>().context("failed to load env variables into config struct")?;
        Ok(config)
    }
}

impl<T: DeserializeOwned> LoadFromEnv for T {}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> anyhow::Result<PipelineConfig> {
        let vars = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string()));
        let env: PipelineEnv = envy::from_iter(vars)?;
        env.try_into()
    }

    #[test]
    fn defaults_apply_when_only_database_url_is_set() {
        let config = env(&[("DATABASE_URL", "postgres://localhost/grades")]).unwrap();
        assert_eq!(config.anex_base_url, "https://anex.us");
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.batch_size, 5000);
        assert_eq!(config.batch_retries, 0);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = env(&[
            ("DATABASE_URL", "postgres://localhost/grades"),
            ("MAX_CONCURRENT_REQUESTS", "5"),
            ("BULK_INSERT_SIZE", "10000"),
            ("MS_BETWEEN_REQUESTS", "0"),
        ])
        .unwrap();
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.batch_size, 10000);
        assert_eq!(config.min_request_gap, Duration::ZERO);
    }

    #[test]
    fn missing_database_url_is_an_error() {
        assert!(env(&[]).is_err());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(
            env(&[
                ("DATABASE_URL", "postgres://localhost/grades"),
                ("BULK_INSERT_SIZE", "0"),
            ])
            .is_err()
        );
    }
}
