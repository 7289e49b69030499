use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};

/// Runtime configuration, read from `PARLEY_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub files_dir: PathBuf,
    pub templates_dir: PathBuf,
    pub outbox_dir: PathBuf,
    /// Period of the mail-queue batch job.
    pub mail_interval: Duration,
    /// Sent queue rows older than this are truncated by housekeeping.
    pub queue_retention_days: i64,
    /// Recursion ceiling when threading replies for display.
    pub reply_depth_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "parley.db".into(),
            files_dir: "./files".into(),
            templates_dir: "./templates".into(),
            outbox_dir: "./outbox".into(),
            mail_interval: Duration::from_secs(60),
            queue_retention_days: 30,
            reply_depth_limit: 16,
        }
    }
}

impl Config {
    /// Reads the environment. Call `dotenvy::dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            db_path: env_path("PARLEY_DB_PATH", defaults.db_path),
            files_dir: env_path("PARLEY_FILES_DIR", defaults.files_dir),
            templates_dir: env_path("PARLEY_TEMPLATES_DIR", defaults.templates_dir),
            outbox_dir: env_path("PARLEY_OUTBOX_DIR", defaults.outbox_dir),
            mail_interval: Duration::from_secs(env_parse(
                "PARLEY_MAIL_INTERVAL_SECS",
                defaults.mail_interval.as_secs(),
            )?),
            queue_retention_days: env_parse("PARLEY_QUEUE_RETENTION_DAYS", defaults.queue_retention_days)?,
            reply_depth_limit: env_parse("PARLEY_REPLY_DEPTH_LIMIT", defaults.reply_depth_limit)?,
        };
        if config.mail_interval.is_zero() {
            bail!("PARLEY_MAIL_INTERVAL_SECS must be greater than zero");
        }
        Ok(config)
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a number, got '{raw}'")),
        Err(_) => Ok(default),
    }
}
