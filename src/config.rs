use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args};

use crate::engine::refresh::RefreshSettings;
use crate::engine::retention::RetentionPolicy;
use crate::engine::scheduler::SchedulerSettings;
use crate::registry::oci::BasicCredentials;

// =============================================================================
// Time-related constants
// =============================================================================

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const YEAR: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Default interval between catalog imports (1 day)
pub const DEFAULT_IMAGE_REFRESH_INTERVAL: Duration = DAY;

/// Default interval between digest refresh cycles (1 hour)
pub const DEFAULT_DIGEST_REFRESH_INTERVAL: Duration = HOUR;

/// Default age after which digest history is deleted (1 year)
pub const DEFAULT_HISTORY_MAX_AGE: Duration = YEAR;

/// Default age after which unviewed monitored tags are deleted (2 years)
pub const DEFAULT_INACTIVE_MAX_AGE: Duration = Duration::from_secs(2 * 365 * 24 * 60 * 60);

/// Default pause before retrying throttled requests (1 minute)
pub const DEFAULT_COOLDOWN_INTERVAL: Duration = MINUTE;

/// Default sleep of the scheduler when no job is due (10 seconds)
pub const DEFAULT_SCHEDULER_IDLE_INTERVAL: Duration = Duration::from_secs(10);

// =============================================================================
// Throughput constants
// =============================================================================

/// Default outbound request rate across all registry calls
pub const DEFAULT_MAX_REQUESTS_PER_SECOND: u32 = 10;

/// Default number of tags queried concurrently per batch
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Environment variable names of every setting
pub mod env {
    pub const DATABASE_PATH: &str = "DATABASE_PATH";
    pub const IMAGE_REFRESH_INTERVAL: &str = "IMAGE_REFRESH_INTERVAL";
    pub const DIGEST_REFRESH_INTERVAL: &str = "DIGEST_REFRESH_INTERVAL";
    pub const IMAGE_UPDATE_MAX_AGE: &str = "IMAGE_UPDATE_MAX_AGE";
    pub const IMAGE_LAST_ACCESSED_MAX_AGE: &str = "IMAGE_LAST_ACCESSED_MAX_AGE";
    pub const AUTO_MONITOR_NEW_TAGS: &str = "AUTO_MONITOR_NEW_TAGS";
    pub const DIGEST_REFRESH_COOLDOWN_INTERVAL: &str = "DIGEST_REFRESH_COOLDOWN_INTERVAL";
    pub const MAX_REQUESTS_PER_SECOND: &str = "MAX_REQUESTS_PER_SECOND";
    pub const DIGEST_REFRESH_BATCH_SIZE: &str = "DIGEST_REFRESH_BATCH_SIZE";
    pub const SCHEDULER_IDLE_INTERVAL: &str = "SCHEDULER_IDLE_INTERVAL";
    pub const IMPORT_POPULAR_IMAGES: &str = "IMPORT_POPULAR_IMAGES";
    pub const DOCKERHUB_USERNAME: &str = "DOCKERHUB_USERNAME";
    pub const DOCKERHUB_PASSWORD: &str = "DOCKERHUB_PASSWORD";
    pub const LOG_FORMAT: &str = "LOG_FORMAT";
    pub const LOG_LEVEL: &str = "LOG_LEVEL";
    pub const LOG_FILE: &str = "LOG_FILE";
}

/// Runtime settings, each settable by flag or environment variable
#[derive(Args, Debug, Clone, PartialEq)]
pub struct Config {
    /// SQLite database file [default: $XDG_DATA_HOME/tag-monitor/tags.db]
    #[arg(long, env = env::DATABASE_PATH, global = true)]
    pub database_path: Option<PathBuf>,

    /// Interval between popular image imports
    #[arg(long, env = env::IMAGE_REFRESH_INTERVAL, default_value = "1d", value_parser = parse_duration, global = true)]
    pub image_refresh_interval: Duration,

    /// Interval between digest refresh cycles
    #[arg(long, env = env::DIGEST_REFRESH_INTERVAL, default_value = "1h", value_parser = parse_duration, global = true)]
    pub digest_refresh_interval: Duration,

    /// Digest history older than this is deleted
    #[arg(long, env = env::IMAGE_UPDATE_MAX_AGE, default_value = "1y", value_parser = parse_duration, global = true)]
    pub image_update_max_age: Duration,

    /// Monitored tags not viewed for longer than this are deleted
    #[arg(long, env = env::IMAGE_LAST_ACCESSED_MAX_AGE, default_value = "2y", value_parser = parse_duration, global = true)]
    pub image_last_accessed_max_age: Duration,

    /// Enroll newly published tags of tracked images
    #[arg(long, env = env::AUTO_MONITOR_NEW_TAGS, default_value = "true", action = ArgAction::Set, global = true)]
    pub auto_monitor_new_tags: bool,

    /// Pause before retrying requests the registry throttled
    #[arg(long, env = env::DIGEST_REFRESH_COOLDOWN_INTERVAL, default_value = "1m", value_parser = parse_duration, global = true)]
    pub digest_refresh_cooldown_interval: Duration,

    /// Maximum outbound registry requests per second
    #[arg(long, env = env::MAX_REQUESTS_PER_SECOND, default_value = "10", global = true)]
    pub max_requests_per_second: u32,

    /// Number of tags queried concurrently
    #[arg(long, env = env::DIGEST_REFRESH_BATCH_SIZE, default_value = "10", global = true)]
    pub digest_refresh_batch_size: usize,

    /// Sleep of the scheduler when no job is due
    #[arg(long, env = env::SCHEDULER_IDLE_INTERVAL, default_value = "10s", value_parser = parse_duration, global = true)]
    pub scheduler_idle_interval: Duration,

    /// Seed tracking from the Docker Hub popular image catalog
    #[arg(long, env = env::IMPORT_POPULAR_IMAGES, default_value = "true", action = ArgAction::Set, global = true)]
    pub import_popular_images: bool,

    /// Docker Hub user for token requests
    #[arg(long, env = env::DOCKERHUB_USERNAME, global = true)]
    pub dockerhub_username: Option<String>,

    /// Docker Hub password or access token for token requests
    #[arg(long, env = env::DOCKERHUB_PASSWORD, hide_env_values = true, global = true)]
    pub dockerhub_password: Option<String>,

    /// Log format: json or compact
    #[arg(long, env = env::LOG_FORMAT, default_value = "compact", global = true)]
    pub log_format: String,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, env = env::LOG_LEVEL, default_value = "info", global = true)]
    pub log_level: String,

    /// Write logs to this file instead of stderr
    #[arg(long, env = env::LOG_FILE, global = true)]
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Rejects settings the engine cannot run with
    pub fn validate(&self) -> Result<(), String> {
        if self.max_requests_per_second == 0 {
            return Err(format!("{} must be greater than 0", env::MAX_REQUESTS_PER_SECOND));
        }
        if self.digest_refresh_batch_size == 0 {
            return Err(format!("{} must be greater than 0", env::DIGEST_REFRESH_BATCH_SIZE));
        }
        if self.image_refresh_interval.is_zero() {
            return Err(format!("{} must be greater than 0", env::IMAGE_REFRESH_INTERVAL));
        }
        if self.digest_refresh_interval.is_zero() {
            return Err(format!("{} must be greater than 0", env::DIGEST_REFRESH_INTERVAL));
        }
        if self.dockerhub_username.is_some() != self.dockerhub_password.is_some() {
            return Err(format!(
                "{} and {} must be set together",
                env::DOCKERHUB_USERNAME,
                env::DOCKERHUB_PASSWORD
            ));
        }
        Ok(())
    }

    /// Configured database path, or the default under the data directory
    pub fn database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(db_path)
    }

    pub fn dockerhub_credentials(&self) -> Option<BasicCredentials> {
        match (&self.dockerhub_username, &self.dockerhub_password) {
            (Some(username), Some(password)) => Some(BasicCredentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    pub fn refresh_settings(&self) -> RefreshSettings {
        RefreshSettings {
            batch_size: self.digest_refresh_batch_size,
            cooldown: self.digest_refresh_cooldown_interval,
        }
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            history_max_age: self.image_update_max_age,
            inactive_max_age: self.image_last_accessed_max_age,
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            image_refresh_interval: self.image_refresh_interval,
            digest_refresh_interval: self.digest_refresh_interval,
            idle_interval: self.scheduler_idle_interval,
            auto_monitor_new_tags: self.auto_monitor_new_tags,
            refresh: self.refresh_settings(),
            retention: self.retention_policy(),
        }
    }
}

/// Parse a duration such as "10s", "1h30m" or "2y".
///
/// Units: ms, s, m, h, d, w and y (365 days). Every number needs a unit.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("duration must not be empty".to_string());
    }

    let mut total = Duration::ZERO;
    let mut rest = trimmed;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if number_end == 0 {
            return Err(format!("invalid duration '{}': expected a number", input));
        }
        let value: u32 = rest[..number_end]
            .parse()
            .map_err(|e| format!("invalid duration '{}': {}", input, e))?;
        rest = &rest[number_end..];

        let unit_end = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = match &rest[..unit_end] {
            "ms" => Duration::from_millis(1),
            "s" => Duration::from_secs(1),
            "m" => MINUTE,
            "h" => HOUR,
            "d" => DAY,
            "w" => DAY * 7,
            "y" => YEAR,
            "" => return Err(format!("invalid duration '{}': missing unit", input)),
            other => {
                return Err(format!("invalid duration '{}': unknown unit '{}'", input, other));
            }
        };
        rest = &rest[unit_end..];

        total = unit
            .checked_mul(value)
            .and_then(|part| total.checked_add(part))
            .ok_or_else(|| format!("invalid duration '{}': too large", input))?;
    }

    Ok(total)
}

/// Returns the path to the data directory for tag-monitor.
/// Uses $XDG_DATA_HOME/tag-monitor if XDG_DATA_HOME is set,
/// otherwise falls back to ~/.local/share/tag-monitor,
/// or ./tag-monitor if neither is available.
pub fn data_dir() -> PathBuf {
    data_dir_with_env(std::env::var("XDG_DATA_HOME").ok(), dirs::home_dir())
}

/// Returns the path to the database file.
pub fn db_path() -> PathBuf {
    data_dir().join("tags.db")
}

fn data_dir_with_env(xdg_data_home: Option<String>, home_dir: Option<PathBuf>) -> PathBuf {
    let data_dir = xdg_data_home
        .map(PathBuf::from)
        .or_else(|| home_dir.map(|home| home.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));

    data_dir.join("tag-monitor")
}
