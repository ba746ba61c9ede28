//! Settings of a backup run.
//!
//! Two layers exist:
//!
//! - [Settings]: connection settings taken from flags or the environment
//!   (`CONTAINER`, `POSTGRES_*`, `BACKUP_DIR`, `BACKUP_WEBHOOK_URL`).
//!   All of them are required for a backup; a missing one is a fatal
//!   [ConfigError]. Actions only working on the retention store need
//!   [StoreSettings], which require `BACKUP_DIR` alone.
//! - [BackupConfig]: tunables read from a TOML file which is created with
//!   default values if it doesn't exist yet.
//!
//! Environment variables may also come from a `.env` file, see [load_env_file].

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_more::{Display, Error, From};

use crate::cli::SettingsArgs;
use crate::util::retention::RetentionConfig;

pub const ENV_CONTAINER: &str = "CONTAINER";
pub const ENV_DATABASE: &str = "POSTGRES_DATABASE";
pub const ENV_USER: &str = "POSTGRES_USER";
pub const ENV_PASSWORD: &str = "POSTGRES_PASSWORD";
pub const ENV_BACKUP_DIR: &str = "BACKUP_DIR";
pub const ENV_WEBHOOK_URL: &str = "BACKUP_WEBHOOK_URL";

/// File read by [load_env_file] on start, relative to the working directory.
pub const DEFAULT_ENV_FILE: &str = ".env";

/// Loads the `KEY=value` lines of `path` into the process environment.
///
/// Variables already set keep their value. Returns `false` if there is no such file.
pub fn load_env_file(path: &Path) -> Result<bool, dotenvy::Error> {
    match dotenvy::from_path(path) {
        Ok(()) => Ok(true),
        Err(e) if e.not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Errors on loading the configuration.
#[derive(Debug, Display, Error, From)]
pub enum ConfigError {
    /// A required setting is absent or empty.
    #[display("Missing required setting {_0}")]
    Missing(#[error(ignore)] &'static str),
    /// The config file can't be read or written.
    #[display("Accessing the config file {} failed: {source}", path.display())]
    Io {
        path: PathBuf,
        source: io::Error,
    },
    /// The config file isn't valid TOML for [BackupConfig].
    #[display("Parsing the config file failed: {_0}")]
    #[from]
    Parse(toml::de::Error),
}

/// Connection settings of the run.
#[derive(Clone)]
pub struct Settings {
    /// Name or id of the container running PostgreSQL.
    pub container: String,
    /// Name of the database to back up.
    pub database: String,
    /// Database role used by `pg_dump` and `pg_basebackup`.
    pub user: String,
    /// Password of [`user`](Self::user), forwarded as `PGPASSWORD`.
    pub password: String,
    /// Root of the retention store.
    pub backup_dir: PathBuf,
    /// Webhook receiving status messages; [None] if notifications are disabled.
    pub webhook_url: Option<String>,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("container", &self.container)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"***")
            .field("backup_dir", &self.backup_dir)
            .field("webhook_url", &self.webhook_url.as_ref().map(|_| "***"))
            .finish()
    }
}

fn required(value: Option<String>, key: &'static str) -> Result<String, ConfigError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(key))
}

impl TryFrom<SettingsArgs> for Settings {
    type Error = ConfigError;

    fn try_from(args: SettingsArgs) -> Result<Self, Self::Error> {
        let container = required(args.container, ENV_CONTAINER)?;
        let database = required(args.database, ENV_DATABASE)?;
        let user = required(args.user, ENV_USER)?;
        let password = required(args.password, ENV_PASSWORD)?;
        let backup_dir = required(args.backup_dir, ENV_BACKUP_DIR)?.into();

        let webhook_url = if args.notification {
            Some(required(args.webhook_url, ENV_WEBHOOK_URL)?)
        } else {
            None
        };

        Ok(Self {
            container,
            database,
            user,
            password,
            backup_dir,
            webhook_url,
        })
    }
}

/// Settings of actions working on the local retention store only.
#[derive(Clone)]
pub struct StoreSettings {
    /// Root of the retention store.
    pub backup_dir: PathBuf,
    /// Database whose monthly backups are pruned by count, if known.
    pub database: Option<String>,
    /// Webhook receiving status messages, if configured and enabled.
    pub webhook_url: Option<String>,
}

impl fmt::Debug for StoreSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreSettings")
            .field("backup_dir", &self.backup_dir)
            .field("database", &self.database)
            .field("webhook_url", &self.webhook_url.as_ref().map(|_| "***"))
            .finish()
    }
}

impl TryFrom<SettingsArgs> for StoreSettings {
    type Error = ConfigError;

    fn try_from(args: SettingsArgs) -> Result<Self, Self::Error> {
        let backup_dir = required(args.backup_dir, ENV_BACKUP_DIR)?.into();
        let webhook_url = args
            .notification
            .then(|| required(args.webhook_url, ENV_WEBHOOK_URL).ok())
            .flatten();

        Ok(Self {
            backup_dir,
            database: required(args.database, ENV_DATABASE).ok(),
            webhook_url,
        })
    }
}

/// Tunables of the backup run, stored as TOML.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Retention of the stored artifacts.
    pub retention: RetentionConfig,
    /// When monthly backups are taken.
    pub monthly: MonthlyConfig,
    /// Deadlines of remote commands.
    pub commands: CommandConfig,
    /// Presentation and delivery of notifications.
    pub notification: NotificationConfig,
}

impl BackupConfig {
    /// Reads the config at `path`, writing the defaults there if the file doesn't exist yet.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(config_str) => Ok(toml::from_str(&config_str)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!(
                    target: "config",
                    "Writing default config to {} because it doesn't exist yet",
                    path.display()
                );
                let default_config = Self::default();
                match toml::to_string_pretty(&default_config) {
                    Ok(config_str) => {
                        if let Err(e) = fs::write(path, config_str) {
                            log::warn!(
                                target: "config",
                                "Writing default config to {} failed: {e}",
                                path.display()
                            );
                        }
                    }
                    Err(e) => log::warn!(target: "config", "Serializing default config failed: {e}"),
                }
                Ok(default_config)
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

/// How the "is a monthly backup due" decision is made.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Display, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MonthlyPolicy {
    /// Run a monthly backup if no monthly artifact of any date exists, and
    /// additionally on the first day of every month.
    ///
    /// Both triggers are independent: on the first day of a month with an
    /// empty monthly directory two monthly backups are taken.
    #[default]
    #[display("any-artifact")]
    AnyArtifact,
    /// Run at most one monthly backup, if none is dated in the current month.
    #[display("current-month")]
    CurrentMonth,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct MonthlyConfig {
    pub policy: MonthlyPolicy,
}

const DEFAULT_TIMEOUT_SECS: u64 = 6 * 60 * 60;

/// Deadlines of remote commands. A value of `0` disables the deadline.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Deadline of commands run inside the container, in seconds.
    pub command_timeout_secs: u64,
    /// Deadline of copying an artifact out of the container, in seconds.
    pub transfer_timeout_secs: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: DEFAULT_TIMEOUT_SECS,
            transfer_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl CommandConfig {
    pub fn command_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.command_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.transfer_timeout_secs)
    }
}

/// Presentation and delivery of webhook notifications.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Title of every message.
    pub title: String,
    /// Small image shown next to the message.
    pub thumbnail_url: Option<String>,
    /// Banner shown below the message.
    pub banner_url: Option<String>,
    /// Footer text. `{year}` is replaced with the current year.
    pub footer: Option<String>,
    /// Accent color as RGB integer.
    pub color: Option<u32>,
    /// Delivery attempts per message before giving up.
    pub max_attempts: u32,
    /// Timeout of a single delivery attempt, in seconds.
    pub timeout_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            title: "Database Backup".into(),
            thumbnail_url: None,
            banner_url: None,
            footer: None,
            color: None,
            max_attempts: 3,
            timeout_secs: 10,
        }
    }
}
