use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use log::LevelFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(long)]
    pub verbose: Option<LevelFilter>,

    /// Path of the TOML config file. Created with default values if it doesn't exist.
    #[arg(long, short = 'c', default_value = "pg_backup.toml")]
    pub config: PathBuf,

    #[command(flatten)]
    pub settings: SettingsArgs,

    #[command(subcommand)]
    pub action: Option<Action>,
}

/// Connection settings, usually taken from the environment.
#[derive(Args, Debug, Clone, Default)]
pub struct SettingsArgs {
    /// Name or id of the container running PostgreSQL.
    #[arg(long, env = "CONTAINER")]
    pub container: Option<String>,

    /// Database to back up.
    #[arg(long, env = "POSTGRES_DATABASE")]
    pub database: Option<String>,

    /// Database role performing the backup.
    #[arg(long, env = "POSTGRES_USER")]
    pub user: Option<String>,

    /// Password of the database role.
    #[arg(long, env = "POSTGRES_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Folder holding the `daily/` and `monthly/` backups.
    #[arg(long, short = 'r', env = "BACKUP_DIR")]
    pub backup_dir: Option<String>,

    /// Webhook receiving status notifications.
    #[arg(long, env = "BACKUP_WEBHOOK_URL", hide_env_values = true)]
    pub webhook_url: Option<String>,

    /// Don't send status notifications.
    #[arg(
        long = "no-notification",
        action = ArgAction::SetFalse
    )]
    pub notification: bool,
}

#[derive(Subcommand, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Run the daily backup, the monthly backup if due, and prune old backups. (Default)
    #[default]
    Backup,
    /// Only prune expired backups.
    Prune,
    /// List stored backups.
    List,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_is_the_default_action() {
        let cli = Cli::try_parse_from(["pg_backup", "--container", "db"]).unwrap();
        assert_eq!(cli.action.unwrap_or_default(), Action::Backup);
        assert!(cli.settings.notification);
        assert_eq!(cli.settings.container.as_deref(), Some("db"));
    }

    #[test]
    fn notifications_can_be_disabled() {
        let cli = Cli::try_parse_from(["pg_backup", "--no-notification", "list"]).unwrap();
        assert!(!cli.settings.notification);
        assert_eq!(cli.action, Some(Action::List));
    }
}
