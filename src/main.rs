use std::path::Path;
use std::process::ExitCode;

use chrono::Local;
use clap::Parser;

use pg_backup_lib::cli::{Action, Cli, SettingsArgs};
use pg_backup_lib::config::{self, BackupConfig, Settings, StoreSettings};
use pg_backup_lib::container::Docker;
use pg_backup_lib::notify::{DisabledNotifier, Notifier, NotifyError, WebhookNotifier};
use pg_backup_lib::orchestrator::{self, Orchestrator, RunReport};
use pg_backup_lib::util::retention::{ArtifactKind, RetentionStore};

fn main() -> ExitCode {
    // before parsing, so the env fallbacks of the arguments see the file
    let env_file = config::load_env_file(Path::new(config::DEFAULT_ENV_FILE));
    let cli = Cli::parse();

    // init logger
    let mut env_logger = env_logger::builder();
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    }
    if let Err(e) = env_logger.try_init() {
        eprintln!("Initializing the logger failed: {e}");
    }

    match env_file {
        Ok(true) => log::debug!("Loaded environment from {}", config::DEFAULT_ENV_FILE),
        Ok(false) => {}
        Err(e) => log::warn!("Reading {} failed: {e}", config::DEFAULT_ENV_FILE),
    }

    let config = match BackupConfig::load_or_init(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Reading the config file failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.action.unwrap_or_default() {
        Action::Backup => backup(cli.settings, config),
        Action::Prune => prune(cli.settings, config),
        Action::List => list(cli.settings),
    }
}

fn backup(args: SettingsArgs, config: BackupConfig) -> ExitCode {
    let settings = match Settings::try_from(args) {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("Invalid configuration: {e}. Check your environment.");
            return ExitCode::FAILURE;
        }
    };

    let notifier = match notifier(settings.webhook_url.as_deref(), &config) {
        Ok(notifier) => notifier,
        Err(e) => {
            log::error!("Setting up notifications failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let orchestrator = match Orchestrator::new(settings, config, Docker::default(), notifier) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            log::error!("Opening the backup directory failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    summarize(&orchestrator.run());

    // partial failures are reported through logs and notifications only
    ExitCode::SUCCESS
}

fn prune(args: SettingsArgs, config: BackupConfig) -> ExitCode {
    let Some((settings, store)) = open_store(args) else {
        return ExitCode::FAILURE;
    };

    let notifier = match notifier(settings.webhook_url.as_deref(), &config) {
        Ok(notifier) => notifier,
        Err(e) => {
            log::error!("Setting up notifications failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    summarize(&orchestrator::prune_store(
        &store,
        &config.retention,
        settings.database.as_deref(),
        &notifier,
        Local::now(),
    ));
    ExitCode::SUCCESS
}

fn list(args: SettingsArgs) -> ExitCode {
    let Some((_, store)) = open_store(args) else {
        return ExitCode::FAILURE;
    };

    for kind in [ArtifactKind::Daily, ArtifactKind::Monthly] {
        match store.artifacts(kind) {
            Ok(artifacts) => {
                for artifact in artifacts {
                    println!("{kind}\t{}\t{}", artifact.date, artifact.path.display());
                }
            }
            Err(e) => log::error!("Listing {kind} backups failed: {e}"),
        }
    }
    ExitCode::SUCCESS
}

fn open_store(args: SettingsArgs) -> Option<(StoreSettings, RetentionStore)> {
    let settings = match StoreSettings::try_from(args) {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("Invalid configuration: {e}. Check your environment.");
            return None;
        }
    };

    match RetentionStore::open(&settings.backup_dir) {
        Ok(store) => Some((settings, store)),
        Err(e) => {
            log::error!("Opening the backup directory failed: {e}");
            None
        }
    }
}

fn notifier(webhook_url: Option<&str>, config: &BackupConfig) -> Result<Box<dyn Notifier>, NotifyError> {
    Ok(match webhook_url {
        Some(url) => Box::new(WebhookNotifier::new(url.to_string(), config.notification.clone())?),
        None => Box::new(DisabledNotifier),
    })
}

fn summarize(report: &RunReport) {
    log::debug!(
        target: "orchestrator",
        "Run finished: daily {:?}, monthly {:?}, {} pruned, {} prune failure(s)",
        report.daily,
        report.monthly,
        report.pruned.len(),
        report.prune_failures
    );
}
