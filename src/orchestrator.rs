//! A single backup run.
//!
//! The [Orchestrator] sequences the phases of a run:
//!
//! 1. remove temporary artifacts left in the container,
//! 2. take the daily backup,
//! 3. take the monthly backup if due,
//! 4. remove temporary artifacts again,
//! 5. prune expired backups from the retention store.
//!
//! No phase aborts the run. Failures are logged, reported through the
//! [Notifier] where relevant, and the next phase starts regardless.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Local, NaiveDate};
use derive_more::Display;

use crate::backends::{Backup, PgBaseBackup, PgDump};
use crate::config::{BackupConfig, MonthlyPolicy, Settings};
use crate::container::{
    ArchiveRetriever, ContainerRuntime, ContainerSession, ExecOutcome, FailurePolicy,
    RemoteExecutor,
};
use crate::notify::Notifier;
use crate::util::retention::{ArtifactKind, Pruned, RetentionConfig, RetentionStore};

/// Phase of a run, used for logging.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum Phase {
    #[display("cleaning temporary files")]
    CleaningTemp,
    #[display("daily backup")]
    DailyBackup,
    #[display("monthly check")]
    MonthlyCheck,
    #[display("monthly backup")]
    MonthlyBackup,
    #[display("pruning")]
    Pruning,
}

/// Why a monthly backup is taken.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum MonthlyTrigger {
    /// No monthly backup of any date exists.
    #[display("no monthly backup exists yet")]
    NoneStored,
    /// It's the first day of the month.
    #[display("first day of the month")]
    FirstOfMonth,
    /// No monthly backup is dated in the current month.
    #[display("no monthly backup for this month yet")]
    MissingForMonth,
}

/// Decides which monthly backups are due.
///
/// `has_any` tells whether a monthly backup of any date is stored,
/// `has_for_month` whether one is dated in the month of `today`.
pub fn monthly_triggers(
    policy: MonthlyPolicy,
    today: NaiveDate,
    has_any: bool,
    has_for_month: bool,
) -> Vec<MonthlyTrigger> {
    match policy {
        MonthlyPolicy::AnyArtifact => {
            let mut triggers = Vec::new();
            if !has_any {
                triggers.push(MonthlyTrigger::NoneStored);
            }
            if today.day() == 1 {
                triggers.push(MonthlyTrigger::FirstOfMonth);
            }
            triggers
        }
        MonthlyPolicy::CurrentMonth if !has_for_month => vec![MonthlyTrigger::MissingForMonth],
        MonthlyPolicy::CurrentMonth => Vec::new(),
    }
}

/// Outcome of one backup sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The artifact is stored at the path.
    Stored(PathBuf),
    /// The dump command failed inside the container.
    DumpFailed,
    /// The dump succeeded but copying it out of the container failed.
    RetrievalFailed,
}

/// What happened during a run.
#[derive(Debug, Default)]
pub struct RunReport {
    /// [None] if the container couldn't be reached.
    pub daily: Option<StepOutcome>,
    /// One entry per monthly backup taken.
    pub monthly: Vec<StepOutcome>,
    /// Expired backups deleted.
    pub pruned: Vec<PathBuf>,
    /// Expired backups which couldn't be deleted.
    pub prune_failures: usize,
    /// The container couldn't be looked up; no remote phase ran.
    pub container_unreachable: bool,
}

/// Runs backups of one database.
pub struct Orchestrator<R, N> {
    settings: Settings,
    config: BackupConfig,
    store: RetentionStore,
    runtime: R,
    notifier: N,
}

impl<R, N> Orchestrator<R, N>
where
    R: ContainerRuntime,
    N: Notifier,
{
    /// Opens the retention store below [`Settings::backup_dir`].
    pub fn new(
        settings: Settings,
        config: BackupConfig,
        runtime: R,
        notifier: N,
    ) -> io::Result<Self> {
        let store = RetentionStore::open(&settings.backup_dir)?;

        Ok(Self {
            settings,
            config,
            store,
            runtime,
            notifier,
        })
    }

    pub fn store(&self) -> &RetentionStore {
        &self.store
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    /// Runs all phases for the current local time.
    pub fn run(&self) -> RunReport {
        self.run_at(Local::now())
    }

    /// Runs all phases as if it was `now`.
    pub fn run_at(&self, now: DateTime<Local>) -> RunReport {
        let today = now.date_naive();
        let mut report = RunReport::default();
        self.notify("Starting backup process...");

        // the session lives until the end of this block, on every path through it
        match self.runtime.connect(&self.settings.container) {
            Ok(session) => {
                let mut executor =
                    RemoteExecutor::new(session, self.config.commands.command_timeout());

                self.clean_temp(&mut executor);

                log::debug!(target: "orchestrator", "Phase: {}", Phase::DailyBackup);
                report.daily = Some(self.backup(&mut executor, &PgDump, today));

                log::debug!(target: "orchestrator", "Phase: {}", Phase::MonthlyCheck);
                for trigger in self.due_monthly(today) {
                    log::info!(target: "orchestrator", "Monthly backup due: {trigger}");
                    log::debug!(target: "orchestrator", "Phase: {}", Phase::MonthlyBackup);
                    report
                        .monthly
                        .push(self.backup(&mut executor, &PgBaseBackup, today));
                }

                self.clean_temp(&mut executor);
            }
            Err(e) => {
                log::error!(
                    target: "orchestrator",
                    "Container {} is unavailable, skipping backups: {e}",
                    self.settings.container
                );
                self.notify(&format!(
                    "Container `{}` is unavailable, no backup was taken.",
                    self.settings.container
                ));
                report.container_unreachable = true;
            }
        }

        log::debug!(target: "orchestrator", "Phase: {}", Phase::Pruning);
        prune_into(
            &self.store,
            &self.config.retention,
            Some(self.settings.database.as_str()),
            &self.notifier,
            now,
            &mut report,
        );

        self.notify("Backup process finished.");
        report
    }

    fn notify(&self, message: &str) {
        notify(&self.notifier, message);
    }

    fn clean_temp<S: ContainerSession>(&self, executor: &mut RemoteExecutor<S>) {
        log::info!(target: "orchestrator", "Cleaning temporary files...");
        log::debug!(target: "orchestrator", "Phase: {}", Phase::CleaningTemp);
        self.notify("Cleaning temporary files...");

        let backups: [&dyn Backup; 2] = [&PgDump, &PgBaseBackup];
        for backup in backups {
            remove_temp(executor, backup);
        }
    }

    fn due_monthly(&self, today: NaiveDate) -> Vec<MonthlyTrigger> {
        let database = &self.settings.database;
        let policy = self.config.monthly.policy;

        let lookup = match policy {
            MonthlyPolicy::AnyArtifact => self
                .store
                .has_monthly_for_current_period(database)
                .map(|has_any| (has_any, false)),
            MonthlyPolicy::CurrentMonth => self
                .store
                .has_monthly_for_month(database, today)
                .map(|has_for_month| (has_for_month, has_for_month)),
        };

        match lookup {
            Ok((has_any, has_for_month)) => monthly_triggers(policy, today, has_any, has_for_month),
            Err(e) => {
                // an unreadable store can't tell a backup is missing, take one
                log::error!(target: "orchestrator", "Checking for monthly backups failed: {e}");
                vec![MonthlyTrigger::NoneStored]
            }
        }
    }

    /// Dump, retrieve, remove the temporary artifact.
    fn backup<S: ContainerSession>(
        &self,
        executor: &mut RemoteExecutor<S>,
        backup: &dyn Backup,
        today: NaiveDate,
    ) -> StepOutcome {
        let kind = backup.kind();
        let database = &self.settings.database;
        let destination = self.store.path_for(kind, database, today);
        let file_name = display_name(&destination);
        log::info!(target: "orchestrator", "Starting {kind} backup of {database}...");

        let dump = executor.execute(&backup.dump_command(&self.settings), FailurePolicy::Fatal);
        if !dump.is_success() {
            log::error!(target: "orchestrator", "The {kind} backup of {database} failed.");
            return StepOutcome::DumpFailed;
        }

        let retriever = ArchiveRetriever::new(self.config.commands.transfer_timeout());
        let retrieved = retriever.retrieve(
            executor.session_mut(),
            &backup.retrieval_source(),
            &destination,
            kind.compression(),
        );
        remove_temp(executor, backup);

        match retrieved {
            Ok(_) => {
                log::info!(target: "orchestrator", "{} backup finished: {}", capitalize(kind), destination.display());
                self.notify(&format!("{} backup finished: `{file_name}`", capitalize(kind)));
                StepOutcome::Stored(destination)
            }
            Err(e) => {
                log::error!(target: "orchestrator", "Retrieving the {kind} backup failed: {e}");
                self.notify(&format!("{} backup `{file_name}` could not be retrieved: {e}", capitalize(kind)));
                StepOutcome::RetrievalFailed
            }
        }
    }
}

/// Prunes expired backups from `store` without touching the container.
///
/// Monthly backups are only pruned by count if `database` is known.
pub fn prune_store(
    store: &RetentionStore,
    retention: &RetentionConfig,
    database: Option<&str>,
    notifier: &dyn Notifier,
    now: DateTime<Local>,
) -> RunReport {
    let mut report = RunReport::default();
    prune_into(store, retention, database, notifier, now, &mut report);
    report
}

fn prune_into(
    store: &RetentionStore,
    retention: &RetentionConfig,
    database: Option<&str>,
    notifier: &dyn Notifier,
    now: DateTime<Local>,
    report: &mut RunReport,
) {
    let directory = store.directory(ArtifactKind::Daily);
    log::info!(target: "orchestrator", "Cleaning old backups in {}...", directory.display());

    match store.prune(ArtifactKind::Daily, retention.daily_max_age(), now.into()) {
        Ok(pruned) => report_pruned(notifier, pruned, report),
        Err(e) => log::error!(target: "orchestrator", "Pruning {} failed: {e}", directory.display()),
    }

    let Some(keep) = retention.monthly_keep else {
        return;
    };
    let Some(database) = database else {
        log::warn!(target: "orchestrator", "No database given, keeping all monthly backups");
        return;
    };
    match store.prune_monthly(database, Some(keep)) {
        Ok(pruned) => report_pruned(notifier, pruned, report),
        Err(e) => log::error!(target: "orchestrator", "Pruning monthly backups failed: {e}"),
    }
}

fn report_pruned(notifier: &dyn Notifier, pruned: Vec<Pruned>, report: &mut RunReport) {
    for Pruned { path, result } in pruned {
        match result {
            Ok(()) => {
                log::info!(target: "orchestrator", "Deleted old backup: {}", path.display());
                notify(notifier, &format!("Deleted old backup: `{}`", display_name(&path)));
                report.pruned.push(path);
            }
            Err(e) => {
                log::error!(target: "orchestrator", "Could not delete {}: {e}", path.display());
                report.prune_failures += 1;
            }
        }
    }
}

/// Sends `message`; a failed delivery is only logged.
fn notify(notifier: &dyn Notifier, message: &str) {
    if let Err(e) = notifier.notify(message) {
        log::warn!(target: "orchestrator", "Sending notification failed: {e}");
    }
}

/// Removes the temporary artifact of `backup` from the container if it exists.
fn remove_temp<S: ContainerSession>(executor: &mut RemoteExecutor<S>, backup: &dyn Backup) {
    let temp = backup.temp_artifact();
    match executor.execute(&temp.exists_command(), FailurePolicy::Tolerate) {
        ExecOutcome::Succeeded => {
            log::debug!(target: "orchestrator", "Removing {temp} from the container");
            executor.execute(&temp.remove_command(), FailurePolicy::Tolerate);
        }
        ExecOutcome::FailedTolerated { .. } => {
            log::trace!(target: "orchestrator", "{temp} doesn't exist in the container");
        }
        ExecOutcome::Failed(e) => {
            log::warn!(target: "orchestrator", "Checking for {temp} failed: {e}");
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn capitalize(kind: ArtifactKind) -> &'static str {
    match kind {
        ArtifactKind::Daily => "Daily",
        ArtifactKind::Monthly => "Monthly",
    }
}
