//! Local storage of backup artifacts, split into a `daily` and a `monthly` directory.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

use chrono::{Datelike, NaiveDate};
use derive_more::Display;
use regex::Regex;

use crate::container::Compression;

const SECS_PER_DAY: u64 = 86_400;

static ARTIFACT_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?<db>.+)_(?<kind>daily|monthly)_(?<date>\d{8})\.(?:sql\.gz|tar\.gz)$")
        .expect("artifact name pattern should be valid")
});

/// Kind of a stored backup.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display)]
pub enum ArtifactKind {
    /// Compressed logical dump, kept for a short window.
    #[display("daily")]
    Daily,
    /// Full base backup, kept indefinitely unless configured otherwise.
    #[display("monthly")]
    Monthly,
}

impl ArtifactKind {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Daily => "sql.gz",
            Self::Monthly => "tar.gz",
        }
    }

    /// Compression to apply to the retrieved stream. `pg_dump` already compresses.
    pub fn compression(self) -> Compression {
        match self {
            Self::Daily => Compression::None,
            Self::Monthly => Compression::Gzip,
        }
    }
}

/// Configure retention of stored backups.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Daily backups older than this many days are deleted.
    pub daily_days: u64,

    /// Defines how many monthly backups to keep.
    ///
    /// Only the newest backup of each of the latest `monthly_keep` months is kept.
    /// If [None] every monthly backup is kept.
    pub monthly_keep: Option<usize>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            daily_days: 7,
            monthly_keep: None,
        }
    }
}

impl RetentionConfig {
    pub fn daily_max_age(&self) -> Duration {
        Duration::from_secs(self.daily_days.saturating_mul(SECS_PER_DAY))
    }
}

/// Keeps the first backup seen of each month, up to a limit of months.
///
/// Feed dates newest first.
#[derive(Clone, Debug)]
pub struct MonthlyRetention {
    keep: Option<usize>,
    monthly: HashSet<(i32, u32)>,
}

impl MonthlyRetention {
    pub fn new(keep: Option<usize>) -> Self {
        Self {
            keep,
            monthly: HashSet::new(),
        }
    }

    /// Returns if the [Datelike] is to be retained.
    pub fn retain(&mut self, date: impl Datelike) -> bool {
        let Self { keep, monthly } = self;

        keep.is_none_or(|keep_monthly| monthly.len() < keep_monthly) && {
            let monthly_key = (date.year(), date.month());
            monthly.insert(monthly_key)
        }
    }
}

/// A completed backup in the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupArtifact {
    pub path: PathBuf,
    pub database: String,
    pub kind: ArtifactKind,
    pub date: NaiveDate,
}

impl BackupArtifact {
    /// Parses a canonical artifact file name `{db}_{kind}_{YYYYMMDD}.{ext}`.
    pub fn parse(path: &Path) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?;
        let captures = ARTIFACT_NAME.captures(file_name)?;

        let kind = match &captures["kind"] {
            "daily" => ArtifactKind::Daily,
            _ => ArtifactKind::Monthly,
        };
        if !file_name.ends_with(kind.extension()) {
            return None;
        }
        let date = NaiveDate::parse_from_str(&captures["date"], "%Y%m%d").ok()?;

        Some(Self {
            path: path.to_path_buf(),
            database: captures["db"].to_string(),
            kind,
            date,
        })
    }
}

/// Outcome of deleting one expired file.
#[derive(Debug)]
pub struct Pruned {
    pub path: PathBuf,
    pub result: io::Result<()>,
}

/// The two retention directories below the backup root.
#[derive(Clone, Debug)]
pub struct RetentionStore {
    daily_dir: PathBuf,
    monthly_dir: PathBuf,
}

impl RetentionStore {
    /// Opens the store at `root`, creating the `daily` and `monthly` directories.
    pub fn open(root: &Path) -> io::Result<Self> {
        if root.is_relative() {
            log::warn!(target: "store", "backup root is relative: {}", root.display());
        }

        let store = Self {
            daily_dir: root.join(ArtifactKind::Daily.to_string()),
            monthly_dir: root.join(ArtifactKind::Monthly.to_string()),
        };
        fs::create_dir_all(&store.daily_dir)?;
        fs::create_dir_all(&store.monthly_dir)?;

        Ok(store)
    }

    pub fn directory(&self, kind: ArtifactKind) -> &Path {
        match kind {
            ArtifactKind::Daily => &self.daily_dir,
            ArtifactKind::Monthly => &self.monthly_dir,
        }
    }

    /// Canonical path of the `kind` backup of `database` taken on `date`.
    pub fn path_for(&self, kind: ArtifactKind, database: &str, date: NaiveDate) -> PathBuf {
        let timestamp = date.format("%Y%m%d");
        self.directory(kind)
            .join(format!("{database}_{kind}_{timestamp}.{}", kind.extension()))
    }

    /// Whether any monthly backup of `database` exists, regardless of its date.
    pub fn has_monthly_for_current_period(&self, database: &str) -> io::Result<bool> {
        let prefix = format!("{database}_{}", ArtifactKind::Monthly);
        for entry in fs::read_dir(&self.monthly_dir)? {
            if entry?.file_name().to_string_lossy().starts_with(&prefix) {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Whether a monthly backup of `database` is dated in the month of `date`.
    pub fn has_monthly_for_month(&self, database: &str, date: NaiveDate) -> io::Result<bool> {
        Ok(self.artifacts(ArtifactKind::Monthly)?.iter().any(|artifact| {
            artifact.database == database
                && artifact.date.year() == date.year()
                && artifact.date.month() == date.month()
        }))
    }

    /// Canonical artifacts of `kind`, oldest first. Other files are ignored.
    pub fn artifacts(&self, kind: ArtifactKind) -> io::Result<Vec<BackupArtifact>> {
        let mut artifacts = Vec::new();
        for entry in fs::read_dir(self.directory(kind))? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(artifact) = BackupArtifact::parse(&entry.path()) {
                if artifact.kind == kind {
                    artifacts.push(artifact);
                }
            }
        }
        artifacts.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.path.cmp(&b.path)));

        Ok(artifacts)
    }

    /// Deletes every regular file of the `kind` directory older than `max_age`.
    ///
    /// A file is older if `now - mtime > max_age`; files exactly `max_age` old
    /// or with an mtime in the future are kept. A failed deletion doesn't stop
    /// the scan.
    pub fn prune(
        &self,
        kind: ArtifactKind,
        max_age: Duration,
        now: SystemTime,
    ) -> io::Result<Vec<Pruned>> {
        self.prune_with(kind, max_age, now, |path| fs::remove_file(path))
    }

    fn prune_with(
        &self,
        kind: ArtifactKind,
        max_age: Duration,
        now: SystemTime,
        mut remove: impl FnMut(&Path) -> io::Result<()>,
    ) -> io::Result<Vec<Pruned>> {
        let directory = self.directory(kind);
        log::info!(target: "store", "Pruning backups older than {}s in {}", max_age.as_secs(), directory.display());

        let mut pruned = Vec::new();
        for entry in fs::read_dir(directory)? {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    log::warn!(target: "store", "Reading an entry of {} failed: {e}", directory.display());
                    continue;
                }
            };

            let modified = match fs::metadata(&path).and_then(|metadata| {
                metadata.is_file().then(|| metadata.modified()).transpose()
            }) {
                Ok(Some(modified)) => modified,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!(target: "store", "Reading the age of {} failed: {e}", path.display());
                    continue;
                }
            };

            let expired = now
                .duration_since(modified)
                .is_ok_and(|age| age > max_age);
            if expired {
                let result = remove(&path);
                pruned.push(Pruned { path, result });
            }
        }

        Ok(pruned)
    }

    /// Deletes monthly backups of `database` not retained by [MonthlyRetention].
    pub fn prune_monthly(&self, database: &str, keep: Option<usize>) -> io::Result<Vec<Pruned>> {
        let mut retention = MonthlyRetention::new(keep);
        let mut pruned = Vec::new();

        let artifacts = self.artifacts(ArtifactKind::Monthly)?;
        for artifact in artifacts.into_iter().rev() {
            if artifact.database != database || retention.retain(artifact.date) {
                continue;
            }
            let result = fs::remove_file(&artifact.path);
            pruned.push(Pruned {
                path: artifact.path,
                result,
            });
        }

        Ok(pruned)
    }
}
