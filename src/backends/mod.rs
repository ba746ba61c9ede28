//! Backend modules producing the individual backup types.
//!
//! Currently the following backends are implemented:
//!
//! - [PgDump]: Compressed logical dump of the database, taken daily.
//! - [PgBaseBackup]: Full base backup of the cluster, taken monthly.

pub mod pg_basebackup;
pub mod pg_dump;

pub use pg_basebackup::PgBaseBackup;
pub use pg_dump::PgDump;

use crate::config::Settings;
use crate::container::{ContainerCommand, RemoteArtifact};
use crate::util::retention::ArtifactKind;

/// Generic backup backend.
///
/// A backend describes how its backup is produced inside the container; the
/// orchestrator runs the dump, retrieves the result and removes the temporary
/// artifact.
pub trait Backup {
    /// Kind of artifact the backend produces.
    fn kind(&self) -> ArtifactKind;

    /// Command producing the backup inside the container.
    fn dump_command(&self, settings: &Settings) -> ContainerCommand;

    /// The file to copy out of the container once the dump succeeded.
    fn retrieval_source(&self) -> RemoteArtifact;

    /// Everything the dump leaves behind in the container.
    ///
    /// Removed before and after every run and after each retrieval.
    fn temp_artifact(&self) -> RemoteArtifact;
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::config::Settings;

    pub(crate) fn settings() -> Settings {
        Settings {
            container: "postgres".into(),
            database: "app".into(),
            user: "backup".into(),
            password: "secret".into(),
            backup_dir: "/srv/backups".into(),
            webhook_url: None,
        }
    }
}
