//! Monthly full backup using [`pg_basebackup`](https://www.postgresql.org/docs/current/app-pgbasebackup.html).

use crate::backends::Backup;
use crate::config::Settings;
use crate::container::{ContainerCommand, RemoteArtifact};
use crate::util::retention::ArtifactKind;

const TARGET_DIR: RemoteArtifact = RemoteArtifact::directory("/tmp/full_backup");
const BASE_TAR: RemoteArtifact = RemoteArtifact::file("/tmp/full_backup/base.tar");

/// The [PgBaseBackup] backend takes a tar format base backup of the cluster.
///
/// WAL files are not included (`-X none`). The uncompressed `base.tar` is
/// gzip compressed while being retrieved.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgBaseBackup;

impl Backup for PgBaseBackup {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::Monthly
    }

    fn dump_command(&self, settings: &Settings) -> ContainerCommand {
        ContainerCommand::new([
            "pg_basebackup",
            "-U",
            settings.user.as_str(),
            "-Ft",
            "-X",
            "none",
            "-P",
            "-D",
            TARGET_DIR.path,
        ])
        .env("PGPASSWORD", &settings.password)
    }

    fn retrieval_source(&self) -> RemoteArtifact {
        BASE_TAR
    }

    fn temp_artifact(&self) -> RemoteArtifact {
        TARGET_DIR
    }
}
