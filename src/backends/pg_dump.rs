//! Daily logical dump using [`pg_dump`](https://www.postgresql.org/docs/current/app-pgdump.html).

use crate::backends::Backup;
use crate::config::Settings;
use crate::container::{ContainerCommand, RemoteArtifact};
use crate::util::retention::ArtifactKind;

const DUMP_FILE: RemoteArtifact = RemoteArtifact::file("/tmp/backup.sql.gz");

/// The [PgDump] backend writes a gzip compressed SQL dump of the database.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgDump;

impl Backup for PgDump {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::Daily
    }

    fn dump_command(&self, settings: &Settings) -> ContainerCommand {
        ContainerCommand::new([
            "pg_dump",
            "-U",
            settings.user.as_str(),
            settings.database.as_str(),
            "-Z",
            "9",
            "-f",
            DUMP_FILE.path,
        ])
        .env("PGPASSWORD", &settings.password)
    }

    fn retrieval_source(&self) -> RemoteArtifact {
        DUMP_FILE
    }

    fn temp_artifact(&self) -> RemoteArtifact {
        DUMP_FILE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::tests::settings;

    #[test]
    fn dump_is_compressed_into_tmp() {
        let command = PgDump.dump_command(&settings());
        assert_eq!(
            command.to_string(),
            "pg_dump -U backup app -Z 9 -f /tmp/backup.sql.gz"
        );
        assert_eq!(
            command.envs(),
            [("PGPASSWORD".to_string(), "secret".to_string())]
        );
    }
}
