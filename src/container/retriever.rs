use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_more::{Display, Error, From};
use flate2::write::GzEncoder;

use super::{ContainerSession, RemoteArtifact, RuntimeError};

/// Compression applied while writing a retrieved artifact.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Compression {
    /// Store the bytes as they come out of the container.
    None,
    /// Gzip the stream.
    Gzip,
}

/// Errors on retrieving an artifact from the container.
#[derive(Debug, Display, Error, From)]
pub enum RetrieveError {
    /// The destination has no file name to derive a temporary name from.
    #[display("Invalid destination path: {}", _0.display())]
    InvalidDestination(#[error(ignore)] PathBuf),
    /// Copying the artifact out of the container failed.
    #[display("{_0}")]
    #[from]
    Runtime(RuntimeError),
    /// Writing the artifact to local storage failed.
    #[display("Writing {} failed: {source}", path.display())]
    Write {
        path: PathBuf,
        source: io::Error,
    },
}

/// Copies artifacts out of the container into local files.
///
/// The artifact is written to a hidden temporary sibling and renamed onto the
/// destination once complete, so the destination is either absent, the
/// previous version, or the complete new artifact.
#[derive(Debug, Clone, Default)]
pub struct ArchiveRetriever {
    timeout: Option<Duration>,
}

impl ArchiveRetriever {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    /// Retrieves `source` to `destination` and returns the bytes received.
    pub fn retrieve(
        &self,
        session: &mut dyn ContainerSession,
        source: &RemoteArtifact,
        destination: &Path,
        compression: Compression,
    ) -> Result<u64, RetrieveError> {
        let partial = partial_path(destination)?;
        log::debug!(
            target: "container::retriever",
            "Retrieving {source} to {}",
            partial.display()
        );

        let result = self.write_partial(session, source, &partial, compression);
        let received = match result {
            Ok(received) => received,
            Err(e) => {
                if let Err(remove_err) = fs::remove_file(&partial) {
                    if remove_err.kind() != io::ErrorKind::NotFound {
                        log::warn!(
                            target: "container::retriever",
                            "Removing incomplete {} failed: {remove_err}",
                            partial.display()
                        );
                    }
                }
                return Err(e);
            }
        };

        fs::rename(&partial, destination).map_err(|source| {
            let _ = fs::remove_file(&partial);
            RetrieveError::Write {
                path: destination.to_path_buf(),
                source,
            }
        })?;
        log::debug!(
            target: "container::retriever",
            "Stored {received} bytes at {}",
            destination.display()
        );

        Ok(received)
    }

    fn write_partial(
        &self,
        session: &mut dyn ContainerSession,
        source: &RemoteArtifact,
        partial: &Path,
        compression: Compression,
    ) -> Result<u64, RetrieveError> {
        let write_err = |source: io::Error| RetrieveError::Write {
            path: partial.to_path_buf(),
            source,
        };

        let file = File::create(partial).map_err(write_err)?;
        let mut writer = BufWriter::new(file);

        let (received, file) = match compression {
            Compression::None => {
                let received = session.copy_out(source, &mut writer, self.timeout)?;
                (received, writer.into_inner().map_err(|e| write_err(e.into_error()))?)
            }
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(writer, flate2::Compression::default());
                let received = session.copy_out(source, &mut encoder, self.timeout)?;
                let writer = encoder.finish().map_err(write_err)?;
                (received, writer.into_inner().map_err(|e| write_err(e.into_error()))?)
            }
        };
        file.sync_all().map_err(write_err)?;

        Ok(received)
    }
}

fn partial_path(destination: &Path) -> Result<PathBuf, RetrieveError> {
    let file_name = destination
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| RetrieveError::InvalidDestination(destination.to_path_buf()))?;

    Ok(destination.with_file_name(format!(".{file_name}.partial")))
}
