//! Library to back up a [PostgreSQL][pg] database running in a Docker container.
//!
//! Every run takes a compressed daily dump and, when due, a full monthly base
//! backup. Backups are copied out of the container into a local store and
//! expired daily backups are pruned. See [`orchestrator`] for the sequence of
//! a run and [`backends`] for the individual backup types.
//!
//! [pg]: https://www.postgresql.org/

#![forbid(unsafe_code)]

pub mod backends;
pub mod cli;
pub mod config;
pub mod container;
pub mod notify;
pub mod orchestrator;
pub mod util;
