//! What to sample next: the base-station-driven node list and the
//! periodically-due sampleset scheduler with its persistent
//! last-sampled-at database.

pub mod channels;
pub mod database;
pub mod nodelist;
pub mod sampleset;
pub mod supervisor;

pub use channels::{read_channels, Ts1xChannel};
pub use database::SamplesetDb;
pub use nodelist::{NodeEntry, NodeList};
pub use sampleset::Sampleset;
pub use supervisor::SamplesetSupervisor;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no node list file configured")]
    NoNodeListFile,
}
