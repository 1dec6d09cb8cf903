//! Pluggable collective-algorithm scheduler.
//!
//! Decides whether a pre-compiled collective algorithm can execute a
//! requested operation, keeps the per-rank algorithm instances loaded and
//! connected, batches grouped operations per thread and falls back to the
//! plain collectives when nothing applies.

use std::path::PathBuf;

use thiserror::Error;

pub mod algo;
pub mod comm;
pub mod config;
pub mod fallback;
pub mod group;
pub mod lifecycle;
pub mod param;
pub mod registry;
pub mod scheduler;

pub use algo::{AlgoHandle, AlgoMeta, MAX_NUM_ALGOS};
pub use comm::{Communicator, CommunicatorId, PeerInfo};
pub use config::SchedulerConfig;
pub use group::{clear_is_caller, is_caller, set_is_caller, CallerGuard, GroupStatus};
pub use lifecycle::AlgoScheduler;
pub use param::{CollFunc, CollOp, DataType, DevicePtr, ReduceOp, SchedulerParam, StreamHandle};
pub use registry::CollaboratorRegistry;

pub type CollaboratorError = anyhow::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No algorithm directory could be opened, tried {0:?}")]
    AlgoDirNotFound(Vec<PathBuf>),
    #[error("Failed to list algorithm directory {0:?}: {1}")]
    AlgoDirRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse algorithm file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: CollaboratorError,
    },
    #[error("Algorithm handle pool exhausted, at most {0} algorithms can be loaded")]
    HandlePoolExhausted(usize),
    #[error("No plain collective to fall back to for {0:?}")]
    NoFallback(CollFunc),
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),
    #[error("External scheduler {op} failed with code {code}")]
    Plugin { op: &'static str, code: i32 },
    #[error("Collaborator: {0}")]
    Collaborator(#[from] CollaboratorError),
}
