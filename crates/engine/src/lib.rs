//! The iterative bulk-synchronous execution pipeline: tile readers feed tile
//! processors (leader plus followers) inside each edge engine; the vertex
//! domain joins index data against the global vertex array, reduces partial
//! results stripe-by-stripe and applies the algorithm's finalizer at every
//! iteration boundary. Stages communicate through back-pressured byte rings,
//! with a selective-scheduling side channel that lets converged tiles be
//! skipped entirely.

pub mod config;
pub mod events;
pub mod runtime;
pub mod split;

mod edge;
mod reader;
mod tables;
mod tile_processor;
mod vertex;
mod vertex_array;

#[cfg(test)]
mod tests;

pub use config::{
    GlobalFetcherMode, GlobalReducerMode, LocalFetcherMode, RingSizes, RuntimeConfig,
    TileProcessorMode,
};
pub use events::{ComponentKind, NoopSink, PerfEvent, PerfEventSink, RecordingSink};
pub use runtime::{RunOutcome, Runtime};

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("configuration mismatch: {0}")]
    ConfigMismatch(String),
    #[error(transparent)]
    Store(#[from] tiles::StoreError),
    #[error(transparent)]
    Ring(#[from] ringbuf::RingError),
    #[error("tile corruption: {0}")]
    TileCorruption(#[from] protocol::BlockError),
    #[error(transparent)]
    Transport(#[from] ringbuf::TransportError),
    #[error("tile {tile_id} carries {count_edges} edges, above the per-tile limit")]
    Overflow { tile_id: u64, count_edges: u64 },
    #[error("output directory {0} is not usable")]
    OutputDir(PathBuf),
}

/// Fatal-path exit: errors that can corrupt shared state abandon the
/// iteration and terminate the process with a non-zero code, leaving the
/// previous iteration's output files intact.
pub(crate) fn fatal(error: EngineError) -> ! {
    tracing::error!(%error, "fatal pipeline error");
    std::process::exit(1);
}
