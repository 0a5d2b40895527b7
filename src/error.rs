use std::io;

/// Errors surfaced by the event bus.
///
/// Size violations and lost-sync are recoverable conditions the bus handles
/// internally (see `bus.rs`); they appear here mainly so tests and callers
/// that build their own binding layer can match on them.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("no shared-memory segment at key {key} and no buffer size given to create one")]
    NotFound { key: i32 },

    #[error("payload of {len} bytes exceeds the bus's {limit}-byte capacity")]
    TooLarge { len: usize, limit: usize },

    #[error("frame magic mismatch at offset {offset}, resyncing")]
    LostSync { offset: usize },

    #[error("syscall interrupted by a signal")]
    Interrupted,

    #[error("invalid argument: {0}")]
    BadArg(String),

    #[error("allocation failed")]
    OutOfMemory,

    #[error("ipc syscall failed: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, BusError>;
