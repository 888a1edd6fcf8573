use thiserror::Error;

/// Errors surfaced by the edit-thread APIs.
///
/// Realtime paths never construct these; they degrade by counting dropped
/// work instead (see the intake's lost-event counters).
#[derive(Debug, Error)]
pub enum Error {
    /// The JACK client refused a port registration or connection.
    #[error("jack error: {0}")]
    Jack(#[from] jack::Error),

    /// Not a single intake port could be registered.
    #[error("no intake ports could be registered")]
    NoIntakePorts,

    /// A sequence file could not be read or written.
    #[error("persistence failure: {0}")]
    Persistence(#[from] std::io::Error),

    /// A sequence file exists but does not contain valid sequence JSON.
    #[error("malformed sequence data: {0}")]
    SequenceData(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
