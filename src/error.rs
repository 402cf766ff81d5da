use std::fmt;

/// Errors surfaced by the block/pipe/pipeline primitives.
///
/// Cancellation is deliberately **not** a variant here (spec §5, §7): a
/// cancelled block's `Complete` still resolves successfully, it just skips
/// invoking `done` for in-flight items.
#[derive(thiserror::Error, Debug)]
pub enum PipeweaveError {
    /// A builder was given a configuration that can never produce a working
    /// block (zero capacity, zero parallelism, empty id, ...).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// `Pipeline::Add` was called with an id already present in the
    /// pipeline.
    #[error("duplicate pipe id: {0}")]
    DuplicateId(String),

    /// `Pipeline::Send`/`SendNext` referenced an id with no matching pipe.
    #[error("pipe not found: {0}")]
    PipeNotFound(String),

    /// A `BlockItem` accessor was used against the wrong variant (e.g.
    /// reading a batch out of a `Single`, or a value out of `Empty`).
    #[error("type mismatch: {0}")]
    TypeMismatch(&'static str),

    /// `ParallelBlock::Send` was called without a usable item identity
    /// (spec §4.5 forbids `null` items as fork-join keys).
    #[error("fork-join item requires a stable identity")]
    MissingKey,

    /// The user-supplied action or `done` callback returned an error.
    #[error("user action failed: {0}")]
    UserAction(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl PipeweaveError {
    pub fn user_action<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::UserAction(Box::new(err))
    }

    pub fn user_action_msg(msg: impl fmt::Display) -> Self {
        Self::UserAction(Box::new(MessageError(msg.to_string())))
    }
}

#[derive(Debug)]
struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for MessageError {}
