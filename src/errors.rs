use thiserror::Error;

/// A `Result` alias where the `Err` case is [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by the storage primitives.
///
/// Anything coming out of the database that is not covered by a more specific
/// variant is propagated unchanged as [`Error::Database`]; this layer adds no
/// retries beyond the bounded serialization-conflict retry inside
/// [`dequeue`](crate::JobQueue::dequeue).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A required identifier (resource name, queue name, key, …) was empty or
    /// otherwise unusable. Raised before any store access.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The lock could not be acquired within the requested timeout. This is
    /// an expected outcome under contention, not a bug.
    #[error("could not place a lock on the resource `{resource}`: lock timeout")]
    LockTimeout {
        /// Name of the contested resource.
        resource: String,
    },

    /// Releasing a lock found no matching row. The "one row per held lock"
    /// invariant was violated externally; never swallowed.
    #[error("could not release a lock on the resource `{resource}`: lock does not exist")]
    LockInconsistency {
        /// Name of the resource whose row was missing.
        resource: String,
    },

    /// A queue name was bound to more than one queue provider.
    #[error("queue `{0}` is already bound to a provider")]
    QueueAlreadyBound(String),

    /// The operation was interrupted by its cancellation token during a
    /// blocking wait. Distinct from an error: no partial state is left behind.
    #[error("the operation was cancelled")]
    Cancelled,

    /// A stored payload could not be deserialized when read back.
    #[error("a stored payload could not be deserialized")]
    Deserialization(#[from] serde_json::Error),

    /// Any other database error, propagated unchanged.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}
