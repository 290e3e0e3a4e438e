use thiserror::Error;

/// Boxed error returned by iteration runners and reporters.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by the scheduling core.
///
/// Iteration failures are not represented here: they are counted per iteration
/// and never leave the worker that produced them.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid run or executor configuration, detected before anything starts.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The pool reached its maximum and the waiter was canceled before a VU freed up.
    #[error("VU pool exhausted (max {max} VUs)")]
    PoolExhausted { max: usize },

    /// The pool was disposed while a holder still asked for VUs.
    #[error("VU pool is closed")]
    PoolClosed,

    /// The runner's one-time VU setup failed.
    #[error("failed to initialize VU {id}: {source}")]
    VuInit {
        id: u64,
        #[source]
        source: BoxError,
    },

    /// The aggregator stopped consuming before the batch could be pushed.
    #[error("sample pipeline is closed")]
    PipelineClosed,

    /// A spawned task panicked or was aborted.
    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
