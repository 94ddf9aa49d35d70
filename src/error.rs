use std::io;

/// Error taxonomy for the managed selector (spec §7).
///
/// Only the fatal multiplexer-wait failure and the public entry points
/// (`submit`, `dump`, `stop`) ever hand one of these back to a caller.
/// Everything else arising on the producer thread (update application,
/// per-key processing, cancelled keys, accept/connect failures) is logged
/// and swallowed locally, or reported to the manager via its own hooks.
#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    #[error("selector {0} multiplexer wait failed")]
    MultiplexerFailed(usize, #[source] io::Error),

    #[error("update application failed")]
    UpdateFailed(#[source] io::Error),

    #[error("per-key processing failed")]
    KeyProcessingFailed(#[source] io::Error),

    #[error("key was cancelled")]
    KeyCancelled,

    #[error("accept failed")]
    AcceptFailed(#[source] io::Error),

    #[error("connect timed out")]
    ConnectTimedOut,

    #[error("connect failed")]
    ConnectFailed(#[source] io::Error),

    #[error("executor rejected task")]
    ExecutorRejected,

    #[error("selector is already stopped")]
    AlreadyStopped,

    #[error("dump did not complete within the configured timeout")]
    DumpTimedOut,
}
