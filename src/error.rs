use std::time::Duration;

use thiserror::Error;

/// Why an effect job ended abnormally.
#[derive(Error, Debug)]
pub enum EffectFailure {
    /// The job returned an error instead of sending a failure action.
    #[error("effect failed: {0:#}")]
    Failed(anyhow::Error),

    #[error("effect panicked: {0}")]
    Panicked(String),
}

/// Assertion failures reported by [`crate::TestStore`].
#[derive(Error, Debug)]
pub enum TestStoreError {
    #[error(
        "timed out after {timeout:?} waiting for an action; {in_flight} effect(s) still in flight, \
         unclaimed received actions: {received:?}"
    )]
    Timeout {
        timeout: Duration,
        in_flight: usize,
        received: Vec<String>,
    },

    #[error(
        "expected to receive a matching action, but no effect is running and none of the \
         received actions matched: {received:?}"
    )]
    NoMatchingAction { received: Vec<String> },

    #[error("expected every received action to be asserted, but {} remain: {actions:?}", actions.len())]
    UnreceivedActions { actions: Vec<String> },

    #[error("state after {action} differs from expectation\nexpected: {expected}\n  actual: {actual}")]
    StateMismatch {
        action: String,
        expected: String,
        actual: String,
    },

    #[error("effect failed while the test store was running: {0}")]
    EffectFailed(String),

    #[error("{in_flight} effect(s) still running after {timeout:?}")]
    EffectsStillRunning { timeout: Duration, in_flight: usize },
}
