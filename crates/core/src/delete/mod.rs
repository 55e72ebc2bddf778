//! Bulk deletion
//!
//! Four strategies share one accounting model:
//! - [`BatchDeleter`]: sequential fixed-size batches
//! - [`ParallelDeleteCoordinator`]: batches through a bounded worker pool
//! - [`StreamingDeleteConsumer`]: keys drained from a channel, batched on the fly
//! - [`OptimizedDeleter`]: single keys buffered until a flush threshold
//!
//! Every submitted key ends up in exactly one of [`DeleteResult::deleted`] or
//! [`DeleteResult::errors`]. When a batch call fails at the transport level,
//! its keys go to [`DeleteResult::unknown`] and keys that were never sent go
//! to [`DeleteResult::pending`], and the partial result travels with the
//! error in a [`DeleteFailure`].

mod batch;
mod optimized;
mod parallel;
mod stream;

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::error::{Error, Result};
use crate::traits::{DeleteBatchOutput, KeyError};

pub use batch::{BatchDeleter, split_into_batches};
pub use optimized::OptimizedDeleter;
pub use parallel::ParallelDeleteCoordinator;
pub use stream::StreamingDeleteConsumer;

/// Error code recorded for keys the backend neither confirmed nor rejected
pub const UNCONFIRMED_CODE: &str = "Unconfirmed";

/// Aggregate outcome of a delete operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteResult {
    /// Keys the backend confirmed as deleted
    pub deleted: Vec<String>,

    /// Keys the backend refused
    pub errors: Vec<KeyError>,

    /// Keys sent in a batch whose call failed; their state is unknown
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unknown: Vec<String>,

    /// Keys never sent because the operation stopped first
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<String>,
}

impl DeleteResult {
    /// Number of keys accounted for across all four sequences
    pub fn total(&self) -> usize {
        self.deleted.len() + self.errors.len() + self.unknown.len() + self.pending.len()
    }

    /// Number of keys with a definite outcome
    pub fn resolved(&self) -> usize {
        self.deleted.len() + self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Append another result
    pub fn merge(&mut self, other: DeleteResult) {
        self.deleted.extend(other.deleted);
        self.errors.extend(other.errors);
        self.unknown.extend(other.unknown);
        self.pending.extend(other.pending);
    }

    /// Fold one batch response in, reconciled against the keys that were sent
    ///
    /// Keys missing from the response are recorded as unconfirmed errors, and
    /// keys the response mentions but that were not sent are ignored.
    pub(crate) fn record_batch(&mut self, sent: Vec<String>, output: DeleteBatchOutput) {
        let rejected: HashMap<String, KeyError> = output
            .errors
            .into_iter()
            .map(|e| (e.key.clone(), e))
            .collect();
        let confirmed: HashSet<String> = output.deleted.into_iter().collect();

        for key in sent {
            if let Some(error) = rejected.get(&key).cloned() {
                tracing::warn!(key = %key, code = %error.code, "Backend refused delete");
                self.errors.push(error);
            } else if confirmed.contains(&key) {
                self.deleted.push(key);
            } else {
                self.errors.push(KeyError::new(
                    key,
                    UNCONFIRMED_CODE,
                    "key missing from delete response",
                ));
            }
        }
    }

    /// Fold a finished batch in; returns the transport error, if any
    pub(crate) fn absorb(&mut self, outcome: BatchOutcome) -> Option<Error> {
        match outcome.output {
            Ok(output) => {
                self.record_batch(outcome.keys, output);
                None
            }
            Err(error) => {
                tracing::debug!(keys = outcome.keys.len(), error = %error, "Delete batch failed");
                self.unknown.extend(outcome.keys);
                Some(error)
            }
        }
    }
}

/// A batch's keys together with the backend's answer for them
pub(crate) struct BatchOutcome {
    pub(crate) keys: Vec<String>,
    pub(crate) output: Result<DeleteBatchOutput>,
}

/// A delete operation that stopped early
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct DeleteFailure {
    /// First fatal error (transport failure or cancellation)
    pub error: Error,
    /// Everything accounted for before the operation stopped
    pub partial: DeleteResult,
}

impl DeleteFailure {
    pub fn new(error: Error, partial: DeleteResult) -> Self {
        Self { error, partial }
    }

    pub fn is_cancellation(&self) -> bool {
        self.error.is_cancellation()
    }
}

impl From<DeleteFailure> for Error {
    fn from(failure: DeleteFailure) -> Self {
        failure.error
    }
}

/// Result type of the delete strategies
pub type DeleteOutcome = std::result::Result<DeleteResult, DeleteFailure>;

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashSet;

    use super::DeleteResult;

    pub(crate) fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("obj/{i:05}")).collect()
    }

    /// Every submitted key appears exactly once across the result
    pub(crate) fn assert_exact_accounting(result: &DeleteResult, submitted: &[String]) {
        let mut seen: Vec<&str> = result
            .deleted
            .iter()
            .map(String::as_str)
            .chain(result.errors.iter().map(|e| e.key.as_str()))
            .chain(result.unknown.iter().map(String::as_str))
            .chain(result.pending.iter().map(String::as_str))
            .collect();
        assert_eq!(seen.len(), submitted.len(), "key count mismatch");

        let unique: HashSet<&str> = seen.iter().copied().collect();
        assert_eq!(unique.len(), seen.len(), "a key was accounted twice");

        seen.sort_unstable();
        let mut expected: Vec<&str> = submitted.iter().map(String::as_str).collect();
        expected.sort_unstable();
        assert_eq!(seen, expected);
    }
}
