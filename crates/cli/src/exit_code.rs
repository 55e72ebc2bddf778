//! Process exit codes
//!
//! Codes are stable so scripts can branch on them.

use objsync_core::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    /// Everything succeeded
    Success = 0,
    /// Unclassified failure, or some operations failed
    GeneralError = 1,
    /// Bad arguments, paths or configuration
    UsageError = 2,
    /// Network or transport failure
    NetworkError = 3,
    /// Credentials rejected
    AuthError = 4,
    /// Alias, bucket or object does not exist
    NotFound = 5,
    /// Deadline exceeded
    Timeout = 124,
    /// Interrupted by the user
    Interrupted = 130,
}

impl ExitCode {
    /// Pick the exit code for an engine error
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::Network(_) => ExitCode::NetworkError,
            Error::Auth(_) => ExitCode::AuthError,
            Error::NotFound(_) | Error::AliasNotFound(_) => ExitCode::NotFound,
            Error::Config(_) | Error::InvalidPath(_) => ExitCode::UsageError,
            Error::Cancelled => ExitCode::Interrupted,
            Error::DeadlineExceeded => ExitCode::Timeout,
            _ => ExitCode::GeneralError,
        }
    }

    /// Pick the exit code for a wrapped error, looking through context layers
    pub fn from_anyhow(error: &anyhow::Error) -> Self {
        error
            .chain()
            .find_map(|cause| cause.downcast_ref::<Error>())
            .map(Self::from_error)
            .unwrap_or(ExitCode::GeneralError)
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code as u8)
    }
}
