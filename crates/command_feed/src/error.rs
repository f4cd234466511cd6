// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types for the feed client and receiver.

use std::fmt::{self, Display, Formatter};

use http::StatusCode;
use recoverable::{Recovery, RecoveryInfo};
use resend::TransportError;

/// An error raised while fetching a batch of commands.
///
/// Fetch errors are transient from the receiver's point of view: the fetch
/// loop logs them, backs off, and keeps running.
#[derive(Debug)]
pub struct FetchError(FetchErrorKind);

#[derive(Debug)]
enum FetchErrorKind {
    /// The exchange produced no response.
    Transport(TransportError),

    /// The feed answered with a status the client does not understand.
    Status { status: StatusCode, body: String },

    /// The response body could not be decoded.
    Decode(serde_json::Error),

    /// The fetch was abandoned because cancellation was requested.
    Cancelled,
}

impl FetchError {
    pub(crate) fn unexpected_status(status: StatusCode, body: impl Into<String>) -> Self {
        Self(FetchErrorKind::Status {
            status,
            body: body.into(),
        })
    }

    pub(crate) const fn cancelled() -> Self {
        Self(FetchErrorKind::Cancelled)
    }

    /// Returns `true` when the fetch was abandoned due to cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.0, FetchErrorKind::Cancelled)
    }
}

impl Display for FetchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.0 {
            FetchErrorKind::Transport(error) => write!(f, "fetching commands failed: {error}"),
            FetchErrorKind::Status { status, body } => {
                write!(f, "fetching commands returned unexpected status {status}, body: {body:?}")
            }
            FetchErrorKind::Decode(error) => write!(f, "decoding the command batch failed: {error}"),
            FetchErrorKind::Cancelled => write!(f, "fetching commands was cancelled"),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.0 {
            FetchErrorKind::Transport(error) => Some(error),
            FetchErrorKind::Decode(error) => Some(error),
            FetchErrorKind::Status { .. } | FetchErrorKind::Cancelled => None,
        }
    }
}

impl From<TransportError> for FetchError {
    fn from(error: TransportError) -> Self {
        Self(FetchErrorKind::Transport(error))
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(error: serde_json::Error) -> Self {
        Self(FetchErrorKind::Decode(error))
    }
}

impl Recovery for FetchError {
    fn recovery(&self) -> RecoveryInfo {
        RecoveryInfo::retry()
    }
}

/// An error raised while acknowledging a command.
///
/// The conflict case is a distinct variant rather than a status buried in a
/// generic error: a conflict means the lease was already checkpointed or has
/// expired elsewhere, which callers must handle differently from a transport
/// blip.
#[derive(Debug)]
pub enum CheckpointError {
    /// The lease was already checkpointed or has expired elsewhere.
    Conflict {
        /// The command whose lease was contested.
        command_id: String,
    },

    /// The checkpoint exchange failed before producing a usable answer.
    Transport(TransportError),
}

impl Display for CheckpointError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict { command_id } => {
                write!(f, "checkpoint conflict for command {command_id}")
            }
            Self::Transport(error) => write!(f, "checkpoint failed: {error}"),
        }
    }
}

impl std::error::Error for CheckpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Conflict { .. } => None,
            Self::Transport(error) => Some(error),
        }
    }
}

impl From<TransportError> for CheckpointError {
    fn from(error: TransportError) -> Self {
        Self::Transport(error)
    }
}

/// An error raised when a feed host name does not form valid endpoint URIs.
#[derive(Debug)]
pub struct EndpointError(http::uri::InvalidUri);

impl Display for EndpointError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "invalid feed endpoint: {}", self.0)
    }
}

impl std::error::Error for EndpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl From<http::uri::InvalidUri> for EndpointError {
    fn from(error: http::uri::InvalidUri) -> Self {
        Self(error)
    }
}

/// An error raised when the receiver's concurrency limit is set to zero.
///
/// Limits below the logical minimum of ten are clamped rather than rejected;
/// only a zero limit, which would stall the receiver entirely, is an error.
#[derive(Debug)]
pub struct InvalidConcurrencyLimit;

impl Display for InvalidConcurrencyLimit {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "the concurrency limit must be a positive number")
    }
}

impl std::error::Error for InvalidConcurrencyLimit {}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use recoverable::RecoveryKind;
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(FetchError: Send, Sync, std::error::Error);
    assert_impl_all!(CheckpointError: Send, Sync, std::error::Error);
    assert_impl_all!(EndpointError: Send, Sync, std::error::Error);

    #[test]
    fn fetch_error_display() {
        let error = FetchError::unexpected_status(StatusCode::BAD_GATEWAY, "oops");
        assert!(error.to_string().contains("502"));
        assert!(error.to_string().contains("oops"));

        assert!(FetchError::cancelled().is_cancelled());
        assert!(!FetchError::from(TransportError::message("x")).is_cancelled());
    }

    #[test]
    fn fetch_error_is_transient() {
        let error = FetchError::from(TransportError::message("reset"));
        assert_eq!(error.recovery().kind(), RecoveryKind::Retry);
    }

    #[test]
    fn checkpoint_conflict_is_distinct() {
        let conflict = CheckpointError::Conflict {
            command_id: "command-9".into(),
        };

        assert!(matches!(conflict, CheckpointError::Conflict { .. }));
        assert!(conflict.to_string().contains("command-9"));
    }

    #[test]
    fn invalid_concurrency_limit_display() {
        assert_eq!(
            InvalidConcurrencyLimit.to_string(),
            "the concurrency limit must be a positive number"
        );
    }
}
