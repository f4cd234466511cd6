// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The verifier validation seam.
//!
//! Every fetched command carries a verifier, an authenticity token proving
//! the command really originated from the privacy service. Token validation
//! involves key discovery against an external identity service and is not
//! implemented here; the client calls through this seam and reacts to the
//! outcome. Commands with rejected tokens are checkpointed as verification
//! failures and filtered out of the batch before the caller sees them.

use std::borrow::Cow;
use std::fmt::{self, Display, Formatter};

use crate::commands::CommandKind;

/// The claims a verifier must attest to for one command.
#[derive(Debug, Clone)]
pub struct CommandClaims<'a> {
    /// The command the token must be bound to.
    pub command_id: &'a str,

    /// The operation the token must authorize.
    pub operation: CommandKind,

    /// For export commands, the destination the token must authorize.
    pub azure_blob_container_target_uri: Option<&'a str>,

    /// For delete commands, the data type the token must authorize.
    pub data_type: Option<&'a str>,
}

/// Validates command authenticity tokens.
///
/// The returned future must be `Send`; validation runs inside the fetch
/// path of the client.
pub trait CommandValidator: Send + Sync {
    /// Verifies that `verifier` is an authentic token attesting to `claims`.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] describing whether the token was
    /// rejected or whether validation itself failed.
    fn ensure_valid(
        &self,
        verifier: &str,
        claims: &CommandClaims<'_>,
    ) -> impl Future<Output = Result<(), ValidationError>> + Send;
}

/// A validator that accepts every token.
///
/// Intended for test rigs and environments where the feed does not enforce
/// validation; production agents must plug in a real validator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateNothing;

impl CommandValidator for ValidateNothing {
    async fn ensure_valid(&self, _verifier: &str, _claims: &CommandClaims<'_>) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Why a command failed validation.
///
/// The distinction matters because the two cases are acknowledged to the
/// feed with different statuses: a rejected token is a terminal verification
/// failure, while an infrastructure failure is reported as unexpected so the
/// service can tell the cases apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationFailureKind {
    /// The token was examined and rejected.
    Rejected,

    /// Validation could not be carried out, for example because key
    /// discovery was unreachable.
    Unexpected,
}

/// An error raised when a command's authenticity token does not hold up.
#[derive(Debug)]
pub struct ValidationError {
    kind: ValidationFailureKind,
    message: Cow<'static, str>,
}

impl ValidationError {
    /// Creates an error for a token that was examined and rejected.
    #[must_use]
    pub fn rejected(message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind: ValidationFailureKind::Rejected,
            message: message.into(),
        }
    }

    /// Creates an error for a validation attempt that could not complete.
    #[must_use]
    pub fn unexpected(message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind: ValidationFailureKind::Unexpected,
            message: message.into(),
        }
    }

    /// Returns which way validation failed.
    #[must_use]
    pub const fn kind(&self) -> ValidationFailureKind {
        self.kind
    }
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.kind {
            ValidationFailureKind::Rejected => write!(f, "the verifier was rejected: {}", self.message),
            ValidationFailureKind::Unexpected => write!(f, "verifier validation failed: {}", self.message),
        }
    }
}

impl std::error::Error for ValidationError {}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(ValidationError: Send, Sync, std::error::Error);
    assert_impl_all!(ValidateNothing: Send, Sync, Copy);

    #[tokio::test]
    async fn validate_nothing_accepts_everything() {
        let claims = CommandClaims {
            command_id: "command-1",
            operation: CommandKind::Delete,
            azure_blob_container_target_uri: None,
            data_type: Some("BrowsingHistory"),
        };

        ValidateNothing.ensure_valid("anything", &claims).await.unwrap();
    }

    #[test]
    fn error_kinds_are_observable() {
        assert_eq!(ValidationError::rejected("bad").kind(), ValidationFailureKind::Rejected);
        assert_eq!(
            ValidationError::unexpected("offline").kind(),
            ValidationFailureKind::Unexpected
        );
    }

    #[test]
    fn error_display() {
        assert_eq!(
            ValidationError::rejected("expired").to_string(),
            "the verifier was rejected: expired"
        );
    }
}
