// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::borrow::Cow;
use std::fmt::{self, Display, Formatter};

use bytes::Bytes;
use http::{Request, Response};
use recoverable::{Recovery, RecoveryInfo};

/// A single outbound request/response exchange.
///
/// This is the seam between retry orchestration and the actual wire
/// transport. Implementations perform one attempt: they send the request and
/// return the response, or a [`TransportError`] when no response was
/// obtained at all (connection refused, timeout, broken stream). Status-based
/// failure handling belongs to the caller; an implementation must return
/// error responses as `Ok`.
///
/// The returned future must be `Send` so exchanges can run inside spawned
/// tasks.
pub trait SendRequest: Send + Sync {
    /// Sends the request and awaits the response.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] only when the exchange produced no response.
    fn send(&self, request: Request<Bytes>) -> impl Future<Output = Result<Response<Bytes>, TransportError>> + Send;
}

impl<T: SendRequest> SendRequest for &T {
    fn send(&self, request: Request<Bytes>) -> impl Future<Output = Result<Response<Bytes>, TransportError>> + Send {
        (**self).send(request)
    }
}

/// An error raised when an exchange produced no response.
///
/// Transport errors are always considered transient: the request may well
/// succeed if sent again, so the [`Recovery`] implementation classifies them
/// as retryable.
///
/// # Limited introspection
///
/// Other than implementing the [`std::error::Error`] and [`core::fmt::Debug`]
/// traits, this error type currently provides no introspection capabilities.
#[derive(Debug)]
pub struct TransportError(ErrorKind);

#[derive(Debug)]
enum ErrorKind {
    Message(Cow<'static, str>),
    Source(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl TransportError {
    /// Creates a transport error from a message.
    #[must_use]
    pub fn message(message: impl Into<Cow<'static, str>>) -> Self {
        Self(ErrorKind::Message(message.into()))
    }

    /// Creates a transport error wrapping an underlying error.
    #[must_use]
    pub fn caused_by(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self(ErrorKind::Source(Box::new(error)))
    }
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.0 {
            ErrorKind::Message(message) => write!(f, "{message}"),
            ErrorKind::Source(error) => error.fmt(f),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.0 {
            ErrorKind::Message(_) => None,
            ErrorKind::Source(error) => Some(error.as_ref()),
        }
    }
}

impl Recovery for TransportError {
    fn recovery(&self) -> RecoveryInfo {
        RecoveryInfo::retry()
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::error::Error as StdError;

    use recoverable::RecoveryKind;
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(TransportError: Send, Sync, std::error::Error);

    #[test]
    fn message_error() {
        let error = TransportError::message("connection reset");

        assert_eq!(error.to_string(), "connection reset");
        assert!(error.source().is_none());
    }

    #[test]
    fn wrapped_error() {
        let error = TransportError::caused_by(std::io::Error::other("dummy"));

        assert_eq!(error.to_string(), "dummy");
        assert_eq!(error.source().unwrap().to_string(), "dummy");
    }

    #[test]
    fn always_classified_as_retryable() {
        let error = TransportError::message("timed out");

        assert_eq!(error.recovery().kind(), RecoveryKind::Retry);
        assert_eq!(error.recovery().get_delay(), None);
    }
}
