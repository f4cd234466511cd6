// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Observability callbacks for the client and receiver.
//!
//! Failures inside the receive loops never surface as errors to the caller;
//! they are reported through this seam instead. The default implementation
//! forwards everything to `tracing`, so embedding applications get useful
//! telemetry without writing any glue. Implement the trait to route events
//! into a different telemetry system; every method has a default body, so
//! implementations override only what they care about.

use http::{Method, StatusCode, Uri};

use crate::validation::ValidationError;

/// Receives notable events from the client and receiver.
pub trait FeedEvents: Send + Sync {
    /// An error was caught and contained instead of propagating.
    fn unhandled_error(&self, error: &(dyn std::error::Error + 'static)) {
        tracing::event!(
            name: "command_feed.unhandled_error",
            tracing::Level::WARN,
            error = %error,
        );
    }

    /// The receive loop observed a cancellation request and is shutting
    /// down. Reported distinctly from unhandled errors because cancellation
    /// is a normal exit, not a failure.
    fn cancelled(&self) {
        tracing::event!(
            name: "command_feed.cancelled",
            tracing::Level::INFO,
            {}
        );
    }

    /// An HTTP exchange with the feed completed.
    fn response_received(&self, method: &Method, uri: &Uri, status: StatusCode) {
        tracing::event!(
            name: "command_feed.response",
            tracing::Level::DEBUG,
            http.method = %method,
            http.uri = %uri,
            http.status = status.as_u16(),
        );
    }

    /// A fetched command failed verifier validation and was dropped from the
    /// batch.
    fn validation_failure(&self, correlation_vector: &str, command_id: &str, error: &ValidationError) {
        tracing::event!(
            name: "command_feed.validation_failure",
            tracing::Level::WARN,
            correlation_vector,
            command_id,
            error = %error,
        );
    }

    /// A checkpoint was refused because the lease was already checkpointed
    /// or has expired elsewhere.
    fn checkpoint_conflict(&self, command_id: &str) {
        tracing::event!(
            name: "command_feed.checkpoint_conflict",
            tracing::Level::WARN,
            command_id,
        );
    }
}

/// The default [`FeedEvents`] implementation: every event goes to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingFeedEvents;

impl FeedEvents for TracingFeedEvents {}
