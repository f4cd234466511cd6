// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The seam between the receiver and whatever supplies its commands.

use tokio_util::sync::CancellationToken;

use crate::commands::{CheckpointArgs, LeaseReceipt, PrivacyCommand};
use crate::error::{CheckpointError, FetchError};

/// Supplies leased commands and accepts their acknowledgments.
///
/// [`CommandFeedClient`][crate::CommandFeedClient] is the production
/// implementation; tests substitute scripted sources. All returned futures
/// must be `Send` because checkpoints run inside spawned dispatch tasks.
pub trait CommandSource: Send + Sync {
    /// Fetches the next batch of pending commands.
    ///
    /// Every returned command has already passed verifier validation;
    /// commands that failed validation are acknowledged and filtered out
    /// internally, never surfaced. An empty batch is a normal outcome.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] when the batch could not be obtained. All
    /// fetch errors are transient from the caller's perspective.
    fn fetch_commands(
        &self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<PrivacyCommand>, FetchError>> + Send;

    /// Acknowledges the processing outcome of one command.
    ///
    /// Returns the new lease receipt, or `None` when the feed indicated no
    /// further action is required.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Conflict`] when the lease was already
    /// checkpointed or has expired elsewhere, and a transport variant
    /// otherwise.
    fn checkpoint(
        &self,
        args: CheckpointArgs,
    ) -> impl Future<Output = Result<Option<LeaseReceipt>, CheckpointError>> + Send;
}
