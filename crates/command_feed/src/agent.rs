// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The seam between the receiver and the embedding application.

use crate::commands::{AccountCloseCommand, AgeOutCommand, DeleteCommand, ExportCommand};

/// Processes privacy commands on behalf of the embedding application.
///
/// The receiver calls exactly one method per dispatched command, chosen by
/// the command's kind. Implementations are expected to perform the work and
/// optionally acknowledge it themselves through
/// [`checkpoint`][DeleteCommand::checkpoint]; if a method returns an error
/// without having checkpointed, the receiver files a `Failed` checkpoint on
/// the implementation's behalf.
///
/// Methods run concurrently up to the receiver's concurrency limit, each on
/// its own task, so a slow implementation cannot stall other commands. The
/// returned futures must be `Send` for the same reason.
pub trait PrivacyDataAgent: Send + Sync + 'static {
    /// The error type produced when processing fails.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Processes a request to delete the subject's data.
    fn process_delete(&self, command: DeleteCommand) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Processes a request to export the subject's data.
    fn process_export(&self, command: ExportCommand) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Processes a notification that the subject's account was closed.
    fn process_account_closed(
        &self,
        command: AccountCloseCommand,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Processes a notification that the subject's account aged out.
    fn process_age_out(&self, command: AgeOutCommand) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
