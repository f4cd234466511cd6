// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The command data model.
//!
//! A command is an opaque unit of privacy work leased to this agent by the
//! remote feed. The lease is proven by a [`LeaseReceipt`]; every successful
//! checkpoint replaces the receipt, and the current receipt is the only valid
//! proof of ownership. Receipts live in a shared [`LeaseReceiptCell`] so that
//! the receiver can observe checkpoints performed by the agent while the
//! agent owns the command value.

use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use resend::TransportError;
use serde::{Deserialize, Serialize};

use crate::error::CheckpointError;

/// An opaque token proving ownership of a command's current lease.
///
/// The receipt changes identity each time a checkpoint succeeds; holding a
/// stale receipt means another checkpoint has happened since it was read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseReceipt(String);

impl LeaseReceipt {
    /// Creates a receipt from its wire representation.
    #[must_use]
    pub fn new(receipt: impl Into<String>) -> Self {
        Self(receipt.into())
    }

    /// Returns the wire representation of the receipt.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for LeaseReceipt {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// A shared, mutable slot holding a command's current lease receipt.
///
/// The cell is shared between the command value handed to the agent and the
/// receiver's bookkeeping for that command: when either party checkpoints
/// successfully, the new receipt becomes visible to both.
#[derive(Debug, Clone)]
pub struct LeaseReceiptCell(Arc<Mutex<LeaseReceipt>>);

impl LeaseReceiptCell {
    /// Creates a cell holding the given receipt.
    #[must_use]
    pub fn new(receipt: LeaseReceipt) -> Self {
        Self(Arc::new(Mutex::new(receipt)))
    }

    /// Returns a copy of the current receipt.
    #[must_use]
    pub fn current(&self) -> LeaseReceipt {
        self.0.lock().clone()
    }

    /// Replaces the current receipt.
    pub fn store(&self, receipt: LeaseReceipt) {
        *self.0.lock() = receipt;
    }
}

/// The processing outcome reported by a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CheckpointStatus {
    /// Processing finished; the command can be retired.
    Complete,

    /// Processing failed; the command becomes eligible for redelivery once
    /// its lease lapses.
    Failed,

    /// The command's authenticity token was rejected.
    VerificationFailed,

    /// Validating the authenticity token failed for reasons unrelated to the
    /// token itself.
    UnexpectedVerificationFailure,
}

impl Display for CheckpointStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Complete => "Complete",
            Self::Failed => "Failed",
            Self::VerificationFailed => "VerificationFailed",
            Self::UnexpectedVerificationFailure => "UnexpectedVerificationFailure",
        };

        write!(f, "{name}")
    }
}

/// The kind of work a command requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Delete the subject's data.
    Delete,

    /// Export the subject's data.
    Export,

    /// The subject's account was closed.
    AccountClose,

    /// The subject's account aged out of activity.
    AgeOut,
}

impl CommandKind {
    /// Returns the wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Delete => "Delete",
            Self::Export => "Export",
            Self::AccountClose => "AccountClose",
            Self::AgeOut => "AgeOut",
        }
    }
}

impl Display for CommandKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The full argument set of a checkpoint call.
#[derive(Debug, Clone)]
pub struct CheckpointArgs {
    /// The command being acknowledged.
    pub command_id: String,

    /// Opaque agent-defined state stored alongside the command.
    pub agent_state: Option<String>,

    /// The processing outcome.
    pub status: CheckpointStatus,

    /// The number of rows or records affected by processing.
    pub affected_row_count: u32,

    /// Proof of the current lease.
    pub lease_receipt: LeaseReceipt,

    /// An optional extension of the lease.
    pub lease_extension: Option<Duration>,

    /// Variants claimed as applicable to this command.
    pub variant_ids: Vec<String>,

    /// Reasons the command failed in a way a retry will not fix.
    pub non_transient_failures: Vec<String>,
}

/// Optional checkpoint parameters beyond status and row count.
#[derive(Debug, Clone, Default)]
pub struct CheckpointOptions {
    /// An optional extension of the lease.
    pub lease_extension: Option<Duration>,

    /// Variants claimed as applicable to this command.
    pub variant_ids: Vec<String>,

    /// Reasons the command failed in a way a retry will not fix.
    pub non_transient_failures: Vec<String>,
}

/// The installed route from a command back to the feed's checkpoint
/// endpoint. Storing the new receipt into the command's cell is the
/// callback's responsibility.
pub(crate) type CheckpointCallback =
    Arc<dyn Fn(CheckpointArgs) -> BoxFuture<'static, Result<Option<LeaseReceipt>, CheckpointError>> + Send + Sync>;

/// State shared by every command variant.
#[derive(Clone)]
pub struct CommandCore {
    command_id: String,
    correlation_vector: String,
    verifier: String,
    lease: LeaseReceiptCell,
    approximate_lease_expiration: SystemTime,
    agent_state: Option<String>,
    asset_group_qualifier: Option<String>,
    checkpoint: Option<CheckpointCallback>,
}

impl CommandCore {
    /// Creates a command core with the mandatory identity fields.
    #[must_use]
    pub(crate) fn new(
        command_id: impl Into<String>,
        lease_receipt: LeaseReceipt,
        approximate_lease_expiration: SystemTime,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            correlation_vector: String::new(),
            verifier: String::new(),
            lease: LeaseReceiptCell::new(lease_receipt),
            approximate_lease_expiration,
            agent_state: None,
            asset_group_qualifier: None,
            checkpoint: None,
        }
    }

    pub(crate) fn correlation_vector(mut self, correlation_vector: impl Into<String>) -> Self {
        self.correlation_vector = correlation_vector.into();
        self
    }

    pub(crate) fn verifier(mut self, verifier: impl Into<String>) -> Self {
        self.verifier = verifier.into();
        self
    }

    pub(crate) fn agent_state(mut self, agent_state: Option<String>) -> Self {
        self.agent_state = agent_state;
        self
    }

    pub(crate) fn asset_group_qualifier(mut self, asset_group_qualifier: Option<String>) -> Self {
        self.asset_group_qualifier = asset_group_qualifier;
        self
    }

    pub(crate) fn current_verifier(&self) -> &str {
        &self.verifier
    }

    /// Erases the authenticity token once it has served its purpose, so
    /// agents cannot accidentally persist it.
    pub(crate) fn clear_verifier(&mut self) {
        self.verifier.clear();
    }

    pub(crate) fn install_checkpoint(&mut self, callback: CheckpointCallback) {
        self.checkpoint = Some(callback);
    }

    pub(crate) fn lease_cell(&self) -> LeaseReceiptCell {
        self.lease.clone()
    }

    pub(crate) fn checkpoint_handle(&self) -> CheckpointHandle {
        CheckpointHandle {
            callback: self.checkpoint.clone(),
            cell: self.lease.clone(),
            command_id: self.command_id.clone(),
            agent_state: self.agent_state.clone(),
        }
    }

    async fn checkpoint(
        &self,
        status: CheckpointStatus,
        affected_row_count: u32,
        options: CheckpointOptions,
    ) -> Result<(), CheckpointError> {
        let Some(callback) = &self.checkpoint else {
            return Err(CheckpointError::Transport(TransportError::message(
                "no checkpoint route is installed on this command",
            )));
        };

        let args = CheckpointArgs {
            command_id: self.command_id.clone(),
            agent_state: self.agent_state.clone(),
            status,
            affected_row_count,
            lease_receipt: self.lease.current(),
            lease_extension: options.lease_extension,
            variant_ids: options.variant_ids,
            non_transient_failures: options.non_transient_failures,
        };

        let _receipt = callback(args).await?;
        Ok(())
    }
}

impl Debug for CommandCore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandCore")
            .field("command_id", &self.command_id)
            .field("correlation_vector", &self.correlation_vector)
            .field("approximate_lease_expiration", &self.approximate_lease_expiration)
            .field("asset_group_qualifier", &self.asset_group_qualifier)
            .finish_non_exhaustive()
    }
}

/// The receiver's retained view of a dispatched command: enough to observe
/// agent-driven checkpoints and to file a failure checkpoint on the agent's
/// behalf after the command value itself has been handed over.
pub(crate) struct CheckpointHandle {
    callback: Option<CheckpointCallback>,
    cell: LeaseReceiptCell,
    command_id: String,
    agent_state: Option<String>,
}

impl CheckpointHandle {
    pub(crate) fn current_receipt(&self) -> LeaseReceipt {
        self.cell.current()
    }

    /// Files a `Failed` checkpoint with a zero row count.
    pub(crate) async fn checkpoint_failed(&self) -> Result<(), CheckpointError> {
        let Some(callback) = &self.callback else {
            return Err(CheckpointError::Transport(TransportError::message(
                "no checkpoint route is installed on this command",
            )));
        };

        let args = CheckpointArgs {
            command_id: self.command_id.clone(),
            agent_state: self.agent_state.clone(),
            status: CheckpointStatus::Failed,
            affected_row_count: 0,
            lease_receipt: self.cell.current(),
            lease_extension: None,
            variant_ids: Vec::new(),
            non_transient_failures: Vec::new(),
        };

        let _receipt = callback(args).await?;
        Ok(())
    }
}

/// An inclusive time window limiting the data a delete command applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRangePredicate {
    /// The start of the window.
    pub start_time: SystemTime,

    /// The end of the window.
    pub end_time: SystemTime,
}

macro_rules! command_accessors {
    ($command:ty) => {
        impl $command {
            /// Returns the command's identity.
            #[must_use]
            pub fn command_id(&self) -> &str {
                &self.core.command_id
            }

            /// Returns the tracing identifier associated with the command.
            #[must_use]
            pub fn correlation_vector(&self) -> &str {
                &self.core.correlation_vector
            }

            /// Returns the agent-defined state stored alongside the command.
            #[must_use]
            pub fn agent_state(&self) -> Option<&str> {
                self.core.agent_state.as_deref()
            }

            /// Returns the asset group qualifier the command targets.
            #[must_use]
            pub fn asset_group_qualifier(&self) -> Option<&str> {
                self.core.asset_group_qualifier.as_deref()
            }

            /// Returns the instant after which the lease is assumed invalid.
            ///
            /// The expiration is approximate and checked client-side; work
            /// must not start once it has passed.
            #[must_use]
            pub fn approximate_lease_expiration(&self) -> std::time::SystemTime {
                self.core.approximate_lease_expiration
            }

            /// Returns a copy of the current lease receipt.
            #[must_use]
            pub fn lease_receipt(&self) -> LeaseReceipt {
                self.core.lease.current()
            }

            /// Reports the processing outcome for this command and renews the
            /// lease.
            ///
            /// # Errors
            ///
            /// Returns [`CheckpointError::Conflict`] when the lease was
            /// already checkpointed or has expired elsewhere, and a transport
            /// variant for any other failure.
            pub async fn checkpoint(
                &self,
                status: CheckpointStatus,
                affected_row_count: u32,
            ) -> Result<(), CheckpointError> {
                self.core
                    .checkpoint(status, affected_row_count, CheckpointOptions::default())
                    .await
            }

            /// Reports the processing outcome with extended parameters.
            ///
            /// # Errors
            ///
            /// Returns [`CheckpointError::Conflict`] when the lease was
            /// already checkpointed or has expired elsewhere, and a transport
            /// variant for any other failure.
            pub async fn checkpoint_with(
                &self,
                status: CheckpointStatus,
                affected_row_count: u32,
                options: CheckpointOptions,
            ) -> Result<(), CheckpointError> {
                self.core.checkpoint(status, affected_row_count, options).await
            }
        }
    };
}

/// A request to delete the subject's data.
#[derive(Debug, Clone)]
pub struct DeleteCommand {
    pub(crate) core: CommandCore,
    pub(crate) data_type: String,
    pub(crate) time_range_predicate: Option<TimeRangePredicate>,
}

impl DeleteCommand {
    /// Returns the privacy data type the deletion applies to.
    #[must_use]
    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    /// Returns the time window the deletion applies to, if one was given.
    #[must_use]
    pub fn time_range_predicate(&self) -> Option<TimeRangePredicate> {
        self.time_range_predicate
    }
}

command_accessors!(DeleteCommand);

/// A request to export the subject's data.
#[derive(Debug, Clone)]
pub struct ExportCommand {
    pub(crate) core: CommandCore,
    pub(crate) data_types: Vec<String>,
    pub(crate) azure_blob_container_target_uri: Option<String>,
}

impl ExportCommand {
    /// Returns the privacy data types the export applies to.
    #[must_use]
    pub fn data_types(&self) -> &[String] {
        &self.data_types
    }

    /// Returns the destination container for the exported data.
    #[must_use]
    pub fn azure_blob_container_target_uri(&self) -> Option<&str> {
        self.azure_blob_container_target_uri.as_deref()
    }
}

command_accessors!(ExportCommand);

/// A notification that the subject's account was closed.
#[derive(Debug, Clone)]
pub struct AccountCloseCommand {
    pub(crate) core: CommandCore,
}

command_accessors!(AccountCloseCommand);

/// A notification that the subject's account aged out of activity.
#[derive(Debug, Clone)]
pub struct AgeOutCommand {
    pub(crate) core: CommandCore,
    pub(crate) last_active: Option<SystemTime>,
}

impl AgeOutCommand {
    /// Returns when the account was last active, if known.
    #[must_use]
    pub fn last_active(&self) -> Option<SystemTime> {
        self.last_active
    }
}

command_accessors!(AgeOutCommand);

/// A privacy command leased to this agent.
///
/// The set of command kinds is closed; dispatch over a command is an
/// exhaustive match, checked at compile time.
#[derive(Debug, Clone)]
pub enum PrivacyCommand {
    /// Delete the subject's data.
    Delete(DeleteCommand),

    /// Export the subject's data.
    Export(ExportCommand),

    /// The subject's account was closed.
    AccountClose(AccountCloseCommand),

    /// The subject's account aged out of activity.
    AgeOut(AgeOutCommand),
}

impl PrivacyCommand {
    pub(crate) fn core(&self) -> &CommandCore {
        match self {
            Self::Delete(command) => &command.core,
            Self::Export(command) => &command.core,
            Self::AccountClose(command) => &command.core,
            Self::AgeOut(command) => &command.core,
        }
    }

    pub(crate) fn core_mut(&mut self) -> &mut CommandCore {
        match self {
            Self::Delete(command) => &mut command.core,
            Self::Export(command) => &mut command.core,
            Self::AccountClose(command) => &mut command.core,
            Self::AgeOut(command) => &mut command.core,
        }
    }

    /// Returns the kind of work the command requests.
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Delete(_) => CommandKind::Delete,
            Self::Export(_) => CommandKind::Export,
            Self::AccountClose(_) => CommandKind::AccountClose,
            Self::AgeOut(_) => CommandKind::AgeOut,
        }
    }

    /// Returns the command's identity.
    #[must_use]
    pub fn command_id(&self) -> &str {
        &self.core().command_id
    }

    /// Returns the tracing identifier associated with the command.
    #[must_use]
    pub fn correlation_vector(&self) -> &str {
        &self.core().correlation_vector
    }

    /// Returns the instant after which the lease is assumed invalid.
    #[must_use]
    pub fn approximate_lease_expiration(&self) -> SystemTime {
        self.core().approximate_lease_expiration
    }

    /// Returns a copy of the current lease receipt.
    #[must_use]
    pub fn lease_receipt(&self) -> LeaseReceipt {
        self.core().lease.current()
    }

    /// Returns the agent-defined state stored alongside the command.
    #[must_use]
    pub fn agent_state(&self) -> Option<&str> {
        self.core().agent_state.as_deref()
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "no need to be strict in tests")]

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::UNIX_EPOCH;

    use futures::FutureExt;
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(PrivacyCommand: Debug, Clone, Send, Sync);
    assert_impl_all!(LeaseReceipt: Debug, Clone, PartialEq, Send, Sync);
    assert_impl_all!(CheckpointStatus: Debug, Copy, Send, Sync);

    fn delete_command() -> DeleteCommand {
        DeleteCommand {
            core: CommandCore::new("command-1", LeaseReceipt::new("receipt-1"), UNIX_EPOCH + Duration::from_secs(600))
                .correlation_vector("cv-1")
                .agent_state(Some("state".into())),
            data_type: "BrowsingHistory".into(),
            time_range_predicate: None,
        }
    }

    #[test]
    fn lease_receipt_cell_shares_updates() {
        let cell = LeaseReceiptCell::new(LeaseReceipt::new("first"));
        let observer = cell.clone();

        cell.store(LeaseReceipt::new("second"));

        assert_eq!(observer.current(), LeaseReceipt::new("second"));
    }

    #[test]
    fn checkpoint_status_wire_names() {
        assert_eq!(CheckpointStatus::Complete.to_string(), "Complete");
        assert_eq!(CheckpointStatus::Failed.to_string(), "Failed");
        assert_eq!(CheckpointStatus::VerificationFailed.to_string(), "VerificationFailed");
        assert_eq!(
            CheckpointStatus::UnexpectedVerificationFailure.to_string(),
            "UnexpectedVerificationFailure"
        );
    }

    #[test]
    fn command_kind_wire_names() {
        assert_eq!(CommandKind::Delete.to_string(), "Delete");
        assert_eq!(CommandKind::AgeOut.to_string(), "AgeOut");
    }

    #[tokio::test]
    async fn checkpoint_without_route_is_an_error() {
        let command = delete_command();

        let error = command.checkpoint(CheckpointStatus::Complete, 1).await.unwrap_err();

        assert!(matches!(error, CheckpointError::Transport(_)));
    }

    #[tokio::test]
    async fn checkpoint_routes_args_through_callback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(None));

        let mut command = delete_command();
        let callback: CheckpointCallback = {
            let calls = Arc::clone(&calls);
            let seen = Arc::clone(&seen);
            Arc::new(move |args| {
                let _ = calls.fetch_add(1, Ordering::SeqCst);
                *seen.lock() = Some(args);
                async { Ok(Some(LeaseReceipt::new("renewed"))) }.boxed()
            })
        };
        command.core.install_checkpoint(callback);

        command.checkpoint(CheckpointStatus::Complete, 7).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let args = seen.lock().take().unwrap();
        assert_eq!(args.command_id, "command-1");
        assert_eq!(args.agent_state.as_deref(), Some("state"));
        assert_eq!(args.status, CheckpointStatus::Complete);
        assert_eq!(args.affected_row_count, 7);
        assert_eq!(args.lease_receipt, LeaseReceipt::new("receipt-1"));
    }

    #[tokio::test]
    async fn checkpoint_handle_files_failed_checkpoint() {
        let seen = Arc::new(Mutex::new(None));

        let mut command = delete_command();
        let callback: CheckpointCallback = {
            let seen = Arc::clone(&seen);
            Arc::new(move |args| {
                *seen.lock() = Some(args);
                async { Ok(None) }.boxed()
            })
        };
        command.core.install_checkpoint(callback);

        let handle = command.core.checkpoint_handle();
        handle.checkpoint_failed().await.unwrap();

        let args = seen.lock().take().unwrap();
        assert_eq!(args.status, CheckpointStatus::Failed);
        assert_eq!(args.affected_row_count, 0);
    }

    #[test]
    fn verifier_is_clearable() {
        let mut core = CommandCore::new("c", LeaseReceipt::new("r"), UNIX_EPOCH).verifier("token");
        assert_eq!(core.current_verifier(), "token");

        core.clear_verifier();
        assert_eq!(core.current_verifier(), "");
    }

    #[test]
    fn debug_omits_sensitive_fields() {
        let core = CommandCore::new("c", LeaseReceipt::new("r"), UNIX_EPOCH).verifier("secret-token");
        let rendered = format!("{core:?}");

        assert!(rendered.contains("command_id"));
        assert!(!rendered.contains("secret-token"));
    }
}
