// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire contracts for the feed endpoints.
//!
//! These types mirror the JSON bodies exchanged with the service and stay
//! private to the crate; the public surface exposes only the domain model.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::commands::{
    AccountCloseCommand, AgeOutCommand, CheckpointArgs, CommandCore, DeleteCommand, ExportCommand, LeaseReceipt,
    PrivacyCommand, TimeRangePredicate,
};
use crate::stats::QueueStats;

/// One leased command as it appears on the wire.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CommandEnvelope {
    pub command_id: String,
    pub lease_receipt: String,
    #[serde(default)]
    pub correlation_vector: String,
    #[serde(default)]
    pub verifier: String,
    /// Unix seconds.
    pub approximate_lease_expiration: i64,
    #[serde(default)]
    pub agent_state: Option<String>,
    #[serde(default)]
    pub asset_group_qualifier: Option<String>,
    #[serde(flatten)]
    pub operation: CommandOperation,
}

/// The kind-specific payload, discriminated by the `commandType` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "commandType")]
pub(crate) enum CommandOperation {
    Delete {
        #[serde(default, rename = "dataType")]
        data_type: String,
        #[serde(default, rename = "timeRangePredicate")]
        time_range_predicate: Option<TimeRangeEnvelope>,
    },
    Export {
        #[serde(default, rename = "dataTypes")]
        data_types: Vec<String>,
        #[serde(default, rename = "azureBlobContainerTargetUri")]
        azure_blob_container_target_uri: Option<String>,
    },
    AccountClose,
    AgeOut {
        /// Unix seconds.
        #[serde(default, rename = "lastActive")]
        last_active: Option<i64>,
    },
}

/// A time window on the wire, in unix seconds.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TimeRangeEnvelope {
    pub start_time: i64,
    pub end_time: i64,
}

impl CommandEnvelope {
    /// Converts the envelope into the domain model. The verifier is carried
    /// over untouched; validation and stripping happen in the client.
    pub(crate) fn into_command(self) -> PrivacyCommand {
        let core = CommandCore::new(
            self.command_id,
            LeaseReceipt::new(self.lease_receipt),
            unix_seconds_to_system_time(self.approximate_lease_expiration),
        )
        .correlation_vector(self.correlation_vector)
        .verifier(self.verifier)
        .agent_state(self.agent_state)
        .asset_group_qualifier(self.asset_group_qualifier);

        match self.operation {
            CommandOperation::Delete {
                data_type,
                time_range_predicate,
            } => PrivacyCommand::Delete(DeleteCommand {
                core,
                data_type,
                time_range_predicate: time_range_predicate.map(|range| TimeRangePredicate {
                    start_time: unix_seconds_to_system_time(range.start_time),
                    end_time: unix_seconds_to_system_time(range.end_time),
                }),
            }),
            CommandOperation::Export {
                data_types,
                azure_blob_container_target_uri,
            } => PrivacyCommand::Export(ExportCommand {
                core,
                data_types,
                azure_blob_container_target_uri,
            }),
            CommandOperation::AccountClose => PrivacyCommand::AccountClose(AccountCloseCommand { core }),
            CommandOperation::AgeOut { last_active } => PrivacyCommand::AgeOut(AgeOutCommand {
                core,
                last_active: last_active.map(unix_seconds_to_system_time),
            }),
        }
    }
}

/// Timestamps before the epoch are clamped to it; the feed never produces
/// them.
fn unix_seconds_to_system_time(seconds: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(u64::try_from(seconds).unwrap_or(0))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CheckpointRequestBody {
    pub command_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_state: Option<String>,
    pub status: String,
    pub row_count: u32,
    pub lease_receipt: String,
    pub lease_extension_seconds: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub variants: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub non_transient_failures: Vec<String>,
}

impl From<&CheckpointArgs> for CheckpointRequestBody {
    fn from(args: &CheckpointArgs) -> Self {
        Self {
            command_id: args.command_id.clone(),
            agent_state: args.agent_state.clone(),
            status: args.status.to_string(),
            row_count: args.affected_row_count,
            lease_receipt: args.lease_receipt.as_str().to_owned(),
            lease_extension_seconds: args.lease_extension.map_or(0, |extension| extension.as_secs()),
            variants: args.variant_ids.clone(),
            non_transient_failures: args.non_transient_failures.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CheckpointResponseBody {
    pub lease_receipt: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QueueStatsRequestBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_group_qualifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QueueStatsResponseBody {
    #[serde(default)]
    pub queue_stats: Vec<QueueStats>,
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "no need to be strict in tests")]

    use pretty_assertions::assert_eq;

    use crate::commands::CommandKind;

    use super::*;

    #[test]
    fn delete_envelope_round_trips_into_domain() {
        let json = r#"{
            "commandId": "command-1",
            "leaseReceipt": "receipt-1",
            "correlationVector": "cv.0",
            "verifier": "token",
            "approximateLeaseExpiration": 1700000000,
            "agentState": "opaque",
            "assetGroupQualifier": "AssetType=AzureTable",
            "commandType": "Delete",
            "dataType": "BrowsingHistory",
            "timeRangePredicate": { "startTime": 1600000000, "endTime": 1650000000 }
        }"#;

        let envelope: CommandEnvelope = serde_json::from_str(json).unwrap();
        let command = envelope.into_command();

        assert_eq!(command.kind(), CommandKind::Delete);
        assert_eq!(command.command_id(), "command-1");
        assert_eq!(command.correlation_vector(), "cv.0");
        assert_eq!(command.lease_receipt(), LeaseReceipt::new("receipt-1"));
        assert_eq!(
            command.approximate_lease_expiration(),
            UNIX_EPOCH + Duration::from_secs(1_700_000_000)
        );

        let PrivacyCommand::Delete(delete) = command else {
            panic!("expected a delete command");
        };
        assert_eq!(delete.data_type(), "BrowsingHistory");
        assert_eq!(
            delete.time_range_predicate().unwrap().start_time,
            UNIX_EPOCH + Duration::from_secs(1_600_000_000)
        );
    }

    #[test]
    fn batch_of_mixed_kinds_parses() {
        let json = r#"[
            { "commandId": "a", "leaseReceipt": "ra", "approximateLeaseExpiration": 1, "commandType": "Export",
              "dataTypes": ["BrowsingHistory"], "azureBlobContainerTargetUri": "https://example.test/container" },
            { "commandId": "b", "leaseReceipt": "rb", "approximateLeaseExpiration": 2, "commandType": "AccountClose" },
            { "commandId": "c", "leaseReceipt": "rc", "approximateLeaseExpiration": 3, "commandType": "AgeOut",
              "lastActive": 1234 }
        ]"#;

        let envelopes: Vec<CommandEnvelope> = serde_json::from_str(json).unwrap();
        let kinds: Vec<_> = envelopes
            .into_iter()
            .map(|envelope| envelope.into_command().kind())
            .collect();

        assert_eq!(kinds, vec![CommandKind::Export, CommandKind::AccountClose, CommandKind::AgeOut]);
    }

    #[test]
    fn checkpoint_body_serialization() {
        let args = CheckpointArgs {
            command_id: "command-1".into(),
            agent_state: None,
            status: crate::commands::CheckpointStatus::Complete,
            affected_row_count: 3,
            lease_receipt: LeaseReceipt::new("receipt-1"),
            lease_extension: Some(Duration::from_secs(900)),
            variant_ids: Vec::new(),
            non_transient_failures: Vec::new(),
        };

        let body = serde_json::to_value(CheckpointRequestBody::from(&args)).unwrap();

        assert_eq!(
            body,
            serde_json::json!({
                "commandId": "command-1",
                "status": "Complete",
                "rowCount": 3,
                "leaseReceipt": "receipt-1",
                "leaseExtensionSeconds": 900
            })
        );
    }

    #[test]
    fn pre_epoch_expirations_clamp() {
        assert_eq!(unix_seconds_to_system_time(-5), UNIX_EPOCH);
    }
}
