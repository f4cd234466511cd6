// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Client SDK for receiving and acknowledging privacy commands.
//!
//! # Why
//!
//! Data agents are obligated to act on privacy commands (delete, export,
//! account closed, age out) delivered through a central command feed. The
//! mechanics of doing that reliably are the same for every agent: poll the
//! feed, validate command authenticity, buffer work, process it under a
//! concurrency bound, acknowledge outcomes, and survive every transient
//! failure along the way. This crate implements those mechanics once, so an
//! agent only supplies the processing logic.
//!
//! # Core Types
//!
//! - [`CommandReceiver`]: the top-level entry point. Runs the receive loops
//!   until cancelled and dispatches each command to the agent.
//! - [`PrivacyDataAgent`]: the trait an embedding application implements,
//!   one method per command kind.
//! - [`CommandFeedClient`]: the HTTP client for the feed endpoints; fetches,
//!   validates, and acknowledges commands. Implements [`CommandSource`].
//! - [`PrivacyCommand`]: the closed set of command kinds, each carrying its
//!   lease and a route for checkpointing itself.
//!
//! # Delivery contract
//!
//! Commands are delivered at least once under time-bounded leases. The
//! receiver dispatches commands in fetch order, skips commands whose lease
//! has already expired, and guarantees that once a command has been buffered
//! it is dispatched to the agent even when shutdown has begun. If an agent
//! callback fails without having checkpointed, the receiver acknowledges the
//! failure on its behalf so the command becomes eligible for redelivery.
//!
//! # Examples
//!
//! ```rust,ignore
//! use command_feed::{CommandFeedClient, CommandReceiver};
//! use tokio_util::sync::CancellationToken;
//!
//! let client = CommandFeedClient::builder(agent_id, host, transport, clock.clone()).build()?;
//! let receiver = CommandReceiver::new(my_agent, client, clock);
//!
//! let cancel = CancellationToken::new();
//! receiver.begin_receiving(cancel.clone()).await;
//! ```

mod agent;
mod client;
mod commands;
mod contracts;
mod error;
mod events;
mod queue;
mod receiver;
mod source;
mod stats;
mod validation;

pub use agent::PrivacyDataAgent;
pub use client::{CommandFeedClient, CommandFeedClientBuilder, FeedEndpoints};
pub use commands::{
    AccountCloseCommand, AgeOutCommand, CheckpointArgs, CheckpointOptions, CheckpointStatus, CommandKind,
    DeleteCommand, ExportCommand, LeaseReceipt, LeaseReceiptCell, PrivacyCommand, TimeRangePredicate,
};
pub use error::{CheckpointError, EndpointError, FetchError, InvalidConcurrencyLimit};
pub use events::{FeedEvents, TracingFeedEvents};
pub use receiver::CommandReceiver;
pub use source::CommandSource;
pub use stats::QueueStats;
pub use validation::{CommandClaims, CommandValidator, ValidateNothing, ValidationError, ValidationFailureKind};
