// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The HTTP client for the command feed endpoints.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method, Request, StatusCode, Uri};
use resend::{SendRequest, TransportError};
use tick::Clock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::commands::{
    CheckpointArgs, CheckpointCallback, CheckpointStatus, CommandKind, LeaseReceipt, PrivacyCommand,
};
use crate::contracts::{
    CheckpointRequestBody, CheckpointResponseBody, CommandEnvelope, QueueStatsRequestBody, QueueStatsResponseBody,
};
use crate::error::{CheckpointError, EndpointError, FetchError};
use crate::events::{FeedEvents, TracingFeedEvents};
use crate::source::CommandSource;
use crate::stats::{QueueStats, StatsCache, stats_cache_key};
use crate::validation::{CommandClaims, CommandValidator, ValidateNothing, ValidationFailureKind};

/// Sent on every request so the service can tell client builds apart.
const CLIENT_VERSION: &str = concat!("command-feed-rs;", env!("CARGO_PKG_VERSION"));

/// The command kinds this client is willing to receive.
const SUPPORTED_COMMANDS: HeaderValue = HeaderValue::from_static("AccountClose,Delete,Export,AgeOut");

/// The resolved endpoint URIs of one feed instance.
#[derive(Debug, Clone)]
pub struct FeedEndpoints {
    commands: Uri,
    checkpoint: Uri,
    queue_stats: Uri,
}

impl FeedEndpoints {
    /// Derives the endpoint URIs for an agent from the feed's host name.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError`] when the host name does not form valid
    /// URIs.
    pub fn new(host: &str, agent_id: Uuid) -> Result<Self, EndpointError> {
        Ok(Self {
            commands: format!("https://{host}/pcf/v1/{agent_id}/commands").parse()?,
            checkpoint: format!("https://{host}/pcf/v1/{agent_id}/checkpoint").parse()?,
            queue_stats: format!("https://{host}/pcf/v1/{agent_id}/queuestats").parse()?,
        })
    }

    /// Returns the URI commands are fetched from.
    #[must_use]
    pub const fn commands(&self) -> &Uri {
        &self.commands
    }

    /// Returns the URI checkpoints are posted to.
    #[must_use]
    pub const fn checkpoint(&self) -> &Uri {
        &self.checkpoint
    }

    /// Returns the URI queue statistics are requested from.
    #[must_use]
    pub const fn queue_stats(&self) -> &Uri {
        &self.queue_stats
    }
}

struct ClientInner<S, V> {
    transport: S,
    validator: V,
    endpoints: FeedEndpoints,
    requested_lease_duration: Option<Duration>,
    clock: Clock,
    events: Arc<dyn FeedEvents>,
    stats_cache: StatsCache,
}

/// A client for fetching, validating, and acknowledging privacy commands.
///
/// The client is cheap to clone; clones share the transport, validator, and
/// the queue-statistics cache. Wrap the transport in
/// [`resend::Resend`] to give every exchange retry behavior:
///
/// ```rust
/// use command_feed::CommandFeedClient;
/// use resend::Resend;
/// use tick::Clock;
/// use uuid::Uuid;
///
/// # fn example(transport: impl resend::SendRequest + 'static, clock: Clock) -> Result<(), command_feed::EndpointError> {
/// let client = CommandFeedClient::builder(
///     Uuid::nil(),
///     "feed.example.test",
///     Resend::new(transport, clock.clone()),
///     clock,
/// )
/// .build()?;
/// # Ok(())
/// # }
/// ```
///
/// Authentication is the transport's concern: implementations of
/// [`SendRequest`] attach whatever credentials their environment requires.
pub struct CommandFeedClient<S, V = ValidateNothing> {
    inner: Arc<ClientInner<S, V>>,
}

impl<S, V> Clone for CommandFeedClient<S, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, V> Debug for CommandFeedClient<S, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandFeedClient")
            .field("endpoints", &self.inner.endpoints)
            .finish_non_exhaustive()
    }
}

impl<S: SendRequest + 'static> CommandFeedClient<S> {
    /// Starts building a client for the given agent and feed host.
    pub fn builder(agent_id: Uuid, host: impl Into<String>, transport: S, clock: Clock) -> CommandFeedClientBuilder<S> {
        CommandFeedClientBuilder {
            agent_id,
            host: host.into(),
            transport,
            validator: ValidateNothing,
            clock,
            requested_lease_duration: None,
            events: Arc::new(TracingFeedEvents),
        }
    }
}

/// Configures and constructs a [`CommandFeedClient`].
///
/// Obtained from [`CommandFeedClient::builder`].
pub struct CommandFeedClientBuilder<S, V = ValidateNothing> {
    agent_id: Uuid,
    host: String,
    transport: S,
    validator: V,
    clock: Clock,
    requested_lease_duration: Option<Duration>,
    events: Arc<dyn FeedEvents>,
}

impl<S, V> Debug for CommandFeedClientBuilder<S, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandFeedClientBuilder")
            .field("agent_id", &self.agent_id)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl<S, V> CommandFeedClientBuilder<S, V> {
    /// Replaces the verifier validator.
    ///
    /// Production agents must supply a real validator; the default accepts
    /// every token.
    pub fn validator<V2: CommandValidator>(self, validator: V2) -> CommandFeedClientBuilder<S, V2> {
        CommandFeedClientBuilder {
            agent_id: self.agent_id,
            host: self.host,
            transport: self.transport,
            validator,
            clock: self.clock,
            requested_lease_duration: self.requested_lease_duration,
            events: self.events,
        }
    }

    /// Requests that leases be acquired for the given duration.
    ///
    /// Forwarded to the feed as a hint on every fetch; pick a value between
    /// fifteen minutes and a day.
    #[must_use]
    pub fn requested_lease_duration(mut self, duration: Duration) -> Self {
        self.requested_lease_duration = Some(duration);
        self
    }

    /// Replaces the events sink.
    #[must_use]
    pub fn events(mut self, events: impl FeedEvents + 'static) -> Self {
        self.events = Arc::new(events);
        self
    }

    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError`] when the host name does not form valid
    /// endpoint URIs.
    pub fn build(self) -> Result<CommandFeedClient<S, V>, EndpointError> {
        Ok(CommandFeedClient {
            inner: Arc::new(ClientInner {
                transport: self.transport,
                validator: self.validator,
                endpoints: FeedEndpoints::new(&self.host, self.agent_id)?,
                requested_lease_duration: self.requested_lease_duration,
                clock: self.clock,
                events: self.events,
                stats_cache: StatsCache::default(),
            }),
        })
    }
}

impl<S, V> CommandFeedClient<S, V>
where
    S: SendRequest + 'static,
    V: CommandValidator + 'static,
{
    /// Returns the resolved endpoint URIs.
    #[must_use]
    pub fn endpoints(&self) -> &FeedEndpoints {
        &self.inner.endpoints
    }

    /// Returns queue depth statistics, optionally filtered by asset group
    /// qualifier and command kind.
    ///
    /// Responses are cached for fifteen minutes per filter combination, so
    /// this call is safe to make from periodic telemetry loops. Do not use
    /// it as part of checkpoint logic.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] when the statistics could not be obtained.
    pub async fn queue_stats(
        &self,
        asset_group_qualifier: Option<&str>,
        command_type: Option<CommandKind>,
    ) -> Result<Vec<QueueStats>, FetchError> {
        let key = stats_cache_key(asset_group_qualifier, command_type.map(CommandKind::as_str));
        let now = self.inner.clock.system_time();

        if let Some(cached) = self.inner.stats_cache.get(&key, now) {
            return Ok(cached);
        }

        let body = QueueStatsRequestBody {
            asset_group_qualifier: asset_group_qualifier.map(ToOwned::to_owned),
            command_type: command_type.map(|kind| kind.as_str().to_owned()),
        };

        let request = self
            .inner
            .post_request(&self.inner.endpoints.queue_stats, &body)
            .map_err(FetchError::from)?;
        let response = self.inner.transport.send(request).await.map_err(FetchError::from)?;
        self.inner
            .events
            .response_received(&Method::POST, &self.inner.endpoints.queue_stats, response.status());

        match response.status() {
            StatusCode::NO_CONTENT => Ok(Vec::new()),
            StatusCode::OK => {
                let parsed: QueueStatsResponseBody = serde_json::from_slice(response.body())?;
                self.inner.stats_cache.put(key, parsed.queue_stats.clone(), now);
                Ok(parsed.queue_stats)
            }
            status => Err(FetchError::unexpected_status(status, body_text(response.body()))),
        }
    }

    /// Validates a batch of envelopes, checkpointing and dropping the ones
    /// whose verifier does not hold up.
    async fn verify_batch(&self, envelopes: Vec<CommandEnvelope>) -> Vec<PrivacyCommand> {
        let mut verified = Vec::with_capacity(envelopes.len());

        for envelope in envelopes {
            let mut command = envelope.into_command();
            let verifier = command.core().current_verifier().to_owned();

            match self.inner.validator.ensure_valid(&verifier, &claims_for(&command)).await {
                Ok(()) => {
                    let callback = self.checkpoint_callback(&command);
                    let core = command.core_mut();
                    core.clear_verifier();
                    core.install_checkpoint(callback);
                    verified.push(command);
                }
                Err(error) => {
                    self.inner
                        .events
                        .validation_failure(command.correlation_vector(), command.command_id(), &error);

                    let status = match error.kind() {
                        ValidationFailureKind::Rejected => CheckpointStatus::VerificationFailed,
                        ValidationFailureKind::Unexpected => CheckpointStatus::UnexpectedVerificationFailure,
                    };

                    let args = CheckpointArgs {
                        command_id: command.command_id().to_owned(),
                        agent_state: command.agent_state().map(ToOwned::to_owned),
                        status,
                        affected_row_count: 0,
                        lease_receipt: command.lease_receipt(),
                        lease_extension: None,
                        variant_ids: Vec::new(),
                        non_transient_failures: Vec::new(),
                    };

                    // Failing to acknowledge an invalid command must not
                    // fail the batch; the command stays leased and comes
                    // back later.
                    if let Err(checkpoint_error) = self.inner.checkpoint_core(args).await {
                        self.inner.events.unhandled_error(&checkpoint_error);
                    }
                }
            }
        }

        verified
    }

    /// Builds the checkpoint route installed on a verified command. The
    /// route owns a handle to the client and the command's receipt cell, so
    /// it stays valid for as long as the command value lives.
    fn checkpoint_callback(&self, command: &PrivacyCommand) -> CheckpointCallback {
        let inner = Arc::clone(&self.inner);
        let cell = command.core().lease_cell();

        Arc::new(move |args: CheckpointArgs| {
            let inner = Arc::clone(&inner);
            let cell = cell.clone();

            async move {
                let receipt = inner.checkpoint_core(args).await?;

                if let Some(receipt) = &receipt {
                    cell.store(receipt.clone());
                }

                Ok(receipt)
            }
            .boxed()
        })
    }
}

impl<S, V> CommandSource for CommandFeedClient<S, V>
where
    S: SendRequest + 'static,
    V: CommandValidator + 'static,
{
    async fn fetch_commands(&self, cancel: &CancellationToken) -> Result<Vec<PrivacyCommand>, FetchError> {
        let request = self
            .inner
            .get_request(&self.inner.endpoints.commands)
            .map_err(FetchError::from)?;

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(FetchError::cancelled()),
            outcome = self.inner.transport.send(request) => outcome.map_err(FetchError::from)?,
        };

        self.inner
            .events
            .response_received(&Method::GET, &self.inner.endpoints.commands, response.status());

        match response.status() {
            StatusCode::NO_CONTENT => Ok(Vec::new()),
            StatusCode::OK => {
                let envelopes: Vec<CommandEnvelope> = serde_json::from_slice(response.body())?;
                Ok(self.verify_batch(envelopes).await)
            }
            status => Err(FetchError::unexpected_status(status, body_text(response.body()))),
        }
    }

    async fn checkpoint(&self, args: CheckpointArgs) -> Result<Option<LeaseReceipt>, CheckpointError> {
        self.inner.checkpoint_core(args).await
    }
}

impl<S: SendRequest, V> ClientInner<S, V> {
    async fn checkpoint_core(&self, args: CheckpointArgs) -> Result<Option<LeaseReceipt>, CheckpointError> {
        let body = CheckpointRequestBody::from(&args);
        let request = self.post_request(&self.endpoints.checkpoint, &body)?;

        // Checkpoints deliberately ignore cancellation: once processing has
        // happened, the outcome must be reported.
        let response = self.transport.send(request).await?;
        self.events
            .response_received(&Method::POST, &self.endpoints.checkpoint, response.status());

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::CONFLICT => {
                self.events.checkpoint_conflict(&args.command_id);
                Err(CheckpointError::Conflict {
                    command_id: args.command_id,
                })
            }
            StatusCode::OK => {
                let parsed: CheckpointResponseBody = serde_json::from_slice(response.body())
                    .map_err(|error| CheckpointError::Transport(TransportError::caused_by(error)))?;
                Ok(Some(LeaseReceipt::new(parsed.lease_receipt)))
            }
            status => Err(CheckpointError::Transport(TransportError::message(format!(
                "checkpoint returned unexpected status {status}, body: {:?}",
                body_text(response.body())
            )))),
        }
    }

    fn get_request(&self, uri: &Uri) -> Result<Request<Bytes>, TransportError> {
        let mut request = Request::new(Bytes::new());
        *request.method_mut() = Method::GET;
        *request.uri_mut() = uri.clone();
        self.add_common_headers(&mut request)?;
        Ok(request)
    }

    fn post_request(&self, uri: &Uri, body: &impl serde::Serialize) -> Result<Request<Bytes>, TransportError> {
        let encoded = serde_json::to_vec(body).map_err(TransportError::caused_by)?;

        let mut request = Request::new(Bytes::from(encoded));
        *request.method_mut() = Method::POST;
        *request.uri_mut() = uri.clone();
        let _ = request
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.add_common_headers(&mut request)?;
        Ok(request)
    }

    fn add_common_headers(&self, request: &mut Request<Bytes>) -> Result<(), TransportError> {
        let headers = request.headers_mut();

        let _ = headers.insert(
            "x-client-version",
            HeaderValue::from_str(CLIENT_VERSION).map_err(TransportError::caused_by)?,
        );
        let _ = headers.insert("x-supported-commands", SUPPORTED_COMMANDS);

        if let Some(duration) = self.requested_lease_duration {
            let _ = headers.insert(
                "x-lease-duration-seconds",
                HeaderValue::from_str(&duration.as_secs().to_string()).map_err(TransportError::caused_by)?,
            );
        }

        Ok(())
    }
}

fn claims_for(command: &PrivacyCommand) -> CommandClaims<'_> {
    CommandClaims {
        command_id: command.command_id(),
        operation: command.kind(),
        azure_blob_container_target_uri: match command {
            PrivacyCommand::Export(export) => export.azure_blob_container_target_uri(),
            _ => None,
        },
        data_type: match command {
            PrivacyCommand::Delete(delete) => Some(delete.data_type()),
            _ => None,
        },
    }
}

fn body_text(body: &Bytes) -> String {
    String::from_utf8_lossy(body).into_owned()
}
