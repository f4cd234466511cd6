// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The bounded command receiver.
//!
//! Two cooperating loops share one FIFO buffer. The fetch loop pulls batches
//! from the command source whenever the buffer is below the concurrency
//! limit, pacing itself on the outcome of each attempt. The dispatch loop
//! drains the buffer into per-command tasks, never running more than the
//! concurrency limit at once. Cancellation stops intake immediately but
//! never delivery: every command that entered the buffer is dispatched
//! before [`CommandReceiver::begin_receiving`] returns.

use std::fmt::{self, Debug, Display, Formatter};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tick::Clock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::agent::PrivacyDataAgent;
use crate::commands::PrivacyCommand;
use crate::error::InvalidConcurrencyLimit;
use crate::events::{FeedEvents, TracingFeedEvents};
use crate::queue::CommandQueue;
use crate::source::CommandSource;

/// How many commands may be processed simultaneously unless configured
/// otherwise.
const DEFAULT_CONCURRENCY_LIMIT: usize = 50;

/// The logical minimum for the concurrency limit. Lower requests are
/// clamped rather than rejected.
const MINIMUM_CONCURRENCY_LIMIT: usize = 10;

/// The pacing delay after a fetch that returned no commands.
const EMPTY_BATCH_DELAY: Duration = Duration::from_millis(500);

/// The pacing delay while the buffer is at or above the concurrency limit.
const QUEUE_FULL_DELAY: Duration = Duration::from_millis(100);

/// How long the dispatch loop dozes when the buffer is empty.
const IDLE_DISPATCH_DELAY: Duration = Duration::from_millis(100);

/// The growth step of the fetch-failure delay.
const FETCH_FAILURE_DELAY_STEP: Duration = Duration::from_secs(1);

/// The ceiling of the fetch-failure delay.
const MAX_FETCH_FAILURE_DELAY: Duration = Duration::from_secs(30);

/// Receives privacy commands and dispatches them to a data agent.
///
/// This is the top-level entry point of the client library. The receiver
/// continuously fetches commands from its [`CommandSource`], buffers them,
/// and invokes the matching [`PrivacyDataAgent`] method for each one under a
/// configurable concurrency limit.
///
/// # Failure isolation
///
/// Nothing that happens while processing a single command, including agent
/// panics and checkpoint failures, can stop the receiver; failures are
/// contained per command and reported through [`FeedEvents`]. Fetch failures
/// pace the fetch loop down but never end it. The receive task itself only
/// completes in response to cancellation.
///
/// # Examples
///
/// ```rust,ignore
/// let receiver = CommandReceiver::new(agent, client, clock);
/// receiver.set_concurrency_limit(20)?;
///
/// let cancel = CancellationToken::new();
/// receiver.begin_receiving(cancel.clone()).await;
/// ```
pub struct CommandReceiver<A, C> {
    agent: Arc<A>,
    source: Arc<C>,
    clock: Clock,
    events: Arc<dyn FeedEvents>,
    concurrency_limit: Arc<AtomicUsize>,
}

impl<A, C> Clone for CommandReceiver<A, C> {
    fn clone(&self) -> Self {
        Self {
            agent: Arc::clone(&self.agent),
            source: Arc::clone(&self.source),
            clock: self.clock.clone(),
            events: Arc::clone(&self.events),
            concurrency_limit: Arc::clone(&self.concurrency_limit),
        }
    }
}

impl<A, C> Debug for CommandReceiver<A, C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandReceiver")
            .field("concurrency_limit", &self.concurrency_limit.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<A, C> CommandReceiver<A, C>
where
    A: PrivacyDataAgent,
    C: CommandSource + 'static,
{
    /// Creates a receiver that dispatches commands from `source` to `agent`.
    #[must_use]
    pub fn new(agent: A, source: C, clock: Clock) -> Self {
        Self {
            agent: Arc::new(agent),
            source: Arc::new(source),
            clock,
            events: Arc::new(TracingFeedEvents),
            concurrency_limit: Arc::new(AtomicUsize::new(DEFAULT_CONCURRENCY_LIMIT)),
        }
    }

    /// Replaces the events sink.
    #[must_use]
    pub fn events(mut self, events: impl FeedEvents + 'static) -> Self {
        self.events = Arc::new(events);
        self
    }

    /// Returns the effective concurrency limit.
    #[must_use]
    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit.load(Ordering::Relaxed)
    }

    /// Sets the number of commands that may be processed simultaneously.
    ///
    /// Values below the logical minimum of ten are clamped to it. Changing
    /// the limit during an active run affects future capacity checks only;
    /// commands already in flight are unaffected.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidConcurrencyLimit`] when `limit` is zero.
    pub fn set_concurrency_limit(&self, limit: usize) -> Result<(), InvalidConcurrencyLimit> {
        if limit == 0 {
            return Err(InvalidConcurrencyLimit);
        }

        self.concurrency_limit
            .store(limit.max(MINIMUM_CONCURRENCY_LIMIT), Ordering::Relaxed);
        Ok(())
    }

    /// Receives and processes commands until cancellation is requested.
    ///
    /// The returned future runs indefinitely and completes only after a
    /// cancellation request has been observed and every buffered command has
    /// been dispatched and awaited. It never returns an error; failures are
    /// reported through the events sink.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime; panics otherwise.
    pub async fn begin_receiving(&self, cancel: CancellationToken) {
        let queue = Arc::new(CommandQueue::default());

        // The dispatch loop gets its own stop signal, triggered only after
        // the fetch loop has fully exited. Deriving it from `cancel` instead
        // would let the final drain race a fetch that is still enqueuing.
        let stop = CancellationToken::new();
        let shared = Arc::new(DispatchShared {
            agent: Arc::clone(&self.agent),
            clock: self.clock.clone(),
            events: Arc::clone(&self.events),
            concurrency_limit: Arc::clone(&self.concurrency_limit),
        });
        let dispatch = tokio::spawn(dispatch_loop(shared, stop.clone(), Arc::clone(&queue)));

        let mut next_delay = Duration::ZERO;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                () = self.clock.delay(next_delay) => {}
            }

            if cancel.is_cancelled() {
                break;
            }

            if queue.len() < self.concurrency_limit() {
                match self.source.fetch_commands(&cancel).await {
                    Ok(commands) if !commands.is_empty() => {
                        queue.enqueue_all(commands);
                        next_delay = Duration::ZERO;
                    }
                    Ok(_) => next_delay = EMPTY_BATCH_DELAY,
                    Err(error) => {
                        if cancel.is_cancelled() {
                            self.events.cancelled();
                            break;
                        }

                        next_delay = next_delay
                            .saturating_add(FETCH_FAILURE_DELAY_STEP)
                            .min(MAX_FETCH_FAILURE_DELAY);
                        self.events.unhandled_error(&error);
                    }
                }
            } else {
                // The buffer is full enough; check again shortly.
                next_delay = QUEUE_FULL_DELAY;
            }
        }

        // Intake has stopped for good; let the dispatch loop drain what is
        // left and wait for it.
        stop.cancel();
        if let Err(join_error) = dispatch.await {
            self.events.unhandled_error(&join_error);
        }
    }
}

/// The state a dispatch task needs, shared across all of them.
struct DispatchShared<A> {
    agent: Arc<A>,
    clock: Clock,
    events: Arc<dyn FeedEvents>,
    concurrency_limit: Arc<AtomicUsize>,
}

impl<A> DispatchShared<A> {
    fn concurrency_limit(&self) -> usize {
        self.concurrency_limit.load(Ordering::Relaxed)
    }
}

async fn dispatch_loop<A: PrivacyDataAgent>(
    shared: Arc<DispatchShared<A>>,
    stop: CancellationToken,
    queue: Arc<CommandQueue>,
) {
    let mut in_flight: JoinSet<()> = JoinSet::new();

    while !stop.is_cancelled() {
        while in_flight.len() >= shared.concurrency_limit() {
            let _more = join_one(&shared, &mut in_flight).await;
        }

        loop {
            if in_flight.len() >= shared.concurrency_limit() {
                break;
            }

            let Some(command) = queue.dequeue() else { break };
            spawn_command(&shared, &mut in_flight, command);
        }

        if queue.is_empty() {
            // Doze briefly, but wake immediately on the stop signal so
            // shutdown does not wait out the pacing delay.
            tokio::select! {
                biased;
                () = stop.cancelled() => {}
                () = shared.clock.delay(IDLE_DISPATCH_DELAY) => {}
            }
        }
    }

    // Stop requested. Dispatch everything still buffered, ignoring the
    // concurrency limit: no command that entered the queue may be dropped.
    while let Some(command) = queue.dequeue() {
        spawn_command(&shared, &mut in_flight, command);
    }

    while join_one(&shared, &mut in_flight).await {}
}

/// Awaits one in-flight task. Returns `false` once the set is empty.
async fn join_one<A>(shared: &Arc<DispatchShared<A>>, in_flight: &mut JoinSet<()>) -> bool {
    match in_flight.join_next().await {
        Some(Ok(())) => true,
        Some(Err(join_error)) => {
            shared.events.unhandled_error(&join_error);
            true
        }
        None => false,
    }
}

fn spawn_command<A: PrivacyDataAgent>(
    shared: &Arc<DispatchShared<A>>,
    in_flight: &mut JoinSet<()>,
    command: PrivacyCommand,
) {
    let shared = Arc::clone(shared);
    let _abort_handle = in_flight.spawn(process_single(shared, command));
}

/// Processes one command on its own task.
async fn process_single<A: PrivacyDataAgent>(shared: Arc<DispatchShared<A>>, command: PrivacyCommand) {
    if shared.clock.system_time() >= command.approximate_lease_expiration() {
        // The lease is already gone: the work would be wasted and the
        // checkpoint refused. The feed redelivers the command under a fresh
        // lease.
        tracing::event!(
            name: "command_feed.lease_expired_skip",
            tracing::Level::DEBUG,
            command_id = command.command_id(),
        );
        return;
    }

    let handle = command.core().checkpoint_handle();
    let receipt_before = handle.current_receipt();

    let outcome = AssertUnwindSafe(dispatch_to_agent(&*shared.agent, command)).catch_unwind().await;

    let had_error = match outcome {
        Ok(Ok(())) => false,
        Ok(Err(error)) => {
            shared.events.unhandled_error(&error);
            true
        }
        Err(_panic) => {
            shared.events.unhandled_error(&ProcessingPanicked);
            true
        }
    };

    // An unchanged receipt after a failed callback means the agent never
    // acknowledged the command, so acknowledge the failure on its behalf. A
    // changed receipt means the agent already checkpointed; a second
    // checkpoint would be filed against a stale lease.
    if had_error && handle.current_receipt() == receipt_before {
        if let Err(checkpoint_error) = handle.checkpoint_failed().await {
            shared.events.unhandled_error(&checkpoint_error);
        }
    }
}

/// Routes a command to the agent method matching its kind.
async fn dispatch_to_agent<A: PrivacyDataAgent>(agent: &A, command: PrivacyCommand) -> Result<(), A::Error> {
    match command {
        PrivacyCommand::Delete(command) => agent.process_delete(command).await,
        PrivacyCommand::Export(command) => agent.process_export(command).await,
        PrivacyCommand::AccountClose(command) => agent.process_account_closed(command).await,
        PrivacyCommand::AgeOut(command) => agent.process_age_out(command).await,
    }
}

/// The stand-in error reported when a processing callback panicked.
#[derive(Debug)]
struct ProcessingPanicked;

impl Display for ProcessingPanicked {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "command processing panicked")
    }
}

impl std::error::Error for ProcessingPanicked {}
