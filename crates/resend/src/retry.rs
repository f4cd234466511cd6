// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use bytes::Bytes;
use holdoff::{Backoff, ExponentialBackoff};
use http::{Request, Response, StatusCode, header};
use parking_lot::Mutex;
use recoverable::{Recovery, RecoveryInfo, RecoveryKind};
use tick::Clock;

use crate::transport::{SendRequest, TransportError};

/// The number of additional attempts made by default.
const DEFAULT_MAX_RETRIES: u32 = 2;

/// The default backoff applied between attempts without a server hint.
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Applies retry logic to a single outbound exchange.
///
/// `Resend` wraps an inner [`SendRequest`] and re-sends the request when the
/// response indicates a transient condition, up to `max_retries` additional
/// attempts (so `max_retries + 1` attempts in total). Delays between attempts
/// come from the server's `Retry-After` hint when one is present on a
/// throttle response, and from the configured backoff policy otherwise.
///
/// The backoff state is shared across exchanges made through the same
/// wrapper and is reset whenever an exchange succeeds, so an isolated blip
/// does not inflate the delays of the next incident.
///
/// See the [crate documentation][crate] for the full classification rules.
#[derive(Debug)]
pub struct Resend<S, B = ExponentialBackoff> {
    inner: S,
    clock: Clock,
    max_retries: u32,
    backoff: Mutex<B>,
}

impl<S> Resend<S> {
    /// Wraps `inner` with the default retry configuration: two additional
    /// attempts and an exponential backoff from one second up to thirty.
    ///
    /// # Panics
    ///
    /// Does not panic; the default backoff parameters are statically valid.
    #[must_use]
    pub fn new(inner: S, clock: Clock) -> Self {
        #[expect(clippy::unwrap_used, reason = "the default parameters are nonzero constants")]
        let backoff = ExponentialBackoff::new(DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY).unwrap();

        Self {
            inner,
            clock,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: Mutex::new(backoff),
        }
    }
}

impl<S, B> Resend<S, B> {
    /// Sets the number of additional attempts after the first one.
    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Replaces the backoff policy used between attempts without a server
    /// hint.
    #[must_use]
    pub fn backoff<B2: Backoff>(self, backoff: B2) -> Resend<S, B2> {
        Resend {
            inner: self.inner,
            clock: self.clock,
            max_retries: self.max_retries,
            backoff: Mutex::new(backoff),
        }
    }
}

impl<S, B> SendRequest for Resend<S, B>
where
    S: SendRequest,
    B: Backoff + Send,
{
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, TransportError> {
        let mut attempt: u32 = 0;

        loop {
            let outcome = self.inner.send(clone_request(&request)).await;

            let recovery = match &outcome {
                Ok(response) => classify(response),
                Err(error) => error.recovery(),
            };

            if recovery.kind() != RecoveryKind::Retry {
                if outcome.is_ok() {
                    self.backoff.lock().reset();
                }

                return outcome;
            }

            if attempt >= self.max_retries {
                return outcome;
            }

            // A server-supplied hint takes precedence over the policy; the
            // policy is not advanced for hinted attempts.
            let delay = match recovery.get_delay() {
                Some(hint) => hint,
                None => self.backoff.lock().delay(),
            };

            attempt = attempt.saturating_add(1);

            tracing::event!(
                name: "resend.retry",
                tracing::Level::WARN,
                attempt.index = attempt,
                retry.delay = delay.as_secs_f32(),
            );

            self.clock.delay(delay).await;
        }
    }
}

/// Classifies a response into recovery information.
///
/// Throttle responses may carry a server hint; server errors are retried on
/// the policy's schedule; everything else, including non-throttle client
/// errors, is final.
fn classify(response: &Response<Bytes>) -> RecoveryInfo {
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        return match retry_after(response) {
            Some(hint) => RecoveryInfo::retry().delay(hint),
            None => RecoveryInfo::retry(),
        };
    }

    if status.is_server_error() {
        return RecoveryInfo::retry();
    }

    RecoveryInfo::never()
}

/// Parses a `Retry-After` header given in seconds.
///
/// The HTTP-date form of the header is not produced by the services this
/// wrapper fronts and parses as no hint.
fn retry_after(response: &Response<Bytes>) -> Option<Duration> {
    response
        .headers()
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Rebuilds a request for another attempt.
///
/// `http::Request` is not `Clone`; the body is a cheap `Bytes` handle, so a
/// field-wise copy is sufficient.
fn clone_request(request: &Request<Bytes>) -> Request<Bytes> {
    let mut cloned = Request::new(request.body().clone());
    *cloned.method_mut() = request.method().clone();
    *cloned.uri_mut() = request.uri().clone();
    *cloned.version_mut() = request.version();
    *cloned.headers_mut() = request.headers().clone();
    cloned
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "no need to be strict in tests")]

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use http::HeaderValue;
    use static_assertions::assert_impl_all;
    use tick::ClockControl;

    use super::*;

    assert_impl_all!(Resend<ScriptedTransport>: Send, Sync);

    /// Returns scripted outcomes in order and counts invocations.
    struct ScriptedTransport {
        outcomes: Mutex<VecDeque<Result<Response<Bytes>, TransportError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(outcomes: impl IntoIterator<Item = Result<Response<Bytes>, TransportError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into_iter().collect()),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl SendRequest for ScriptedTransport {
        async fn send(&self, _request: Request<Bytes>) -> Result<Response<Bytes>, TransportError> {
            let _ = self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes.lock().pop_front().expect("ran out of scripted outcomes")
        }
    }

    /// A backoff spy that fails the test if the policy is ever consulted.
    struct RefuseBackoff;

    impl Backoff for RefuseBackoff {
        fn delay(&mut self) -> Duration {
            panic!("the backoff policy must not be consulted");
        }

        fn reset(&mut self) {}
    }

    fn response(status: StatusCode) -> Response<Bytes> {
        let mut response = Response::new(Bytes::new());
        *response.status_mut() = status;
        response
    }

    fn throttle_with_hint(seconds: u64) -> Response<Bytes> {
        let mut response = response(StatusCode::TOO_MANY_REQUESTS);
        let _ = response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from_str(&seconds.to_string()).unwrap());
        response
    }

    fn auto_clock() -> Clock {
        ClockControl::default().auto_advance_timers(true).to_clock()
    }

    fn request() -> Request<Bytes> {
        Request::new(Bytes::new())
    }

    #[tokio::test]
    async fn success_short_circuits() {
        // A frozen clock without timer advancement hangs forever on any
        // delay, so this also proves no sleep happens on the success path.
        let clock = ClockControl::new().to_clock();
        let transport = ScriptedTransport::new([Ok(response(StatusCode::OK))]);
        let resend = Resend::new(&transport, clock);

        let result = resend.send(request()).await.unwrap();

        assert_eq!(result.status(), StatusCode::OK);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn exhausts_max_retries_and_returns_last_response() {
        let transport = ScriptedTransport::new([
            Ok(response(StatusCode::TOO_MANY_REQUESTS)),
            Ok(response(StatusCode::TOO_MANY_REQUESTS)),
            Ok(response(StatusCode::TOO_MANY_REQUESTS)),
        ]);
        let resend = Resend::new(&transport, auto_clock()).max_retries(2);

        let result = resend.send(request()).await.unwrap();

        assert_eq!(result.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn retry_after_hint_bypasses_backoff_policy() {
        let control = ClockControl::default().auto_advance_timers(true);
        let clock = control.to_clock();
        let stopwatch = clock.stopwatch();

        let transport = ScriptedTransport::new([
            Ok(throttle_with_hint(3)),
            Ok(throttle_with_hint(3)),
            Ok(response(StatusCode::OK)),
        ]);
        let resend = Resend::new(&transport, clock).max_retries(2).backoff(RefuseBackoff);

        let result = resend.send(request()).await.unwrap();

        assert_eq!(result.status(), StatusCode::OK);
        assert_eq!(transport.calls(), 3);
        assert!(stopwatch.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test]
    async fn server_error_retries_until_success() {
        let transport = ScriptedTransport::new([
            Ok(response(StatusCode::INTERNAL_SERVER_ERROR)),
            Ok(response(StatusCode::SERVICE_UNAVAILABLE)),
            Ok(response(StatusCode::OK)),
        ]);
        let resend = Resend::new(&transport, auto_clock()).max_retries(2);

        let result = resend.send(request()).await.unwrap();

        assert_eq!(result.status(), StatusCode::OK);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let clock = ClockControl::new().to_clock();
        let transport = ScriptedTransport::new([Ok(response(StatusCode::NOT_FOUND))]);
        let resend = Resend::new(&transport, clock).max_retries(5);

        let result = resend.send(request()).await.unwrap();

        assert_eq!(result.status(), StatusCode::NOT_FOUND);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn transport_error_retries_then_surfaces() {
        let transport = ScriptedTransport::new([
            Err(TransportError::message("reset")),
            Err(TransportError::message("reset")),
            Err(TransportError::message("reset again")),
        ]);
        let resend = Resend::new(&transport, auto_clock()).max_retries(2);

        let error = resend.send(request()).await.unwrap_err();

        assert_eq!(error.to_string(), "reset again");
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn success_resets_backoff_sequence() {
        let control = ClockControl::default().auto_advance_timers(true);
        let clock = control.to_clock();
        let stopwatch = clock.stopwatch();

        let transport = ScriptedTransport::new([
            Ok(response(StatusCode::INTERNAL_SERVER_ERROR)),
            Ok(response(StatusCode::OK)),
            Ok(response(StatusCode::INTERNAL_SERVER_ERROR)),
            Ok(response(StatusCode::OK)),
        ]);
        let resend = Resend::new(&transport, clock).max_retries(2);

        let first = resend.send(request()).await.unwrap();
        let second = resend.send(request()).await.unwrap();

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::OK);

        // Two incidents, each paced by the first delay of the sequence
        // (500ms); without the reset the second incident would wait 1.5s.
        assert_eq!(stopwatch.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn zero_max_retries_returns_first_transient_response() {
        let clock = ClockControl::new().to_clock();
        let transport = ScriptedTransport::new([Ok(response(StatusCode::TOO_MANY_REQUESTS))]);
        let resend = Resend::new(&transport, clock).max_retries(0);

        let result = resend.send(request()).await.unwrap();

        assert_eq!(result.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn request_is_rebuilt_per_attempt() {
        let mut original = Request::new(Bytes::from_static(b"payload"));
        let _ = original
            .headers_mut()
            .insert("x-test-header", HeaderValue::from_static("value"));

        let rebuilt = clone_request(&original);

        assert_eq!(rebuilt.method(), original.method());
        assert_eq!(rebuilt.uri(), original.uri());
        assert_eq!(rebuilt.headers(), original.headers());
        assert_eq!(rebuilt.body(), original.body());
    }

    #[test]
    fn retry_after_parsing() {
        assert_eq!(retry_after(&throttle_with_hint(3)), Some(Duration::from_secs(3)));
        assert_eq!(retry_after(&response(StatusCode::TOO_MANY_REQUESTS)), None);

        // The HTTP-date form carries no usable hint here.
        let mut dated = response(StatusCode::TOO_MANY_REQUESTS);
        let _ = dated.headers_mut().insert(
            header::RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&dated), None);
    }
}
