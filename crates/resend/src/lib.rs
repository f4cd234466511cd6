// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Retrying wrapper for outbound HTTP exchanges.
//!
//! # Why
//!
//! Remote services throttle, hiccup, and occasionally fall over. Callers that
//! treat every non-success response as fatal end up either failing work that
//! would have succeeded a second later, or reimplementing the same retry loop
//! at every call site. This crate centralizes that loop behind the
//! [`SendRequest`] seam: wrap a transport once and every exchange through it
//! gets consistent retry behavior.
//!
//! # Behavior
//!
//! [`Resend`] retries an exchange up to a configured number of additional
//! attempts:
//!
//! - A success response returns immediately and resets the backoff policy.
//! - A throttle response (HTTP 429) carrying a `Retry-After` seconds hint
//!   sleeps for exactly that hint; the backoff policy is neither consulted
//!   nor advanced.
//! - A throttle response without a hint, a server error (5xx), or a
//!   transport-level failure sleeps for the next backoff delay.
//! - Any other client response (4xx) returns immediately without retrying.
//! - Once retries are exhausted, the last response (or transport error) is
//!   returned as-is; this layer never converts a response into an error.
//!
//! # Examples
//!
//! ```rust
//! use std::time::Duration;
//!
//! use bytes::Bytes;
//! use http::{Request, Response};
//! use resend::{Resend, SendRequest, TransportError};
//! use tick::Clock;
//!
//! struct StaticTransport;
//!
//! impl SendRequest for StaticTransport {
//!     async fn send(&self, _request: Request<Bytes>) -> Result<Response<Bytes>, TransportError> {
//!         Ok(Response::new(Bytes::new()))
//!     }
//! }
//!
//! # async fn example(clock: Clock) -> Result<(), TransportError> {
//! let transport = Resend::new(StaticTransport, clock).max_retries(2);
//!
//! let response = transport.send(Request::new(Bytes::new())).await?;
//! assert!(response.status().is_success());
//! # Ok(())
//! # }
//! ```

mod retry;
mod transport;

pub use retry::Resend;
pub use transport::{SendRequest, TransportError};
