//! HTTP transport for the tidepool sync engine
//!
//! This crate provides the transport abstraction the engine performs and
//! replays calls through: request/response types, an error taxonomy that
//! distinguishes retryable from permanent failures, and a reqwest-backed
//! client.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod retry;

pub use client::{
    HttpTransport, HttpTransportConfig, Method, Request, Response, Transport, TransportError,
};
pub use retry::{retry_transient, RetryConfig};
