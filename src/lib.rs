//! toolgate library
//!
//! A tool-calling gateway: several in-process tool services and remote tool
//! servers mounted behind one JSON-RPC endpoint, each under its own name
//! prefix, with per-service bearer-token authorization.
//!
//! # Pieces
//!
//! - [`registry`]: named tools with JSON-Schema arguments and async handlers
//! - [`mount`]: prefix → service table and qualified-name resolution
//! - [`auth`]: JWT verification against a cached JWKS, scope checks
//! - [`transport`]: client side of stdio, SSE and streamable HTTP
//! - [`proxy`]: remote servers mounted like local services
//! - [`gateway`]: the server: sessions, dispatch, HTTP and stdio front ends
//! - [`services`]: the built-in demo services
//!
//! # Protocol Version
//!
//! Speaks protocol revisions 2025-06-18, 2025-03-26 and 2024-11-05.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod mount;
pub mod proxy;
pub mod registry;
pub mod services;
pub mod transport;

pub use error::{Error, Result};
pub use toolgate_core as protocol;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging.
///
/// Output goes to stderr so stdout stays free for the stdio transport.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        _ => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    }
    .map_err(|e| Error::Config(format!("failed to install logger: {e}")))
}
