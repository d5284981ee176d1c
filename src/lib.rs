//! Broker X.509 Authentication Library
//!
//! Certificate-based client authentication for message-broker connect
//! pipelines.
//!
//! # Features
//!
//! - **Parsing**: DER or PEM client chains with size and length limits
//! - **Chain validation**: anchoring, validity windows, signatures, basic
//!   constraints and key usage
//! - **Revocation**: CRL files, CRL URLs / distribution points or an HTTP
//!   status responder, with TTL caching, single-flight lookups and retries
//! - **Identity mapping**: configurable rules over subject, SANs and extensions
//! - **Decision engine**: one `ALLOW principal` or `DENY reason` per attempt
//! - **Operations**: trust-anchor hot reload, structured logs, metrics
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use broker_x509_auth::cert::TrustStore;
//! use broker_x509_auth::engine::{AuthRequest, Authenticator};
//! use broker_x509_auth::identity::IdentityRule;
//! use broker_x509_auth::revocation::RevocationChecker;
//!
//! # tokio_test::block_on(async {
//! let trust = Arc::new(TrustStore::load("/etc/broker/ca.pem").unwrap());
//! let auth = Authenticator::new(trust, IdentityRule::default(), RevocationChecker::disabled());
//! let pem = std::fs::read("client.pem").unwrap();
//! let outcome = auth.authenticate(AuthRequest::pem(pem)).await;
//! println!("{}", outcome.decision);
//! # });
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adapter;
pub mod cert;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod reload;
pub mod revocation;

pub use error::{AuthError, Error, ReasonCode, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            subscriber.with(fmt::layer().with_writer(std::io::stderr)).init();
        }
    }

    Ok(())
}
