//! Broker connect-hook adapter
//!
//! The broker runtime calls a [`ConnectHook`] once per incoming connection
//! with whatever the TLS layer learned about the peer. [`ConnectAuthenticator`]
//! feeds the presented chain to the [`Authenticator`] and maps its decision to
//! a [`ConnectVerdict`] according to [`AdapterConfig`].

use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::CertificateDer;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{AdapterConfig, OnDeny};
use crate::engine::{AuthDecision, AuthRequest, Authenticator, ConnectionInfo, PresentedChain};
use crate::error::ReasonCode;
use crate::identity::Principal;

/// TLS details of an incoming connection
#[derive(Debug, Clone, Default)]
pub struct ClientTlsInfo {
    /// Client certificate chain, leaf first; empty when none was sent
    pub certificate_chain: Vec<CertificateDer<'static>>,
    /// Negotiated protocol version, e.g. `TLSv1.3`
    pub protocol: Option<String>,
    /// Negotiated cipher suite
    pub cipher_suite: Option<String>,
}

/// What the broker knows when a client connects
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    /// Client identifier from the protocol handshake
    pub client_id: Option<String>,
    /// Peer address
    pub remote_addr: Option<String>,
    /// Listener the connection arrived on
    pub listener: Option<String>,
    /// TLS information; `None` for plain-text listeners
    pub tls: Option<ClientTlsInfo>,
}

impl ConnectRequest {
    fn presented_chain(&self) -> Option<Vec<Vec<u8>>> {
        let chain = &self.tls.as_ref()?.certificate_chain;
        if chain.is_empty() {
            return None;
        }
        Some(chain.iter().map(|der| der.as_ref().to_vec()).collect())
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            client_id: self.client_id.clone(),
            remote_addr: self.remote_addr.clone(),
            listener: self.listener.clone(),
        }
    }
}

/// Result handed back to the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ConnectVerdict {
    /// Connection accepted as `principal`
    Authenticated {
        /// Mapped identity
        principal: Principal,
    },
    /// Connection refused
    Rejected {
        /// Client-safe reason
        reason: ReasonCode,
    },
    /// Defer to the next authenticator in the broker's chain
    NextAuthenticator,
}

/// Connect-time authentication hook
#[async_trait]
pub trait ConnectHook: Send + Sync {
    /// Decide an incoming connection
    async fn on_connect(&self, request: &ConnectRequest) -> ConnectVerdict;
}

/// [`ConnectHook`] backed by the certificate [`Authenticator`]
pub struct ConnectAuthenticator {
    authenticator: Arc<Authenticator>,
    config: AdapterConfig,
}

impl ConnectAuthenticator {
    /// Wrap `authenticator` with adapter settings
    pub fn new(authenticator: Arc<Authenticator>, config: AdapterConfig) -> Self {
        Self {
            authenticator,
            config,
        }
    }

    /// Underlying authenticator
    pub fn authenticator(&self) -> &Arc<Authenticator> {
        &self.authenticator
    }
}

#[async_trait]
impl ConnectHook for ConnectAuthenticator {
    async fn on_connect(&self, request: &ConnectRequest) -> ConnectVerdict {
        let Some(chain) = request.presented_chain() else {
            if self.config.require_client_cert {
                info!(
                    client_id = request.client_id.as_deref().unwrap_or("-"),
                    "Connection without client certificate rejected"
                );
                return ConnectVerdict::Rejected {
                    reason: ReasonCode::EmptyChain,
                };
            }
            debug!("No client certificate, deferring to next authenticator");
            return ConnectVerdict::NextAuthenticator;
        };

        let outcome = self
            .authenticator
            .authenticate(AuthRequest {
                chain: PresentedChain::Der(chain),
                connection: request.connection_info(),
            })
            .await;

        // The issuer is only known once the engine has parsed the chain
        // within its size limits.
        info!(
            client_id = request.client_id.as_deref().unwrap_or("-"),
            issuer = outcome.leaf_issuer.as_deref().unwrap_or("<unparseable>"),
            "Client certificate presented"
        );

        match outcome.decision {
            AuthDecision::Allow(principal) => ConnectVerdict::Authenticated { principal },
            AuthDecision::Deny(reason) => match self.config.on_deny {
                OnDeny::Reject => ConnectVerdict::Rejected { reason },
                OnDeny::Next => {
                    debug!(reason = reason.as_str(), "Deferring denied connection to next authenticator");
                    ConnectVerdict::NextAuthenticator
                }
            },
        }
    }
}
