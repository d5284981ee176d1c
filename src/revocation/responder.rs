//! HTTP status responder
//!
//! Queries a responder with `GET <url>?serial=<hex>&issuer=<dn>&issuer_sha256=<hex>`
//! and expects a JSON body:
//!
//! ```json
//! { "status": "good" | "revoked" | "unknown", "reason": "keyCompromise", "next_update_secs": 3600 }
//! ```
//!
//! `reason` and `next_update_secs` are optional.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{RevocationQuery, RevocationSource, RevocationStatus, SourceAnswer};
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ReplyStatus {
    Good,
    Revoked,
    Unknown,
}

#[derive(Debug, Deserialize)]
struct Reply {
    status: ReplyStatus,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    next_update_secs: Option<u64>,
}

/// Revocation source backed by an HTTP status responder
pub struct ResponderSource {
    url: String,
    client: Client,
}

impl ResponderSource {
    /// Create a source for `url`
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is empty or the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(Error::Config("responder URL is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create responder HTTP client: {e}")))?;

        Ok(Self { url, client })
    }

    /// Responder URL
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RevocationSource for ResponderSource {
    fn name(&self) -> &'static str {
        "responder"
    }

    async fn query(&self, query: RevocationQuery<'_>) -> Result<SourceAnswer> {
        let serial = query.certificate.serial_hex();
        let issuer = query.issuer.subject().to_string();

        let response = self
            .client
            .get(&self.url)
            .query(&[
                ("serial", serial),
                ("issuer", issuer.as_str()),
                ("issuer_sha256", query.issuer.fingerprint()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Revocation(format!(
                "responder {} returned {status}",
                self.url
            )));
        }

        let body = response.bytes().await?;
        let reply: Reply = serde_json::from_slice(&body)?;
        debug!(serial, status = ?reply.status, "Responder answered");

        let status = match reply.status {
            ReplyStatus::Good => RevocationStatus::Good,
            ReplyStatus::Revoked => RevocationStatus::Revoked {
                reason: reply.reason.unwrap_or_else(|| "unspecified".to_string()),
            },
            ReplyStatus::Unknown => RevocationStatus::Unknown,
        };

        Ok(SourceAnswer {
            status,
            ttl_hint: reply.next_update_secs.map(Duration::from_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::{CaParams, CertGenerator, Certificate, LeafCertParams};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn certs() -> (Certificate, Certificate) {
        let ca = CertGenerator::root(&CaParams::named("IntermediateCA")).unwrap();
        let leaf = CertGenerator::leaf(
            &LeafCertParams {
                serial: Some(0x2a),
                ..LeafCertParams::named("device-42")
            },
            &ca,
        )
        .unwrap();
        (
            Certificate::from_der(leaf.der()).unwrap(),
            Certificate::from_der(ca.der()).unwrap(),
        )
    }

    async fn answer(server: &MockServer) -> Result<SourceAnswer> {
        let (leaf, issuer) = certs();
        let source =
            ResponderSource::new(format!("{}/status", server.uri()), Duration::from_secs(2))
                .unwrap();
        source
            .query(RevocationQuery {
                certificate: &leaf,
                issuer: &issuer,
            })
            .await
    }

    #[tokio::test]
    async fn good_with_ttl_hint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .and(query_param("serial", "2a"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"status": "good", "next_update_secs": 60})),
            )
            .mount(&server)
            .await;

        let answer = answer(&server).await.unwrap();
        assert_eq!(answer.status, RevocationStatus::Good);
        assert_eq!(answer.ttl_hint, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn revoked_carries_reason() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(
                    serde_json::json!({"status": "revoked", "reason": "keyCompromise"}),
                ),
            )
            .mount(&server)
            .await;

        let answer = answer(&server).await.unwrap();
        assert_eq!(
            answer.status,
            RevocationStatus::Revoked {
                reason: "keyCompromise".to_string()
            }
        );
        assert_eq!(answer.ttl_hint, None);
    }

    #[tokio::test]
    async fn server_error_is_retryable_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = answer(&server).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn unexpected_body_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "maybe"})),
            )
            .mount(&server)
            .await;

        let err = answer(&server).await.unwrap_err();
        assert!(matches!(err, Error::Json(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn empty_url_is_config_error() {
        assert!(matches!(
            ResponderSource::new("  ", Duration::from_secs(1)),
            Err(Error::Config(_))
        ));
    }
}
