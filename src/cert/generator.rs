//! Test PKI generation: root, intermediate and client certificates plus CRLs.
//!
//! Backs the `broker-x509-auth pki` CLI commands and gives tests real,
//! signed chains instead of canned fixtures. Built on `rcgen`, so no
//! `openssl` install is needed.

use std::fs;
use std::path::Path;

use rcgen::string::Ia5String;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateRevocationListParams, CrlDistributionPoint,
    CustomExtension, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer,
    KeyIdMethod, KeyPair, KeyUsagePurpose, RevocationReason, RevokedCertParams, SanType,
    SerialNumber,
};
use time::{Duration, OffsetDateTime};

use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Parameters
// ─────────────────────────────────────────────────────────────────────────────

/// Parameters for a CA certificate (root or intermediate).
#[derive(Debug, Clone)]
pub struct CaParams {
    /// Common Name (e.g. `"RootCA"`).
    pub cn: String,
    /// Validity period in days, starting one day in the past.
    pub validity_days: u32,
    /// `pathLenConstraint`; `None` leaves the CA unconstrained.
    pub path_len: Option<u8>,
    /// Whether to assert `keyCertSign` in keyUsage.
    pub key_cert_sign: bool,
}

impl CaParams {
    /// CA with default validity and usages.
    pub fn named(cn: &str) -> Self {
        Self {
            cn: cn.to_owned(),
            validity_days: 3650,
            path_len: None,
            key_cert_sign: true,
        }
    }
}

/// Parameters for a client (end-entity) certificate.
#[derive(Debug, Clone)]
pub struct LeafCertParams {
    /// Common Name.
    pub cn: String,
    /// Organisational Unit.
    pub ou: Option<String>,
    /// SAN DNS entries.
    pub san_dns: Vec<String>,
    /// SAN URI entries (e.g. SPIFFE IDs).
    pub san_uris: Vec<String>,
    /// SAN email entries.
    pub san_emails: Vec<String>,
    /// Validity period in days, starting one day in the past.
    pub validity_days: u32,
    /// Explicit `notBefore`, overriding `validity_days`.
    pub not_before: Option<OffsetDateTime>,
    /// Explicit `notAfter`, overriding `validity_days`.
    pub not_after: Option<OffsetDateTime>,
    /// Explicit serial number.
    pub serial: Option<u64>,
    /// Add id-kp-clientAuth to extendedKeyUsage.
    pub client_auth: bool,
    /// Extra extensions as `(oid arcs, DER value, critical)`.
    pub custom_extensions: Vec<(Vec<u64>, Vec<u8>, bool)>,
    /// CRL distribution point URIs.
    pub crl_distribution_points: Vec<String>,
}

impl LeafCertParams {
    /// Client certificate with default validity and clientAuth usage.
    pub fn named(cn: &str) -> Self {
        Self {
            cn: cn.to_owned(),
            ou: None,
            san_dns: Vec::new(),
            san_uris: Vec::new(),
            san_emails: Vec::new(),
            validity_days: 365,
            not_before: None,
            not_after: None,
            serial: None,
            client_auth: true,
            custom_extensions: Vec::new(),
            crl_distribution_points: Vec::new(),
        }
    }
}

/// A revoked entry for [`CertGenerator::crl`].
#[derive(Debug, Clone)]
pub struct RevokedEntry {
    /// Serial number as encoded in the certificate.
    pub serial: Vec<u8>,
    /// Revocation reason.
    pub reason: Option<RevocationReason>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

/// A generated certificate together with the key and parameters needed to
/// issue further certificates from it.
pub struct IssuedCert {
    issuer: Issuer<'static, KeyPair>,
    key_pem: String,
    der: Vec<u8>,
    pem: String,
}

impl IssuedCert {
    fn new(params: CertificateParams, key: KeyPair, der: Vec<u8>, pem: String) -> Self {
        Self {
            key_pem: key.serialize_pem(),
            issuer: Issuer::new(params, key),
            der,
            pem,
        }
    }

    /// Load an existing CA certificate and key for issuing.
    ///
    /// # Errors
    ///
    /// Returns an error if either PEM cannot be parsed.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| Error::Certificate(format!("Failed to parse CA key: {e}")))?;
        let key_pem = key.serialize_pem();
        let issuer = Issuer::from_ca_cert_pem(cert_pem, key)
            .map_err(|e| Error::Certificate(format!("Failed to parse CA cert: {e}")))?;
        let der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| Error::Certificate("No certificate in CA PEM".to_string()))?
            .map_err(|e| Error::Certificate(format!("Failed to decode CA PEM: {e}")))?
            .to_vec();

        Ok(Self {
            issuer,
            key_pem,
            der,
            pem: cert_pem.to_owned(),
        })
    }

    /// DER-encoded certificate.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// PEM-encoded certificate.
    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// PEM-encoded private key.
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Signing handle for certificates and CRLs issued under this one.
    fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }

    /// Write `<stem>.crt` and `<stem>.key` under `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the files
    /// cannot be written.
    pub fn write_to_dir(&self, dir: &Path, stem: &str) -> Result<()> {
        fs::create_dir_all(dir).map_err(|e| {
            Error::Certificate(format!("Cannot create dir '{}': {e}", dir.display()))
        })?;

        fs::write(dir.join(format!("{stem}.crt")), &self.pem)
            .map_err(|e| Error::Certificate(format!("Cannot write cert: {e}")))?;

        fs::write(dir.join(format!("{stem}.key")), &self.key_pem)
            .map_err(|e| Error::Certificate(format!("Cannot write key: {e}")))?;

        Ok(())
    }
}

impl std::fmt::Debug for IssuedCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCert")
            .field("pem", &self.pem)
            .finish_non_exhaustive()
    }
}

/// A generated CRL.
#[derive(Debug, Clone)]
pub struct GeneratedCrl {
    /// DER encoding.
    pub der: Vec<u8>,
    /// PEM encoding.
    pub pem: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Generator
// ─────────────────────────────────────────────────────────────────────────────

/// Certificate generator backed by `rcgen`.
pub struct CertGenerator;

impl CertGenerator {
    /// Generate a self-signed root CA.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation or signing fails.
    pub fn root(params: &CaParams) -> Result<IssuedCert> {
        let key = generate_key()?;
        let ca_params = ca_params(params);
        let cert = ca_params
            .self_signed(&key)
            .map_err(|e| Error::Certificate(format!("CA cert generation failed: {e}")))?;

        Ok(IssuedCert::new(ca_params, key, cert.der().to_vec(), cert.pem()))
    }

    /// Issue an intermediate CA signed by `issuer`.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation or signing fails.
    pub fn intermediate(params: &CaParams, issuer: &IssuedCert) -> Result<IssuedCert> {
        let key = generate_key()?;
        let ca_params = ca_params(params);
        let cert = ca_params
            .signed_by(&key, issuer.issuer())
            .map_err(|e| Error::Certificate(format!("Intermediate signing failed: {e}")))?;

        Ok(IssuedCert::new(ca_params, key, cert.der().to_vec(), cert.pem()))
    }

    /// Issue a client certificate signed by `issuer`.
    ///
    /// # Errors
    ///
    /// Returns an error if a SAN is not valid IA5, or key generation or
    /// signing fails.
    pub fn leaf(params: &LeafCertParams, issuer: &IssuedCert) -> Result<IssuedCert> {
        let key = generate_key()?;

        let mut leaf_params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, params.cn.as_str());
        if let Some(ou) = &params.ou {
            dn.push(DnType::OrganizationalUnitName, ou.as_str());
        }
        leaf_params.distinguished_name = dn;
        leaf_params.not_before = params.not_before.unwrap_or_else(|| days_from_now(-1));
        leaf_params.not_after = params
            .not_after
            .unwrap_or_else(|| days_from_now(i64::from(params.validity_days)));
        leaf_params.serial_number = params.serial.map(SerialNumber::from);
        leaf_params.subject_alt_names = sans(params)?;
        if params.client_auth {
            leaf_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        }
        leaf_params.custom_extensions = params
            .custom_extensions
            .iter()
            .map(|(oid, value, critical)| {
                let mut ext = CustomExtension::from_oid_content(oid, value.clone());
                ext.set_criticality(*critical);
                ext
            })
            .collect();
        if !params.crl_distribution_points.is_empty() {
            leaf_params.crl_distribution_points = vec![CrlDistributionPoint {
                uris: params.crl_distribution_points.clone(),
            }];
        }

        let cert = leaf_params
            .signed_by(&key, issuer.issuer())
            .map_err(|e| Error::Certificate(format!("Leaf cert signing failed: {e}")))?;

        Ok(IssuedCert::new(leaf_params, key, cert.der().to_vec(), cert.pem()))
    }

    /// Sign a CRL listing `revoked`, valid from yesterday for `next_update_days`.
    ///
    /// # Errors
    ///
    /// Returns an error if the issuer may not sign CRLs or signing fails.
    pub fn crl(
        issuer: &IssuedCert,
        revoked: &[RevokedEntry],
        next_update_days: i64,
    ) -> Result<GeneratedCrl> {
        let params = CertificateRevocationListParams {
            this_update: days_from_now(-1),
            next_update: days_from_now(next_update_days),
            crl_number: SerialNumber::from(1u64),
            issuing_distribution_point: None,
            revoked_certs: revoked
                .iter()
                .map(|entry| RevokedCertParams {
                    serial_number: SerialNumber::from_slice(&entry.serial),
                    revocation_time: days_from_now(-1),
                    reason_code: entry.reason,
                    invalidity_date: None,
                })
                .collect(),
            key_identifier_method: KeyIdMethod::Sha256,
        };

        let crl = params
            .signed_by(issuer.issuer())
            .map_err(|e| Error::Certificate(format!("CRL signing failed: {e}")))?;
        let pem = crl
            .pem()
            .map_err(|e| Error::Certificate(format!("CRL PEM encoding failed: {e}")))?;

        Ok(GeneratedCrl {
            der: crl.der().to_vec(),
            pem,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Private helpers
// ─────────────────────────────────────────────────────────────────────────────

fn generate_key() -> Result<KeyPair> {
    KeyPair::generate().map_err(|e| Error::Certificate(format!("Failed to generate key: {e}")))
}

fn ca_params(params: &CaParams) -> CertificateParams {
    let mut ca_params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, params.cn.as_str());
    ca_params.distinguished_name = dn;
    ca_params.is_ca = IsCa::Ca(match params.path_len {
        Some(len) => BasicConstraints::Constrained(len),
        None => BasicConstraints::Unconstrained,
    });
    ca_params.key_usages = if params.key_cert_sign {
        vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ]
    } else {
        vec![KeyUsagePurpose::DigitalSignature]
    };
    ca_params.not_before = days_from_now(-1);
    ca_params.not_after = days_from_now(i64::from(params.validity_days));
    ca_params
}

fn sans(params: &LeafCertParams) -> Result<Vec<SanType>> {
    let ia5 = |kind: &str, value: &str| {
        Ia5String::try_from(value)
            .map_err(|e| Error::Certificate(format!("Invalid {kind} SAN '{value}': {e}")))
    };

    let mut sans = Vec::new();
    for dns in &params.san_dns {
        sans.push(SanType::DnsName(ia5("DNS", dns)?));
    }
    for uri in &params.san_uris {
        sans.push(SanType::URI(ia5("URI", uri)?));
    }
    for email in &params.san_emails {
        sans.push(SanType::Rfc822Name(ia5("email", email)?));
    }
    Ok(sans)
}

/// `now + days`, truncated to whole seconds.
pub fn days_from_now(days: i64) -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    let now = now.replace_nanosecond(0).unwrap_or(now);
    now + Duration::days(days)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
