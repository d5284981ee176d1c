//! Certificate chain parsing.
//!
//! Decodes the chain a client presents during the TLS handshake into owned,
//! immutable [`Certificate`] values. Size limits are enforced before any ASN.1
//! decoding so a hostile client cannot make us buffer unbounded input.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use x509_parser::certificate::X509Certificate;
use x509_parser::der_parser::asn1_rs::Tag;
use x509_parser::extensions::{DistributionPointName, GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;
use x509_parser::x509::{AttributeTypeAndValue, X509Name};

use crate::error::AuthError;
use crate::{Error, Result};

/// Default upper bound on presented chain length.
pub const DEFAULT_MAX_CHAIN_LENGTH: usize = 8;

/// Default upper bound on a single DER certificate.
pub const DEFAULT_MAX_CERTIFICATE_BYTES: usize = 16 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Limits
// ─────────────────────────────────────────────────────────────────────────────

/// Memory bounds applied while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseLimits {
    /// Maximum number of certificates in a presented chain.
    pub max_chain_length: usize,
    /// Maximum DER size of any single certificate.
    pub max_certificate_bytes: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_chain_length: DEFAULT_MAX_CHAIN_LENGTH,
            max_certificate_bytes: DEFAULT_MAX_CERTIFICATE_BYTES,
        }
    }
}

impl ParseLimits {
    /// Upper bound on a PEM buffer that can still satisfy the DER limits.
    ///
    /// Base64 inflates by 4/3; a further margin covers line breaks and the
    /// BEGIN/END armour.
    fn max_pem_bytes(&self) -> usize {
        self.max_chain_length
            .saturating_mul(self.max_certificate_bytes)
            .saturating_mul(3)
            / 2
            + 1024
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Distinguished name
// ─────────────────────────────────────────────────────────────────────────────

/// A subject or issuer name.
///
/// Equality is byte-exact on the DER encoding; the attribute list and
/// one-line rendering exist for identity mapping and logs.
#[derive(Debug, Clone)]
pub struct DistinguishedName {
    raw: Vec<u8>,
    attributes: Vec<(String, String)>,
    one_line: String,
}

impl DistinguishedName {
    fn from_x509(name: &X509Name<'_>) -> Self {
        let attributes = name
            .iter_attributes()
            .filter_map(|attr| {
                let label = attribute_label(&attr.attr_type().to_id_string());
                let value = attribute_text(attr);
                if value.is_none() {
                    tracing::debug!(
                        attribute = %label,
                        tag = ?attr.attr_value().tag(),
                        "Skipping non-text name attribute"
                    );
                }
                Some((label, value?))
            })
            .collect();

        Self {
            raw: name.as_raw().to_vec(),
            attributes,
            one_line: name.to_string(),
        }
    }

    /// DER encoding of the name.
    pub fn as_raw(&self) -> &[u8] {
        &self.raw
    }

    /// First value for `label` (`CN`, `OU`, … or a dotted OID).
    pub fn first(&self, label: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(label))
            .map(|(_, v)| v.as_str())
    }

    /// First Common Name.
    pub fn common_name(&self) -> Option<&str> {
        self.first("CN")
    }

    /// String-valued attributes in encoding order.
    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }
}

impl PartialEq for DistinguishedName {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for DistinguishedName {}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.one_line)
    }
}

/// Text of a name attribute, including the BMP and Universal string types
/// `as_str` does not cover.
fn attribute_text(attr: &AttributeTypeAndValue<'_>) -> Option<String> {
    if let Ok(text) = attr.as_str() {
        return Some(text.to_owned());
    }
    let value = attr.attr_value();
    let bytes = value.as_bytes();
    match value.tag() {
        Tag::BmpString if bytes.len() % 2 == 0 => {
            let units = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]));
            char::decode_utf16(units).collect::<std::result::Result<String, _>>().ok()
        }
        Tag::UniversalString if bytes.len() % 4 == 0 => bytes
            .chunks_exact(4)
            .map(|quad| char::from_u32(u32::from_be_bytes([quad[0], quad[1], quad[2], quad[3]])))
            .collect(),
        _ => None,
    }
}

/// Map well-known attribute OIDs to their short labels.
pub(crate) fn attribute_label(oid: &str) -> String {
    match oid {
        "2.5.4.3" => "CN",
        "2.5.4.5" => "serialNumber",
        "2.5.4.6" => "C",
        "2.5.4.7" => "L",
        "2.5.4.8" => "ST",
        "2.5.4.10" => "O",
        "2.5.4.11" => "OU",
        "1.2.840.113549.1.9.1" => "emailAddress",
        "0.9.2342.19200300.100.1.1" => "UID",
        "0.9.2342.19200300.100.1.25" => "DC",
        other => other,
    }
    .to_owned()
}

// ─────────────────────────────────────────────────────────────────────────────
// Extension views
// ─────────────────────────────────────────────────────────────────────────────

/// A raw extension as it appeared in the certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    /// Criticality flag.
    pub critical: bool,
    /// DER-encoded extension value (contents of the OCTET STRING).
    pub value: Vec<u8>,
}

/// `basicConstraints` content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicConstraints {
    /// `cA` flag.
    pub ca: bool,
    /// `pathLenConstraint`.
    pub path_len: Option<u32>,
}

/// The `keyUsage` bits this crate inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct KeyUsage {
    /// digitalSignature
    pub digital_signature: bool,
    /// keyAgreement
    pub key_agreement: bool,
    /// keyCertSign
    pub key_cert_sign: bool,
    /// cRLSign
    pub crl_sign: bool,
}

/// The `extendedKeyUsage` purposes this crate inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtendedKeyUsage {
    /// anyExtendedKeyUsage
    pub any: bool,
    /// id-kp-clientAuth
    pub client_auth: bool,
    /// id-kp-serverAuth
    pub server_auth: bool,
}

/// Subject Alternative Name entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectAltNames {
    /// dNSName entries.
    pub dns: Vec<String>,
    /// uniformResourceIdentifier entries (e.g. SPIFFE IDs).
    pub uris: Vec<String>,
    /// rfc822Name entries.
    pub emails: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Certificate
// ─────────────────────────────────────────────────────────────────────────────

/// A parsed X.509 certificate. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct Certificate {
    der: Arc<[u8]>,
    version: u32,
    subject: DistinguishedName,
    issuer: DistinguishedName,
    serial: Vec<u8>,
    serial_hex: String,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    public_key: Vec<u8>,
    signature_algorithm: String,
    signature: Vec<u8>,
    extensions: BTreeMap<String, Extension>,
    basic_constraints: Option<BasicConstraints>,
    key_usage: Option<KeyUsage>,
    extended_key_usage: Option<ExtendedKeyUsage>,
    subject_alt_names: SubjectAltNames,
    crl_distribution_points: Vec<String>,
    fingerprint: String,
}

impl Certificate {
    /// Parse a single DER-encoded certificate.
    ///
    /// # Errors
    ///
    /// Returns `Error::Certificate` if the encoding is invalid.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        Self::decode(der).map_err(Error::Certificate)
    }

    fn decode(der: &[u8]) -> std::result::Result<Self, String> {
        let (rest, cert) =
            X509Certificate::from_der(der).map_err(|e| format!("DER decode failed: {e}"))?;
        if !rest.is_empty() {
            return Err(format!("{} trailing bytes after certificate", rest.len()));
        }

        let basic_constraints = cert
            .basic_constraints()
            .map_err(|e| format!("invalid basicConstraints: {e}"))?
            .map(|ext| BasicConstraints {
                ca: ext.value.ca,
                path_len: ext.value.path_len_constraint,
            });

        let key_usage = cert
            .key_usage()
            .map_err(|e| format!("invalid keyUsage: {e}"))?
            .map(|ext| KeyUsage {
                digital_signature: ext.value.digital_signature(),
                key_agreement: ext.value.key_agreement(),
                key_cert_sign: ext.value.key_cert_sign(),
                crl_sign: ext.value.crl_sign(),
            });

        let extended_key_usage = cert
            .extended_key_usage()
            .map_err(|e| format!("invalid extendedKeyUsage: {e}"))?
            .map(|ext| ExtendedKeyUsage {
                any: ext.value.any,
                client_auth: ext.value.client_auth,
                server_auth: ext.value.server_auth,
            });

        let subject_alt_names = extract_sans(&cert)?;

        let extensions = cert
            .extensions()
            .iter()
            .map(|ext| {
                (
                    ext.oid.to_id_string(),
                    Extension {
                        critical: ext.critical,
                        value: ext.value.to_vec(),
                    },
                )
            })
            .collect();

        let serial = cert.raw_serial().to_vec();
        let validity = cert.validity();

        Ok(Self {
            der: Arc::from(der),
            version: cert.version().0 + 1,
            subject: DistinguishedName::from_x509(cert.subject()),
            issuer: DistinguishedName::from_x509(cert.issuer()),
            serial_hex: serial_to_hex(&serial),
            serial,
            not_before: validity.not_before.to_datetime(),
            not_after: validity.not_after.to_datetime(),
            public_key: cert.public_key().raw.to_vec(),
            signature_algorithm: cert.signature_algorithm.algorithm.to_id_string(),
            signature: cert.signature_value.as_ref().to_vec(),
            extensions,
            basic_constraints,
            key_usage,
            extended_key_usage,
            subject_alt_names,
            crl_distribution_points: extract_crl_distribution_points(&cert),
            fingerprint: hex::encode(Sha256::digest(der)),
        })
    }

    /// Original DER encoding.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// X.509 version (1, 2 or 3).
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Subject name.
    pub fn subject(&self) -> &DistinguishedName {
        &self.subject
    }

    /// Issuer name.
    pub fn issuer(&self) -> &DistinguishedName {
        &self.issuer
    }

    /// Serial number as encoded (big-endian, may carry a sign byte).
    pub fn serial(&self) -> &[u8] {
        &self.serial
    }

    /// Serial number as lowercase hex without leading zero bytes.
    pub fn serial_hex(&self) -> &str {
        &self.serial_hex
    }

    /// Start of the validity window.
    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    /// End of the validity window.
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// `true` when `now` lies inside the validity window.
    pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// DER-encoded SubjectPublicKeyInfo.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Signature algorithm OID (dotted form).
    pub fn signature_algorithm(&self) -> &str {
        &self.signature_algorithm
    }

    /// Signature bytes.
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Extensions keyed by dotted OID.
    pub fn extensions(&self) -> &BTreeMap<String, Extension> {
        &self.extensions
    }

    /// Parsed `basicConstraints`, if present.
    pub fn basic_constraints(&self) -> Option<BasicConstraints> {
        self.basic_constraints
    }

    /// Parsed `keyUsage`, if present.
    pub fn key_usage(&self) -> Option<KeyUsage> {
        self.key_usage
    }

    /// Parsed `extendedKeyUsage`, if present.
    pub fn extended_key_usage(&self) -> Option<ExtendedKeyUsage> {
        self.extended_key_usage
    }

    /// Subject Alternative Names.
    pub fn subject_alt_names(&self) -> &SubjectAltNames {
        &self.subject_alt_names
    }

    /// URIs from the CRL distribution points extension.
    pub fn crl_distribution_points(&self) -> &[String] {
        &self.crl_distribution_points
    }

    /// SHA-256 fingerprint of the DER encoding, lowercase hex.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// `true` when subject and issuer names are identical.
    pub fn is_self_issued(&self) -> bool {
        self.subject == self.issuer
    }

    /// `true` when `basicConstraints` marks this certificate as a CA.
    pub fn is_ca(&self) -> bool {
        self.basic_constraints.is_some_and(|bc| bc.ca)
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for Certificate {}

fn serial_to_hex(serial: &[u8]) -> String {
    let start = serial
        .iter()
        .position(|b| *b != 0)
        .unwrap_or(serial.len().saturating_sub(1));
    hex::encode(&serial[start..])
}

fn extract_sans(cert: &X509Certificate<'_>) -> std::result::Result<SubjectAltNames, String> {
    let mut sans = SubjectAltNames::default();

    let Some(ext) = cert
        .subject_alternative_name()
        .map_err(|e| format!("invalid subjectAltName: {e}"))?
    else {
        return Ok(sans);
    };

    for name in &ext.value.general_names {
        match name {
            GeneralName::DNSName(dns) => sans.dns.push((*dns).to_owned()),
            GeneralName::URI(uri) => sans.uris.push((*uri).to_owned()),
            GeneralName::RFC822Name(email) => sans.emails.push((*email).to_owned()),
            _ => {}
        }
    }

    Ok(sans)
}

fn extract_crl_distribution_points(cert: &X509Certificate<'_>) -> Vec<String> {
    let mut uris = Vec::new();
    for ext in cert.extensions() {
        if let ParsedExtension::CRLDistributionPoints(points) = ext.parsed_extension() {
            for point in &points.points {
                if let Some(DistributionPointName::FullName(names)) = &point.distribution_point {
                    for name in names {
                        if let GeneralName::URI(uri) = name {
                            uris.push((*uri).to_owned());
                        }
                    }
                }
            }
        }
    }
    uris
}

// ─────────────────────────────────────────────────────────────────────────────
// Chain
// ─────────────────────────────────────────────────────────────────────────────

/// A presented certificate chain, leaf first.
///
/// Never empty; each certificate's issuer equals the subject of the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateChain {
    certificates: Vec<Certificate>,
}

impl CertificateChain {
    /// Build a chain from already parsed certificates, checking linkage.
    pub fn new(certificates: Vec<Certificate>) -> std::result::Result<Self, AuthError> {
        if certificates.is_empty() {
            return Err(AuthError::EmptyChain);
        }

        for (position, pair) in certificates.windows(2).enumerate() {
            if pair[0].issuer() != pair[1].subject() {
                return Err(AuthError::MalformedCertificate {
                    position,
                    detail: format!(
                        "issuer '{}' does not match subject '{}' of the next certificate",
                        pair[0].issuer(),
                        pair[1].subject()
                    ),
                });
            }
        }

        Ok(Self { certificates })
    }

    /// The end-entity certificate.
    pub fn leaf(&self) -> &Certificate {
        &self.certificates[0]
    }

    /// All certificates, leaf first.
    pub fn certificates(&self) -> &[Certificate] {
        &self.certificates
    }

    /// Number of certificates.
    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    /// Always `false`; present for API symmetry with slices.
    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    pub(crate) fn into_certificates(self) -> Vec<Certificate> {
        self.certificates
    }
}

/// Parse a chain presented as individual DER blobs, leaf first.
pub fn parse_der_chain<B: AsRef<[u8]>>(
    blobs: &[B],
    limits: &ParseLimits,
) -> std::result::Result<CertificateChain, AuthError> {
    if blobs.is_empty() {
        return Err(AuthError::EmptyChain);
    }
    if blobs.len() > limits.max_chain_length {
        return Err(AuthError::MalformedCertificate {
            position: limits.max_chain_length,
            detail: format!(
                "chain of {} certificates exceeds limit of {}",
                blobs.len(),
                limits.max_chain_length
            ),
        });
    }

    let mut certificates = Vec::with_capacity(blobs.len());
    for (position, blob) in blobs.iter().enumerate() {
        let der = blob.as_ref();
        if der.is_empty() {
            return Err(AuthError::MalformedCertificate {
                position,
                detail: "empty certificate".to_string(),
            });
        }
        if der.len() > limits.max_certificate_bytes {
            return Err(AuthError::MalformedCertificate {
                position,
                detail: format!(
                    "certificate of {} bytes exceeds limit of {}",
                    der.len(),
                    limits.max_certificate_bytes
                ),
            });
        }
        let cert = Certificate::decode(der)
            .map_err(|detail| AuthError::MalformedCertificate { position, detail })?;
        certificates.push(cert);
    }

    tracing::debug!(length = certificates.len(), "Parsed client certificate chain");
    CertificateChain::new(certificates)
}

/// Parse a chain presented as one PEM buffer with `CERTIFICATE` blocks.
pub fn parse_pem_chain(
    pem: &[u8],
    limits: &ParseLimits,
) -> std::result::Result<CertificateChain, AuthError> {
    if pem.len() > limits.max_pem_bytes() {
        return Err(AuthError::MalformedCertificate {
            position: 0,
            detail: format!("PEM input of {} bytes exceeds size limit", pem.len()),
        });
    }

    let mut blobs = Vec::new();
    for (position, item) in rustls_pemfile::certs(&mut &pem[..]).enumerate() {
        if position >= limits.max_chain_length {
            return Err(AuthError::MalformedCertificate {
                position,
                detail: format!(
                    "chain exceeds limit of {} certificates",
                    limits.max_chain_length
                ),
            });
        }
        let der = item.map_err(|e| AuthError::MalformedCertificate {
            position,
            detail: format!("PEM decode failed: {e}"),
        })?;
        blobs.push(der);
    }

    // Input that is not just whitespace but holds no certificate block is
    // an encoding problem, not an absent chain.
    if blobs.is_empty() && !pem.iter().all(u8::is_ascii_whitespace) {
        return Err(AuthError::MalformedCertificate {
            position: 0,
            detail: "no CERTIFICATE block in PEM input".to_string(),
        });
    }

    parse_der_chain(&blobs, limits)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::generator::{CaParams, CertGenerator, LeafCertParams};

    fn pki() -> (crate::cert::IssuedCert, crate::cert::IssuedCert, crate::cert::IssuedCert) {
        let root = CertGenerator::root(&CaParams::named("RootCA")).unwrap();
        let intermediate =
            CertGenerator::intermediate(&CaParams::named("IntermediateCA"), &root).unwrap();
        let leaf = CertGenerator::leaf(
            &LeafCertParams {
                ou: Some("sensors".to_string()),
                san_uris: vec!["spiffe://plant.example/device/42".to_string()],
                san_dns: vec!["device-42.plant.example".to_string()],
                ..LeafCertParams::named("device-42")
            },
            &intermediate,
        )
        .unwrap();
        (root, intermediate, leaf)
    }

    #[test]
    fn parses_der_chain_leaf_first() {
        let (_, intermediate, leaf) = pki();
        let chain =
            parse_der_chain(&[leaf.der(), intermediate.der()], &ParseLimits::default()).unwrap();

        assert_eq!(chain.len(), 2);
        assert_eq!(chain.leaf().subject().common_name(), Some("device-42"));
        assert_eq!(chain.leaf().issuer().common_name(), Some("IntermediateCA"));
        assert_eq!(
            chain.certificates()[1].issuer().common_name(),
            Some("RootCA")
        );
    }

    #[test]
    fn extracts_structured_fields() {
        let (_, _, leaf) = pki();
        let cert = Certificate::from_der(leaf.der()).unwrap();

        assert_eq!(cert.version(), 3);
        assert_eq!(cert.subject().first("OU"), Some("sensors"));
        assert_eq!(
            cert.subject_alt_names().uris,
            vec!["spiffe://plant.example/device/42"]
        );
        assert_eq!(cert.subject_alt_names().dns, vec!["device-42.plant.example"]);
        assert!(!cert.is_ca());
        assert!(cert.extended_key_usage().is_some_and(|eku| eku.client_auth));
        assert_eq!(cert.fingerprint().len(), 64);
        assert!(!cert.serial_hex().is_empty());
        assert!(cert.not_before() < cert.not_after());
        assert!(!cert.public_key().is_empty());
        assert!(!cert.signature().is_empty());
    }

    #[test]
    fn bmp_and_universal_string_attributes_are_decoded() {
        use rcgen::string::{BmpString, UniversalString};
        use rcgen::{CertificateParams, DnType, DnValue, KeyPair};

        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.distinguished_name.push(
            DnType::CommonName,
            DnValue::BmpString(BmpString::try_from("Gerät-7").unwrap()),
        );
        params.distinguished_name.push(
            DnType::OrganizationalUnitName,
            DnValue::UniversalString(UniversalString::try_from("Fertigung").unwrap()),
        );
        let cert = params.self_signed(&key).unwrap();

        let parsed = Certificate::from_der(cert.der()).unwrap();
        assert_eq!(parsed.subject().common_name(), Some("Gerät-7"));
        assert_eq!(parsed.subject().first("OU"), Some("Fertigung"));
    }

    #[test]
    fn ca_certificate_reports_basic_constraints() {
        let (root, _, _) = pki();
        let cert = Certificate::from_der(root.der()).unwrap();
        assert!(cert.is_ca());
        assert!(cert.is_self_issued());
        assert!(cert.key_usage().is_some_and(|ku| ku.key_cert_sign));
        assert!(cert.extensions().contains_key("2.5.29.19"));
    }

    #[test]
    fn parses_pem_bundle() {
        let (_, intermediate, leaf) = pki();
        let bundle = format!("{}{}", leaf.pem(), intermediate.pem());
        let chain = parse_pem_chain(bundle.as_bytes(), &ParseLimits::default()).unwrap();
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn empty_input_is_empty_chain() {
        let none: [&[u8]; 0] = [];
        assert_eq!(
            parse_der_chain(&none, &ParseLimits::default()).unwrap_err(),
            AuthError::EmptyChain
        );
        assert_eq!(
            parse_pem_chain(b"", &ParseLimits::default()).unwrap_err(),
            AuthError::EmptyChain
        );
        assert_eq!(
            parse_pem_chain(b" \n\t\n", &ParseLimits::default()).unwrap_err(),
            AuthError::EmptyChain
        );
    }

    #[test]
    fn pem_without_certificate_blocks_is_malformed() {
        let (root, _, _) = pki();
        let key_only = root.key_pem().to_owned();
        for input in [b"hello broker".as_slice(), key_only.as_bytes()] {
            assert!(matches!(
                parse_pem_chain(input, &ParseLimits::default()).unwrap_err(),
                AuthError::MalformedCertificate { position: 0, .. }
            ));
        }
    }

    #[test]
    fn garbage_is_malformed_with_position() {
        let (_, _, leaf) = pki();
        let err = parse_der_chain(&[leaf.der(), b"not a cert".as_slice()], &ParseLimits::default())
            .unwrap_err();
        assert!(matches!(
            err,
            AuthError::MalformedCertificate { position: 1, .. }
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let (_, _, leaf) = pki();
        let mut der = leaf.der().to_vec();
        der.extend_from_slice(&[0x00, 0x01]);
        let err = parse_der_chain(&[der], &ParseLimits::default()).unwrap_err();
        assert!(matches!(
            err,
            AuthError::MalformedCertificate { position: 0, .. }
        ));
    }

    #[test]
    fn oversized_certificate_is_rejected_before_decoding() {
        let limits = ParseLimits {
            max_certificate_bytes: 64,
            ..ParseLimits::default()
        };
        let (_, _, leaf) = pki();
        let err = parse_der_chain(&[leaf.der()], &limits).unwrap_err();
        match err {
            AuthError::MalformedCertificate { detail, .. } => {
                assert!(detail.contains("exceeds limit"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn overlong_chain_is_rejected() {
        let limits = ParseLimits {
            max_chain_length: 1,
            ..ParseLimits::default()
        };
        let (_, intermediate, leaf) = pki();
        let err = parse_der_chain(&[leaf.der(), intermediate.der()], &limits).unwrap_err();
        assert_eq!(err.reason(), crate::ReasonCode::MalformedCertificate);

        let bundle = format!("{}{}", leaf.pem(), intermediate.pem());
        let err = parse_pem_chain(bundle.as_bytes(), &limits).unwrap_err();
        assert_eq!(err.reason(), crate::ReasonCode::MalformedCertificate);
    }

    #[test]
    fn broken_linkage_is_malformed() {
        let (root, _, leaf) = pki();
        // leaf is issued by IntermediateCA, not RootCA
        let err = parse_der_chain(&[leaf.der(), root.der()], &ParseLimits::default()).unwrap_err();
        assert!(matches!(
            err,
            AuthError::MalformedCertificate { position: 0, .. }
        ));
    }

    #[test]
    fn distinguished_names_compare_by_encoding() {
        let (root, intermediate, _) = pki();
        let root = Certificate::from_der(root.der()).unwrap();
        let intermediate = Certificate::from_der(intermediate.der()).unwrap();
        assert_eq!(intermediate.issuer(), root.subject());
        assert_ne!(intermediate.subject(), root.subject());
        assert!(root.subject().to_string().contains("RootCA"));
    }

    #[test]
    fn serial_hex_strips_sign_byte() {
        assert_eq!(serial_to_hex(&[0x00, 0x8f, 0x01]), "8f01");
        assert_eq!(serial_to_hex(&[0x00]), "00");
        assert_eq!(serial_to_hex(&[0x2a]), "2a");
    }
}
