//! Chain validation against a trust-anchor snapshot.
//!
//! # Check order
//!
//! 1. **Anchoring**: the chain must reach a member of the snapshot, either by
//!    containing an anchor verbatim or by being issued by one.
//! 2. **Validity**: every certificate on the path, anchor included, must
//!    cover `now`.
//! 3. **Signatures**: each certificate verifies under the next one's key.
//! 4. **Constraints**: issuers must be CAs allowed to sign certificates, the
//!    leaf must be an end entity usable for client authentication, and no
//!    certificate may carry an unknown critical extension.
//!
//! The first failing check decides the denial reason. Validation is a pure
//! function of `(chain, snapshot, now, policy)`.

use time::OffsetDateTime;
use tracing::debug;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::cert::parser::{Certificate, CertificateChain};
use crate::cert::trust::TrustAnchorSet;
use crate::error::AuthError;

/// Extensions this validator understands well enough to honour when critical.
const KNOWN_EXTENSIONS: &[&str] = &[
    "2.5.29.14",         // subjectKeyIdentifier
    "2.5.29.15",         // keyUsage
    "2.5.29.17",         // subjectAltName
    "2.5.29.19",         // basicConstraints
    "2.5.29.30",         // nameConstraints
    "2.5.29.31",         // cRLDistributionPoints
    "2.5.29.32",         // certificatePolicies
    "2.5.29.35",         // authorityKeyIdentifier
    "2.5.29.36",         // policyConstraints
    "2.5.29.37",         // extKeyUsage
    "2.5.29.54",         // inhibitAnyPolicy
    "1.3.6.1.5.5.7.1.1", // authorityInfoAccess
];

/// Policy knobs for chain validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationPolicy {
    /// Reject chains whose leaf is itself a CA.
    pub require_end_entity_leaf: bool,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            require_end_entity_leaf: true,
        }
    }
}

/// A chain that passed validation. Only this module can construct one.
///
/// `path` is the presented chain up to and including the first certificate
/// that is itself an anchor, if any. `anchor` is the trust anchor the path
/// terminates at.
#[derive(Debug, Clone)]
pub struct ValidatedChain {
    path: Vec<Certificate>,
    anchor: Certificate,
    anchor_presented: bool,
    validated_at: OffsetDateTime,
}

impl ValidatedChain {
    /// The end-entity certificate.
    pub fn leaf(&self) -> &Certificate {
        &self.path[0]
    }

    /// Presented certificates on the validated path, leaf first.
    pub fn certificates(&self) -> &[Certificate] {
        &self.path
    }

    /// The trust anchor the path terminates at.
    pub fn anchor(&self) -> &Certificate {
        &self.anchor
    }

    /// Whether the client sent the anchor itself as part of the chain.
    pub fn anchor_presented(&self) -> bool {
        self.anchor_presented
    }

    /// Issuer of the certificate at `position`, or `None` for the anchor.
    pub fn issuer_of(&self, position: usize) -> Option<&Certificate> {
        if position + 1 < self.path.len() {
            Some(&self.path[position + 1])
        } else if !self.anchor_presented && position + 1 == self.path.len() {
            Some(&self.anchor)
        } else {
            None
        }
    }

    /// Time the chain was validated against.
    pub fn validated_at(&self) -> OffsetDateTime {
        self.validated_at
    }
}

/// Validate `chain` against `anchors` at time `now`.
pub fn validate(
    chain: CertificateChain,
    anchors: &TrustAnchorSet,
    now: OffsetDateTime,
    policy: &ValidationPolicy,
) -> Result<ValidatedChain, AuthError> {
    let presented_len = chain.len();
    let validated = anchor_chain(chain, anchors)?;

    if validated.path.len() < presented_len {
        debug!(
            presented = presented_len,
            used = validated.path.len(),
            "Ignoring certificates above the first trust anchor"
        );
    }

    check_validity(&validated, now)?;
    check_signatures(&validated)?;
    check_constraints(&validated, policy)?;

    Ok(ValidatedChain {
        validated_at: now,
        ..validated
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Anchoring
// ─────────────────────────────────────────────────────────────────────────────

fn anchor_chain(
    chain: CertificateChain,
    anchors: &TrustAnchorSet,
) -> Result<ValidatedChain, AuthError> {
    let mut path = chain.into_certificates();

    if let Some(idx) = path.iter().position(|cert| anchors.contains(cert)) {
        path.truncate(idx + 1);
        let anchor = path[idx].clone();
        return Ok(ValidatedChain {
            path,
            anchor,
            anchor_presented: true,
            validated_at: OffsetDateTime::UNIX_EPOCH,
        });
    }

    let last_position = path.len() - 1;
    let last = &path[last_position];

    let anchor = anchors
        .find_by_subject(last.issuer())
        .find(|candidate| verify_signature(last, candidate).is_ok())
        .cloned()
        .ok_or_else(|| AuthError::UntrustedIssuer {
            position: last_position,
            issuer: last.issuer().to_string(),
        })?;

    Ok(ValidatedChain {
        path,
        anchor,
        anchor_presented: false,
        validated_at: OffsetDateTime::UNIX_EPOCH,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Validity windows
// ─────────────────────────────────────────────────────────────────────────────

fn check_validity(chain: &ValidatedChain, now: OffsetDateTime) -> Result<(), AuthError> {
    for (position, cert) in positioned(chain) {
        if !cert.is_valid_at(now) {
            return Err(AuthError::ExpiredCertificate {
                position,
                subject: cert.subject().to_string(),
                not_yet_valid: now < cert.not_before(),
            });
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Signatures
// ─────────────────────────────────────────────────────────────────────────────

fn check_signatures(chain: &ValidatedChain) -> Result<(), AuthError> {
    for (position, pair) in chain.path.windows(2).enumerate() {
        verify_signature(&pair[0], &pair[1])
            .map_err(|detail| AuthError::SignatureMismatch { position, detail })?;
    }
    Ok(())
}

/// Verify that `issuer`'s key signed `child`.
pub(crate) fn verify_signature(child: &Certificate, issuer: &Certificate) -> Result<(), String> {
    let (_, child_x509) = X509Certificate::from_der(child.der())
        .map_err(|e| format!("cannot decode certificate: {e}"))?;
    let (_, issuer_x509) = X509Certificate::from_der(issuer.der())
        .map_err(|e| format!("cannot decode issuer: {e}"))?;

    child_x509
        .verify_signature(Some(issuer_x509.public_key()))
        .map_err(|e| format!("{e} (signed by '{}')", issuer.subject()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Constraints
// ─────────────────────────────────────────────────────────────────────────────

fn check_constraints(chain: &ValidatedChain, policy: &ValidationPolicy) -> Result<(), AuthError> {
    check_leaf(chain.leaf(), policy)?;

    for (position, cert) in positioned(chain).skip(1) {
        check_issuer(cert, position, chain.anchor() == cert)?;
    }

    for (position, cert) in positioned(chain) {
        if let Some((oid, _)) = cert
            .extensions()
            .iter()
            .find(|(oid, ext)| ext.critical && !KNOWN_EXTENSIONS.contains(&oid.as_str()))
        {
            return Err(AuthError::ConstraintViolation {
                position,
                detail: format!("unrecognised critical extension {oid}"),
            });
        }
    }

    Ok(())
}

fn check_leaf(leaf: &Certificate, policy: &ValidationPolicy) -> Result<(), AuthError> {
    let violation = |detail: &str| AuthError::ConstraintViolation {
        position: 0,
        detail: detail.to_string(),
    };

    if policy.require_end_entity_leaf && leaf.is_ca() {
        return Err(violation("leaf certificate is a CA"));
    }
    if let Some(ku) = leaf.key_usage() {
        if !ku.digital_signature && !ku.key_agreement {
            return Err(violation(
                "leaf keyUsage permits neither digitalSignature nor keyAgreement",
            ));
        }
    }
    if let Some(eku) = leaf.extended_key_usage() {
        if !eku.client_auth && !eku.any {
            return Err(violation("leaf extendedKeyUsage does not include clientAuth"));
        }
    }
    Ok(())
}

/// `position` is also the number of certificates below this issuer; the
/// intermediates among them are `position - 1`.
fn check_issuer(cert: &Certificate, position: usize, is_anchor: bool) -> Result<(), AuthError> {
    let violation = |detail: String| AuthError::ConstraintViolation { position, detail };

    match cert.basic_constraints() {
        Some(bc) if !bc.ca => {
            return Err(violation(format!(
                "'{}' is not a CA but issued a certificate",
                cert.subject()
            )));
        }
        Some(bc) => {
            let intermediates_below = u32::try_from(position.saturating_sub(1)).unwrap_or(u32::MAX);
            if let Some(path_len) = bc.path_len {
                if intermediates_below > path_len {
                    return Err(violation(format!(
                        "pathLenConstraint {path_len} of '{}' exceeded by {intermediates_below} intermediates",
                        cert.subject()
                    )));
                }
            }
        }
        // Legacy v1 roots carry no extensions at all.
        None if is_anchor && cert.version() < 3 => {}
        None => {
            return Err(violation(format!(
                "'{}' lacks basicConstraints but issued a certificate",
                cert.subject()
            )));
        }
    }

    if let Some(ku) = cert.key_usage() {
        if !ku.key_cert_sign {
            return Err(violation(format!(
                "keyUsage of '{}' does not permit keyCertSign",
                cert.subject()
            )));
        }
    }

    Ok(())
}

/// Path certificates with their positions, followed by the anchor at
/// `path.len()` when it was not presented.
fn positioned(chain: &ValidatedChain) -> impl Iterator<Item = (usize, &Certificate)> {
    let anchor = (!chain.anchor_presented).then_some((chain.path.len(), &chain.anchor));
    chain.path.iter().enumerate().chain(anchor)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::generator::{CaParams, CertGenerator, IssuedCert, LeafCertParams, days_from_now};
    use crate::cert::parser::{ParseLimits, parse_der_chain};

    struct Pki {
        root: IssuedCert,
        intermediate: IssuedCert,
        leaf: IssuedCert,
    }

    fn pki_with_leaf(leaf: LeafCertParams) -> Pki {
        let root = CertGenerator::root(&CaParams::named("RootCA")).unwrap();
        let intermediate =
            CertGenerator::intermediate(&CaParams::named("IntermediateCA"), &root).unwrap();
        let leaf = CertGenerator::leaf(&leaf, &intermediate).unwrap();
        Pki {
            root,
            intermediate,
            leaf,
        }
    }

    fn pki() -> Pki {
        pki_with_leaf(LeafCertParams::named("device-42"))
    }

    fn anchors(certs: &[&IssuedCert]) -> TrustAnchorSet {
        TrustAnchorSet::from_certificates(
            certs
                .iter()
                .map(|c| Certificate::from_der(c.der()).unwrap())
                .collect(),
        )
        .unwrap()
    }

    fn chain(certs: &[&IssuedCert]) -> CertificateChain {
        let ders: Vec<&[u8]> = certs.iter().map(|c| c.der()).collect();
        parse_der_chain(&ders, &ParseLimits::default()).unwrap()
    }

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    #[test]
    fn valid_chain_anchored_by_issuer() {
        let pki = pki();
        let validated = validate(
            chain(&[&pki.leaf, &pki.intermediate]),
            &anchors(&[&pki.root]),
            now(),
            &ValidationPolicy::default(),
        )
        .unwrap();

        assert_eq!(validated.certificates().len(), 2);
        assert!(!validated.anchor_presented());
        assert_eq!(validated.anchor().subject().common_name(), Some("RootCA"));
        assert_eq!(
            validated.issuer_of(0).unwrap().subject().common_name(),
            Some("IntermediateCA")
        );
        assert_eq!(
            validated.issuer_of(1).unwrap().subject().common_name(),
            Some("RootCA")
        );
        assert!(validated.issuer_of(2).is_none());
    }

    #[test]
    fn valid_chain_with_root_presented() {
        let pki = pki();
        let validated = validate(
            chain(&[&pki.leaf, &pki.intermediate, &pki.root]),
            &anchors(&[&pki.root]),
            now(),
            &ValidationPolicy::default(),
        )
        .unwrap();

        assert!(validated.anchor_presented());
        assert_eq!(validated.certificates().len(), 3);
        assert!(validated.issuer_of(2).is_none());
    }

    #[test]
    fn pinned_intermediate_truncates_path() {
        let pki = pki();
        let validated = validate(
            chain(&[&pki.leaf, &pki.intermediate, &pki.root]),
            &anchors(&[&pki.intermediate]),
            now(),
            &ValidationPolicy::default(),
        )
        .unwrap();

        assert_eq!(validated.certificates().len(), 2);
        assert_eq!(
            validated.anchor().subject().common_name(),
            Some("IntermediateCA")
        );
    }

    #[test]
    fn unknown_root_is_untrusted() {
        let pki = pki();
        let other = CertGenerator::root(&CaParams::named("OtherRoot")).unwrap();
        let err = validate(
            chain(&[&pki.leaf, &pki.intermediate]),
            &anchors(&[&other]),
            now(),
            &ValidationPolicy::default(),
        )
        .unwrap_err();

        assert!(matches!(err, AuthError::UntrustedIssuer { position: 1, .. }));
    }

    #[test]
    fn same_name_different_key_is_untrusted() {
        let pki = pki();
        let impostor = CertGenerator::root(&CaParams::named("RootCA")).unwrap();
        let err = validate(
            chain(&[&pki.leaf, &pki.intermediate]),
            &anchors(&[&impostor]),
            now(),
            &ValidationPolicy::default(),
        )
        .unwrap_err();

        assert!(matches!(err, AuthError::UntrustedIssuer { .. }));
    }

    #[test]
    fn untrusted_wins_over_expiry() {
        let pki = pki_with_leaf(LeafCertParams {
            not_before: Some(days_from_now(-30)),
            not_after: Some(days_from_now(-1)),
            ..LeafCertParams::named("device-42")
        });
        let other = CertGenerator::root(&CaParams::named("OtherRoot")).unwrap();
        let err = validate(
            chain(&[&pki.leaf, &pki.intermediate]),
            &anchors(&[&other]),
            now(),
            &ValidationPolicy::default(),
        )
        .unwrap_err();

        assert_eq!(err.reason(), crate::ReasonCode::UntrustedIssuer);
    }

    #[test]
    fn expired_leaf_is_reported_at_position_zero() {
        let pki = pki_with_leaf(LeafCertParams {
            not_before: Some(days_from_now(-30)),
            not_after: Some(days_from_now(-1)),
            ..LeafCertParams::named("device-42")
        });
        let err = validate(
            chain(&[&pki.leaf, &pki.intermediate]),
            &anchors(&[&pki.root]),
            now(),
            &ValidationPolicy::default(),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            AuthError::ExpiredCertificate {
                position: 0,
                not_yet_valid: false,
                ..
            }
        ));
    }

    #[test]
    fn not_yet_valid_leaf_is_expired_certificate() {
        let pki = pki_with_leaf(LeafCertParams {
            not_before: Some(days_from_now(2)),
            not_after: Some(days_from_now(30)),
            ..LeafCertParams::named("device-42")
        });
        let err = validate(
            chain(&[&pki.leaf, &pki.intermediate]),
            &anchors(&[&pki.root]),
            now(),
            &ValidationPolicy::default(),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            AuthError::ExpiredCertificate {
                not_yet_valid: true,
                ..
            }
        ));
    }

    #[test]
    fn expired_anchor_is_reported_past_the_path() {
        let pki = pki();
        let err = validate(
            chain(&[&pki.leaf, &pki.intermediate]),
            &anchors(&[&pki.root]),
            days_from_now(20_000),
            &ValidationPolicy::default(),
        )
        .unwrap_err();

        // Every certificate is expired that far out; the leaf is reported first.
        assert!(matches!(err, AuthError::ExpiredCertificate { position: 0, .. }));
    }

    #[test]
    fn forged_intermediate_signature_is_mismatch() {
        let pki = pki();
        // Same subject name as the real intermediate, different key.
        let forged =
            CertGenerator::intermediate(&CaParams::named("IntermediateCA"), &pki.root).unwrap();
        let err = validate(
            chain(&[&pki.leaf, &forged]),
            &anchors(&[&pki.root]),
            now(),
            &ValidationPolicy::default(),
        )
        .unwrap_err();

        assert!(matches!(err, AuthError::SignatureMismatch { position: 0, .. }));
    }

    #[test]
    fn non_ca_issuer_is_constraint_violation() {
        let root = CertGenerator::root(&CaParams::named("RootCA")).unwrap();
        let not_a_ca = CertGenerator::leaf(
            &LeafCertParams {
                client_auth: false,
                ..LeafCertParams::named("NotACA")
            },
            &root,
        )
        .unwrap();
        let leaf = CertGenerator::leaf(&LeafCertParams::named("device-42"), &not_a_ca).unwrap();

        let err = validate(
            chain(&[&leaf, &not_a_ca]),
            &anchors(&[&root]),
            now(),
            &ValidationPolicy::default(),
        )
        .unwrap_err();

        assert!(matches!(err, AuthError::ConstraintViolation { position: 1, .. }));
    }

    #[test]
    fn ca_without_key_cert_sign_is_constraint_violation() {
        let root = CertGenerator::root(&CaParams::named("RootCA")).unwrap();
        let intermediate = CertGenerator::intermediate(
            &CaParams {
                key_cert_sign: false,
                ..CaParams::named("IntermediateCA")
            },
            &root,
        )
        .unwrap();
        let leaf = CertGenerator::leaf(&LeafCertParams::named("device-42"), &intermediate).unwrap();

        let err = validate(
            chain(&[&leaf, &intermediate]),
            &anchors(&[&root]),
            now(),
            &ValidationPolicy::default(),
        )
        .unwrap_err();

        assert!(matches!(err, AuthError::ConstraintViolation { position: 1, .. }));
    }

    #[test]
    fn path_length_constraint_is_enforced() {
        let root = CertGenerator::root(&CaParams {
            path_len: Some(0),
            ..CaParams::named("RootCA")
        })
        .unwrap();
        let intermediate =
            CertGenerator::intermediate(&CaParams::named("IntermediateCA"), &root).unwrap();
        let leaf = CertGenerator::leaf(&LeafCertParams::named("device-42"), &intermediate).unwrap();

        let err = validate(
            chain(&[&leaf, &intermediate]),
            &anchors(&[&root]),
            now(),
            &ValidationPolicy::default(),
        )
        .unwrap_err();

        assert!(matches!(err, AuthError::ConstraintViolation { position: 2, .. }));
    }

    #[test]
    fn ca_leaf_is_rejected_unless_allowed() {
        let root = CertGenerator::root(&CaParams::named("RootCA")).unwrap();
        let sub_ca = CertGenerator::intermediate(&CaParams::named("SubCA"), &root).unwrap();
        let trust = anchors(&[&root]);

        let err = validate(
            chain(&[&sub_ca]),
            &trust,
            now(),
            &ValidationPolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(err, AuthError::ConstraintViolation { position: 0, .. }));

        let relaxed = ValidationPolicy {
            require_end_entity_leaf: false,
        };
        assert!(validate(chain(&[&sub_ca]), &trust, now(), &relaxed).is_ok());
    }

    #[test]
    fn leaf_without_extended_key_usage_is_accepted() {
        let pki = pki_with_leaf(LeafCertParams {
            client_auth: false,
            ..LeafCertParams::named("device-42")
        });
        assert!(
            validate(
                chain(&[&pki.leaf, &pki.intermediate]),
                &anchors(&[&pki.root]),
                now(),
                &ValidationPolicy::default(),
            )
            .is_ok()
        );
    }

    #[test]
    fn unknown_critical_extension_is_rejected() {
        let root = CertGenerator::root(&CaParams::named("RootCA")).unwrap();
        let intermediate =
            CertGenerator::intermediate(&CaParams::named("IntermediateCA"), &root).unwrap();
        let trust = anchors(&[&root]);

        let mut params = LeafCertParams::named("device-42");
        params
            .custom_extensions
            .push((vec![1, 3, 6, 1, 4, 1, 99999, 1], vec![0x05, 0x00], false));
        let tolerated = CertGenerator::leaf(&params, &intermediate).unwrap();
        assert!(
            validate(
                chain(&[&tolerated, &intermediate]),
                &trust,
                now(),
                &ValidationPolicy::default(),
            )
            .is_ok()
        );

        params.custom_extensions[0].2 = true;
        let critical = CertGenerator::leaf(&params, &intermediate).unwrap();
        let err = validate(
            chain(&[&critical, &intermediate]),
            &trust,
            now(),
            &ValidationPolicy::default(),
        )
        .unwrap_err();
        match err {
            AuthError::ConstraintViolation { position, detail } => {
                assert_eq!(position, 0);
                assert!(detail.contains("1.3.6.1.4.1.99999.1"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn validation_is_idempotent() {
        let pki = pki();
        let trust = anchors(&[&pki.root]);
        let presented = chain(&[&pki.leaf, &pki.intermediate]);
        let at = now();

        let first = validate(presented.clone(), &trust, at, &ValidationPolicy::default()).unwrap();
        let second = validate(presented, &trust, at, &ValidationPolicy::default()).unwrap();
        assert_eq!(first.certificates(), second.certificates());
        assert_eq!(first.anchor(), second.anchor());
        assert_eq!(first.validated_at(), second.validated_at());
    }
}
