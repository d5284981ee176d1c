//! Identity mapping: validated certificate fields to a broker principal.
//!
//! An [`IdentityRule`] is parsed once from configuration and applied to the
//! leaf of every validated chain. Rules are one or more selectors joined by
//! `|`; the first selector yielding a non-empty value wins.
//!
//! | Selector            | Value                                        |
//! |---------------------|----------------------------------------------|
//! | `subject.cn`        | first CN of the leaf subject (default)       |
//! | `subject.ou`, `subject.o`, `subject.<label or OID>` | first matching subject attribute |
//! | `subject`           | full one-line subject DN                     |
//! | `san.dns`, `san.uri`, `san.email` | first SAN of that type         |
//! | `san.uri:<prefix>`  | first SAN URI starting with `<prefix>`       |
//! | `ext:<OID>`         | extension value as text, or lowercase hex    |
//! | `serial`            | leaf serial, lowercase hex                   |
//! | `fingerprint`       | SHA-256 of the leaf DER, lowercase hex       |

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cert::parser::attribute_label;
use crate::cert::{Certificate, ValidatedChain};
use crate::error::AuthError;
use crate::{Error, Result};

/// Principal attribute: value selected by the identity rule
pub const CLIENT_ID: &str = "clientId";
/// Principal attribute: leaf Common Name
pub const COMMON_NAME: &str = "commonName";
/// Principal attribute: leaf subject DN
pub const SUBJECT: &str = "subject";
/// Principal attribute: leaf issuer DN
pub const ISSUER: &str = "issuer";
/// Principal attribute: leaf serial (hex)
pub const SERIAL: &str = "serial";
/// Principal attribute: leaf SHA-256 fingerprint (hex)
pub const FINGERPRINT: &str = "fingerprint";

/// Subject attribute labels accepted after `subject.`
const SUBJECT_LABELS: &[&str] = &[
    "CN",
    "OU",
    "O",
    "C",
    "L",
    "ST",
    "UID",
    "DC",
    "serialNumber",
    "emailAddress",
];

// ─────────────────────────────────────────────────────────────────────────────
// Rule
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Selector {
    SubjectAttribute(String),
    Subject,
    SanDns,
    SanUri(Option<String>),
    SanEmail,
    Extension(String),
    Serial,
    Fingerprint,
}

impl Selector {
    fn extract(&self, cert: &Certificate) -> Option<String> {
        let sans = cert.subject_alt_names();
        let value = match self {
            Self::SubjectAttribute(label) => cert.subject().first(label).map(str::to_owned),
            Self::Subject => Some(cert.subject().to_string()),
            Self::SanDns => sans.dns.first().cloned(),
            Self::SanUri(None) => sans.uris.first().cloned(),
            Self::SanUri(Some(prefix)) => sans.uris.iter().find(|u| u.starts_with(prefix)).cloned(),
            Self::SanEmail => sans.emails.first().cloned(),
            Self::Extension(oid) => cert
                .extensions()
                .get(oid)
                .map(|ext| extension_text(&ext.value)),
            Self::Serial => Some(cert.serial_hex().to_owned()),
            Self::Fingerprint => Some(cert.fingerprint().to_owned()),
        };
        value.filter(|v| !v.trim().is_empty())
    }
}

impl FromStr for Selector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let lower = s.to_ascii_lowercase();
        let invalid = |why: &str| Error::Config(format!("invalid identity selector '{s}': {why}"));

        match lower.as_str() {
            "subject" => return Ok(Self::Subject),
            "san.dns" => return Ok(Self::SanDns),
            "san.uri" => return Ok(Self::SanUri(None)),
            "san.email" => return Ok(Self::SanEmail),
            "serial" => return Ok(Self::Serial),
            "fingerprint" => return Ok(Self::Fingerprint),
            _ => {}
        }

        if lower.starts_with("san.uri:") {
            let prefix = &s["san.uri:".len()..];
            if prefix.is_empty() {
                return Err(invalid("empty URI prefix"));
            }
            return Ok(Self::SanUri(Some(prefix.to_owned())));
        }

        if lower.starts_with("ext:") {
            let oid = &s["ext:".len()..];
            if !is_dotted_oid(oid) {
                return Err(invalid("expected a dotted OID"));
            }
            return Ok(Self::Extension(oid.to_owned()));
        }

        if lower.starts_with("subject.") {
            let attr = &s["subject.".len()..];
            if is_dotted_oid(attr) {
                return Ok(Self::SubjectAttribute(attribute_label(attr)));
            }
            return SUBJECT_LABELS
                .iter()
                .find(|label| label.eq_ignore_ascii_case(attr))
                .map(|label| Self::SubjectAttribute((*label).to_owned()))
                .ok_or_else(|| invalid("unknown subject attribute"));
        }

        Err(invalid("unknown selector"))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SubjectAttribute(label) if is_dotted_oid(label) => write!(f, "subject.{label}"),
            Self::SubjectAttribute(label) => write!(f, "subject.{}", label.to_ascii_lowercase()),
            Self::Subject => f.write_str("subject"),
            Self::SanDns => f.write_str("san.dns"),
            Self::SanUri(None) => f.write_str("san.uri"),
            Self::SanUri(Some(prefix)) => write!(f, "san.uri:{prefix}"),
            Self::SanEmail => f.write_str("san.email"),
            Self::Extension(oid) => write!(f, "ext:{oid}"),
            Self::Serial => f.write_str("serial"),
            Self::Fingerprint => f.write_str("fingerprint"),
        }
    }
}

fn is_dotted_oid(s: &str) -> bool {
    let mut arcs = 0;
    for arc in s.split('.') {
        if arc.is_empty() || !arc.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        arcs += 1;
    }
    arcs >= 2
}

/// Decode a DER string value, falling back to lowercase hex.
fn extension_text(value: &[u8]) -> String {
    match x509_parser::der_parser::parse_der(value) {
        Ok((rest, obj)) if rest.is_empty() => match obj.as_str() {
            Ok(text) => text.to_owned(),
            Err(_) => hex::encode(value),
        },
        _ => hex::encode(value),
    }
}

/// Identity extraction rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdentityRule {
    selectors: Vec<Selector>,
}

impl IdentityRule {
    /// Value selected from `cert`, if any alternative matches.
    pub fn extract(&self, cert: &Certificate) -> Option<String> {
        self.selectors.iter().find_map(|s| s.extract(cert))
    }
}

impl Default for IdentityRule {
    fn default() -> Self {
        Self {
            selectors: vec![Selector::SubjectAttribute("CN".to_owned())],
        }
    }
}

impl FromStr for IdentityRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().is_empty() {
            return Err(Error::Config("identity rule is empty".to_string()));
        }
        let selectors = s
            .split('|')
            .map(Selector::from_str)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { selectors })
    }
}

impl TryFrom<String> for IdentityRule {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<IdentityRule> for String {
    fn from(rule: IdentityRule) -> Self {
        rule.to_string()
    }
}

impl fmt::Display for IdentityRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, selector) in self.selectors.iter().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            write!(f, "{selector}")?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Principal
// ─────────────────────────────────────────────────────────────────────────────

/// Authenticated identity handed to the broker. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Principal {
    attributes: BTreeMap<String, String>,
}

impl Principal {
    /// The identifier selected by the identity rule
    pub fn client_id(&self) -> &str {
        self.attributes
            .get(CLIENT_ID)
            .map_or("", String::as_str)
    }

    /// Named attribute
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// All attributes
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    /// Human-readable label for logs: the client id, then CN, then `<unknown>`
    pub fn display_name(&self) -> &str {
        [CLIENT_ID, COMMON_NAME]
            .iter()
            .find_map(|key| self.get(key).filter(|v| !v.is_empty()))
            .unwrap_or("<unknown>")
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Derive the principal for a validated chain.
///
/// # Errors
///
/// Returns `NoMatchingAttribute` when no alternative of `rule` yields a value.
pub fn map_identity(
    chain: &ValidatedChain,
    rule: &IdentityRule,
) -> std::result::Result<Principal, AuthError> {
    let leaf = chain.leaf();
    let client_id = rule.extract(leaf).ok_or_else(|| AuthError::NoMatchingAttribute {
        rule: rule.to_string(),
    })?;

    let mut attributes = BTreeMap::new();
    attributes.insert(CLIENT_ID.to_owned(), client_id);
    if let Some(cn) = leaf.subject().common_name() {
        attributes.insert(COMMON_NAME.to_owned(), cn.to_owned());
    }
    attributes.insert(SUBJECT.to_owned(), leaf.subject().to_string());
    attributes.insert(ISSUER.to_owned(), leaf.issuer().to_string());
    attributes.insert(SERIAL.to_owned(), leaf.serial_hex().to_owned());
    attributes.insert(FINGERPRINT.to_owned(), leaf.fingerprint().to_owned());

    Ok(Principal { attributes })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
