//! X.509 certificate handling: parsing, trust anchors, chain validation and
//! test PKI generation.

pub mod chain;
pub mod generator;
pub mod parser;
pub mod trust;

pub use chain::{ValidatedChain, ValidationPolicy, validate};
pub use generator::{CaParams, CertGenerator, GeneratedCrl, IssuedCert, LeafCertParams, RevokedEntry};
pub use parser::{
    BasicConstraints, Certificate, CertificateChain, DistinguishedName, ExtendedKeyUsage,
    Extension, KeyUsage, ParseLimits, SubjectAltNames, parse_der_chain, parse_pem_chain,
};
pub use trust::{TrustAnchorSet, TrustStore, load_certificate_file};
