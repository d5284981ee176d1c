//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// X.509 client-certificate authentication for broker connections
#[derive(Parser, Debug)]
#[command(name = "broker-x509-auth")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "X509_AUTH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "X509_AUTH_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "X509_AUTH_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Output format for reports
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable
    #[default]
    Text,
    /// JSON document
    Json,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Authenticate a client chain as the broker would and print the decision
    Check {
        /// PEM bundle (leaf first), or one DER file per certificate
        #[arg(required = true)]
        chain: Vec<PathBuf>,

        /// Trust anchor file or directory (overrides config)
        #[arg(long, env = "X509_AUTH_TRUST_ANCHOR_PATH")]
        trust_anchors: Option<PathBuf>,

        /// Identity rule, e.g. `san.uri:spiffe://plant/|subject.cn` (overrides config)
        #[arg(long)]
        identity_rule: Option<String>,

        /// Skip revocation checking
        #[arg(long)]
        no_revocation: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List the configured trust anchors
    Anchors {
        /// Trust anchor file or directory (overrides config)
        #[arg(long, env = "X509_AUTH_TRUST_ANCHOR_PATH")]
        path: Option<PathBuf>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Test PKI generation
    #[command(subcommand)]
    Pki(PkiCommand),
}

/// PKI subcommands
#[derive(Subcommand, Debug)]
pub enum PkiCommand {
    /// Create a root CA (and optionally an intermediate)
    InitCa {
        /// Output directory
        #[arg(short, long, default_value = "pki")]
        out: PathBuf,

        /// Root Common Name
        #[arg(long, default_value = "RootCA")]
        cn: String,

        /// Also create an intermediate CA with this Common Name
        #[arg(long)]
        intermediate: Option<String>,

        /// Validity in days
        #[arg(long, default_value_t = 3650)]
        days: u32,
    },

    /// Issue a client certificate
    Issue {
        /// Issuing CA certificate (PEM)
        #[arg(long, required = true)]
        ca_cert: PathBuf,

        /// Issuing CA private key (PEM)
        #[arg(long, required = true)]
        ca_key: PathBuf,

        /// Client Common Name
        #[arg(long, required = true)]
        cn: String,

        /// Organizational unit
        #[arg(long)]
        ou: Option<String>,

        /// DNS subject alternative names
        #[arg(long = "san-dns")]
        san_dns: Vec<String>,

        /// URI subject alternative names
        #[arg(long = "san-uri")]
        san_uris: Vec<String>,

        /// Email subject alternative names
        #[arg(long = "san-email")]
        san_emails: Vec<String>,

        /// Serial number
        #[arg(long)]
        serial: Option<u64>,

        /// Validity in days
        #[arg(long, default_value_t = 365)]
        days: u32,

        /// Output directory
        #[arg(short, long, default_value = "pki")]
        out: PathBuf,
    },

    /// Sign a CRL revoking the given serials
    Crl {
        /// Issuing CA certificate (PEM)
        #[arg(long, required = true)]
        ca_cert: PathBuf,

        /// Issuing CA private key (PEM)
        #[arg(long, required = true)]
        ca_key: PathBuf,

        /// Serial to revoke, hex
        #[arg(long = "revoke")]
        serials: Vec<String>,

        /// Days until next update
        #[arg(long, default_value_t = 7)]
        next_update_days: i64,

        /// Output file (PEM)
        #[arg(short, long, default_value = "pki/ca.crl")]
        out: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_check_with_overrides() {
        let cli = Cli::try_parse_from([
            "broker-x509-auth",
            "check",
            "client.pem",
            "--trust-anchors",
            "ca.pem",
            "--no-revocation",
            "--format",
            "json",
        ])
        .unwrap();

        match cli.command {
            Command::Check {
                chain,
                trust_anchors,
                no_revocation,
                format,
                ..
            } => {
                assert_eq!(chain, vec![PathBuf::from("client.pem")]);
                assert_eq!(trust_anchors, Some(PathBuf::from("ca.pem")));
                assert!(no_revocation);
                assert_eq!(format, OutputFormat::Json);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_pki_issue_with_repeated_sans() {
        let cli = Cli::try_parse_from([
            "broker-x509-auth",
            "pki",
            "issue",
            "--ca-cert",
            "pki/ca.crt",
            "--ca-key",
            "pki/ca.key",
            "--cn",
            "device-42",
            "--san-uri",
            "spiffe://plant/device-42",
            "--san-uri",
            "urn:device:42",
        ])
        .unwrap();

        let Command::Pki(PkiCommand::Issue { san_uris, days, .. }) = cli.command else {
            panic!("expected pki issue");
        };
        assert_eq!(san_uris.len(), 2);
        assert_eq!(days, 365);
    }
}
