//! broker-x509-auth - client-certificate authentication tooling
//!
//! Checks client chains the way the broker would, lists trust anchors and
//! generates a throwaway test PKI.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use serde_json::json;
use tracing::error;

use broker_x509_auth::{
    cert::{
        CaParams, CertGenerator, IssuedCert, LeafCertParams, RevokedEntry, TrustAnchorSet,
        TrustStore,
    },
    cli::{Cli, Command, OutputFormat, PkiCommand},
    config::{Config, RevocationMode},
    engine::{AuthDecision, AuthOutcome, AuthRequest, Authenticator, PresentedChain},
    revocation::RevocationChecker,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Command::Check {
            chain,
            trust_anchors,
            identity_rule,
            no_revocation,
            format,
        } => {
            run_check(
                cli.config.as_deref(),
                &chain,
                trust_anchors,
                identity_rule,
                no_revocation,
                format,
            )
            .await
        }
        Command::Anchors { path, format } => run_anchors(cli.config.as_deref(), path, format),
        Command::Pki(cmd) => run_pki(cmd),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// check
// ─────────────────────────────────────────────────────────────────────────────

async fn run_check(
    config_path: Option<&Path>,
    chain: &[PathBuf],
    trust_anchors: Option<PathBuf>,
    identity_rule: Option<String>,
    no_revocation: bool,
    format: OutputFormat,
) -> anyhow::Result<ExitCode> {
    let mut config = Config::load(config_path).context("Failed to load configuration")?;
    if let Some(path) = trust_anchors {
        config.trust_anchor_path = Some(path);
    }
    if let Some(rule) = identity_rule {
        config.identity_rule = rule.parse().context("Invalid identity rule")?;
    }
    if no_revocation {
        config.revocation.mode = RevocationMode::Disabled;
    }

    let authenticator = if config.revocation.mode == RevocationMode::Disabled {
        let trust = Arc::new(TrustStore::load(config.require_trust_anchor_path()?)?);
        Authenticator::new(trust, config.identity_rule.clone(), RevocationChecker::disabled())
            .with_limits(config.parse_limits())
            .with_policy(config.validation_policy())
    } else {
        Authenticator::from_config(&config)?
    };

    let presented = read_chain(chain)?;
    let outcome = authenticator
        .authenticate(AuthRequest {
            chain: presented,
            connection: Default::default(),
        })
        .await;

    print_outcome(&outcome, format)?;
    Ok(if outcome.decision.is_allow() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// One PEM bundle, or one DER certificate per file.
fn read_chain(files: &[PathBuf]) -> anyhow::Result<PresentedChain> {
    let mut blobs = Vec::with_capacity(files.len());
    for file in files {
        let bytes =
            std::fs::read(file).with_context(|| format!("Cannot read {}", file.display()))?;
        blobs.push(bytes);
    }

    match blobs.as_slice() {
        [single] if single.starts_with(b"-----BEGIN") => Ok(PresentedChain::Pem(single.clone())),
        _ if blobs.iter().any(|b| b.starts_with(b"-----BEGIN")) => {
            bail!("pass a single PEM bundle, or DER files only")
        }
        _ => Ok(PresentedChain::Der(blobs)),
    }
}

fn print_outcome(outcome: &AuthOutcome, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            let report = json!({
                "decision": outcome.decision,
                "trace": outcome.trace,
                "issuer": outcome.leaf_issuer,
                "elapsed_ms": outcome.elapsed.as_millis() as u64,
                "detail": outcome.error.as_ref().map(ToString::to_string),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => match &outcome.decision {
            AuthDecision::Allow(principal) => {
                println!("✅ ALLOW {}", principal.client_id());
                for (name, value) in principal.attributes() {
                    println!("   {name}: {value}");
                }
            }
            AuthDecision::Deny(reason) => {
                println!("❌ DENY {reason}");
                if let Some(error) = &outcome.error {
                    println!("   {error}");
                }
            }
        },
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// anchors
// ─────────────────────────────────────────────────────────────────────────────

fn run_anchors(
    config_path: Option<&Path>,
    path: Option<PathBuf>,
    format: OutputFormat,
) -> anyhow::Result<ExitCode> {
    let path = match path {
        Some(path) => path,
        None => Config::load(config_path)
            .context("Failed to load configuration")?
            .require_trust_anchor_path()?
            .to_path_buf(),
    };
    let anchors = TrustAnchorSet::load(&path)?;

    match format {
        OutputFormat::Json => {
            let list: Vec<_> = anchors
                .iter()
                .map(|a| {
                    json!({
                        "subject": a.subject().to_string(),
                        "serial": a.serial_hex(),
                        "not_after": a.not_after().unix_timestamp(),
                        "sha256": a.fingerprint(),
                        "self_issued": a.is_self_issued(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&list)?);
        }
        OutputFormat::Text => {
            println!("{} trust anchor(s) in {}:\n", anchors.len(), path.display());
            for anchor in anchors.iter() {
                println!("🔐 {}", anchor.subject());
                println!("   Serial: {}", anchor.serial_hex());
                println!("   Not after: {}", anchor.not_after());
                println!("   SHA-256: {}", anchor.fingerprint());
                println!();
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

// ─────────────────────────────────────────────────────────────────────────────
// pki
// ─────────────────────────────────────────────────────────────────────────────

fn run_pki(cmd: PkiCommand) -> anyhow::Result<ExitCode> {
    match cmd {
        PkiCommand::InitCa {
            out,
            cn,
            intermediate,
            days,
        } => {
            let root = CertGenerator::root(&CaParams {
                validity_days: days,
                ..CaParams::named(&cn)
            })?;
            root.write_to_dir(&out, "root")?;
            println!("✅ Root CA '{cn}' written to {}/root.{{crt,key}}", out.display());

            if let Some(name) = intermediate {
                let ca = CertGenerator::intermediate(
                    &CaParams {
                        validity_days: days,
                        ..CaParams::named(&name)
                    },
                    &root,
                )?;
                ca.write_to_dir(&out, "intermediate")?;
                println!(
                    "✅ Intermediate CA '{name}' written to {}/intermediate.{{crt,key}}",
                    out.display()
                );
            }
        }

        PkiCommand::Issue {
            ca_cert,
            ca_key,
            cn,
            ou,
            san_dns,
            san_uris,
            san_emails,
            serial,
            days,
            out,
        } => {
            let ca = load_ca(&ca_cert, &ca_key)?;
            let leaf = CertGenerator::leaf(
                &LeafCertParams {
                    ou,
                    san_dns,
                    san_uris,
                    san_emails,
                    serial,
                    validity_days: days,
                    ..LeafCertParams::named(&cn)
                },
                &ca,
            )?;
            leaf.write_to_dir(&out, &cn)?;
            println!("✅ Client certificate '{cn}' written to {}/{cn}.{{crt,key}}", out.display());
        }

        PkiCommand::Crl {
            ca_cert,
            ca_key,
            serials,
            next_update_days,
            out,
        } => {
            let ca = load_ca(&ca_cert, &ca_key)?;
            let revoked = serials
                .iter()
                .map(|s| {
                    let hex_serial = s.trim_start_matches("0x");
                    let padded = if hex_serial.len() % 2 == 1 {
                        format!("0{hex_serial}")
                    } else {
                        hex_serial.to_owned()
                    };
                    hex::decode(&padded)
                        .map(|serial| RevokedEntry {
                            serial,
                            reason: None,
                        })
                        .with_context(|| format!("Invalid serial '{s}'"))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;

            let crl = CertGenerator::crl(&ca, &revoked, next_update_days)?;
            if let Some(dir) = out.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::write(&out, crl.pem)
                .with_context(|| format!("Cannot write {}", out.display()))?;
            println!("✅ CRL revoking {} serial(s) written to {}", revoked.len(), out.display());
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn load_ca(cert: &Path, key: &Path) -> anyhow::Result<IssuedCert> {
    let cert_pem = std::fs::read_to_string(cert)
        .with_context(|| format!("Cannot read {}", cert.display()))?;
    let key_pem =
        std::fs::read_to_string(key).with_context(|| format!("Cannot read {}", key.display()))?;
    Ok(IssuedCert::from_pem(&cert_pem, &key_pem)?)
}
