//! Operator CLI (SPEC_FULL §11): audit chain export/verify, offline bundle
//! signing, and a thin HTTP client for the Apply API — the tooling an
//! operator needs around the gateway that isn't itself part of serving
//! traffic.

#![deny(unsafe_code)]

use std::fs;
use std::path::PathBuf;

use audit::{AuditLog, JsonlFileSink};
use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;

#[derive(Parser, Debug)]
#[command(name = "gateway-cli", about = "Gateway operator CLI")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Operate on an audit chain file.
    Audit {
        #[command(subcommand)]
        cmd: AuditCommand,
    },
    /// Sign, verify, or apply a policy bundle.
    Policy {
        #[command(subcommand)]
        cmd: PolicyCommand,
    },
}

#[derive(Subcommand, Debug)]
enum AuditCommand {
    /// Walk the hash chain and report the first broken link, if any
    /// (directly exercises invariant §8.6).
    Verify {
        #[arg(short, long)]
        path: PathBuf,
    },
    /// Export entries in `[from, to]` (epoch ms) as a JSON array.
    Export {
        #[arg(short, long)]
        path: PathBuf,
        #[arg(long, default_value_t = 0)]
        from: u64,
        #[arg(long, default_value_t = u64::MAX)]
        to: u64,
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum PolicyCommand {
    /// Generate an Ed25519 keypair for bundle signing.
    Keygen {
        #[arg(long)]
        out_priv: PathBuf,
        #[arg(long)]
        out_pub: PathBuf,
    },
    /// Sign a bundle YAML file, writing the companion `.sig` JSON (§6).
    Sign {
        #[arg(long)]
        bundle: PathBuf,
        /// Base64-encoded 32-byte Ed25519 private key (from `keygen`).
        #[arg(long)]
        key: PathBuf,
        #[arg(long)]
        out: PathBuf,
        /// Recorded in the `.sig` file for operator diagnostics.
        #[arg(long, default_value = "cli")]
        fingerprint: String,
    },
    /// Verify a bundle's signature matches its `.sig` companion.
    Verify {
        #[arg(long)]
        bundle: PathBuf,
        #[arg(long)]
        sig: PathBuf,
        /// Base64-encoded 32-byte Ed25519 public key.
        #[arg(long)]
        pubkey: String,
    },
    /// POST a bundle to a running gateway's Apply API.
    Apply {
        #[arg(long)]
        url: String,
        #[arg(long)]
        bundle: PathBuf,
        #[arg(long)]
        sig: Option<PathBuf>,
        /// `active`, `canary:<0-100>`, or `explicit:<tenant1,tenant2,...>`.
        #[arg(long, default_value = "active")]
        strategy: String,
        #[arg(long)]
        token: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match cli.cmd {
        Command::Audit { cmd } => match cmd {
            AuditCommand::Verify { path } => cmd_audit_verify(&path)?,
            AuditCommand::Export { path, from, to, out } => cmd_audit_export(&path, from, to, out.as_deref())?,
        },
        Command::Policy { cmd } => match cmd {
            PolicyCommand::Keygen { out_priv, out_pub } => cmd_policy_keygen(&out_priv, &out_pub)?,
            PolicyCommand::Sign { bundle, key, out, fingerprint } => cmd_policy_sign(&bundle, &key, &out, &fingerprint)?,
            PolicyCommand::Verify { bundle, sig, pubkey } => cmd_policy_verify(&bundle, &sig, &pubkey)?,
            PolicyCommand::Apply { url, bundle, sig, strategy, token } => {
                cmd_policy_apply(&url, &bundle, sig.as_deref(), &strategy, &token).await?
            }
        },
    }
    Ok(())
}

fn cmd_audit_verify(path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let sink = JsonlFileSink::open(path)?;
    let log = AuditLog::open(sink)?;
    match log.verify_chain() {
        Ok(()) => println!("chain OK"),
        Err(e) => {
            println!("chain broken: {e}");
            std::process::exit(1);
        }
    }
    Ok(())
}

fn cmd_audit_export(
    path: &PathBuf,
    from: u64,
    to: u64,
    out: Option<&std::path::Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let sink = JsonlFileSink::open(path)?;
    let log = AuditLog::open(sink)?;
    let entries = log.read_range(from, to)?;
    let json = serde_json::to_string_pretty(&entries)?;
    match out {
        Some(p) => {
            fs::write(p, &json)?;
            println!("wrote {} entries to {:?}", entries.len(), p);
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn cmd_policy_keygen(out_priv: &PathBuf, out_pub: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    use base64::Engine;
    let mut csprng = rand::rngs::OsRng;
    let signing_key = SigningKey::generate(&mut csprng);
    let priv_b64 = base64::engine::general_purpose::STANDARD.encode(signing_key.to_bytes());
    let pub_b64 = base64::engine::general_purpose::STANDARD.encode(signing_key.verifying_key().to_bytes());
    fs::write(out_priv, priv_b64)?;
    fs::write(out_pub, pub_b64)?;
    println!("wrote private key to {out_priv:?}, public key to {out_pub:?}");
    Ok(())
}

fn load_signing_key(path: &PathBuf) -> Result<SigningKey, Box<dyn std::error::Error>> {
    use base64::Engine;
    let raw = fs::read_to_string(path)?;
    let bytes = base64::engine::general_purpose::STANDARD.decode(raw.trim())?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| "private key must decode to 32 bytes")?;
    Ok(SigningKey::from_bytes(&bytes))
}

fn cmd_policy_sign(
    bundle: &PathBuf,
    key: &PathBuf,
    out: &PathBuf,
    fingerprint: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let yaml = fs::read(bundle)?;
    let signing_key = load_signing_key(key)?;
    let created = format!("{}", gateway_core::ids::now_ms());
    let sig = policy::sign_bundle(&yaml, &signing_key, fingerprint.to_string(), created);
    fs::write(out, serde_json::to_string_pretty(&sig)?)?;
    println!("wrote signature to {out:?}");
    Ok(())
}

fn cmd_policy_verify(bundle: &PathBuf, sig: &PathBuf, pubkey: &str) -> Result<(), Box<dyn std::error::Error>> {
    use base64::Engine;
    let yaml = fs::read(bundle)?;
    let sig_raw = fs::read_to_string(sig)?;
    let signature: policy::SignatureFile = serde_json::from_str(&sig_raw)?;
    let pub_bytes = base64::engine::general_purpose::STANDARD.decode(pubkey)?;
    let pub_bytes: [u8; 32] = pub_bytes.try_into().map_err(|_| "public key must decode to 32 bytes")?;
    let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&pub_bytes)?;
    match policy::PolicyBundle::load(&yaml, Some(&signature), Some(&verifying_key), true) {
        Ok(_) => println!("signature OK"),
        Err(e) => {
            println!("signature invalid: {e}");
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn cmd_policy_apply(
    url: &str,
    bundle: &PathBuf,
    sig: Option<&std::path::Path>,
    strategy: &str,
    token: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let yaml = fs::read_to_string(bundle)?;
    let signature = match sig {
        Some(p) => Some(serde_json::from_str::<policy::SignatureFile>(&fs::read_to_string(p)?)?),
        None => None,
    };
    let strategy_body = parse_strategy(strategy)?;
    let body = serde_json::json!({"yaml": yaml, "signature": signature, "strategy": strategy_body});
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{url}/v1/policy/apply"))
        .bearer_auth(token)
        .json(&body)
        .send()
        .await?;
    let status = resp.status();
    let text = resp.text().await?;
    println!("{status}: {text}");
    if !status.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn parse_strategy(strategy: &str) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    if strategy == "active" {
        return Ok(serde_json::json!({"kind": "active"}));
    }
    if let Some(percent) = strategy.strip_prefix("canary:") {
        let percent: u8 = percent.parse()?;
        return Ok(serde_json::json!({"kind": "canary", "percent": percent}));
    }
    if let Some(tenants) = strategy.strip_prefix("explicit:") {
        let tenants: Vec<&str> = tenants.split(',').filter(|s| !s.is_empty()).collect();
        return Ok(serde_json::json!({"kind": "explicit", "tenants": tenants}));
    }
    Err(format!("unrecognized strategy '{strategy}', expected active|canary:<N>|explicit:<a,b>").into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chain(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("audit.jsonl");
        let sink = JsonlFileSink::open(&path).unwrap();
        let log = AuditLog::open(sink).unwrap();
        log.append(audit::NewAuditEntry::new("acme", "agent-1", "net.http", audit::AuditEvent::Allow), 1).unwrap();
        log.append(audit::NewAuditEntry::new("acme", "agent-1", "fs.write", audit::AuditEvent::Deny), 2).unwrap();
        path
    }

    #[test]
    fn verify_reports_ok_on_intact_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_chain(dir.path());
        cmd_audit_verify(&path).unwrap();
    }

    #[test]
    fn export_filters_by_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_chain(dir.path());
        let sink = JsonlFileSink::open(&path).unwrap();
        let log = AuditLog::open(sink).unwrap();
        let entries = log.read_range(2, 2).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tool, "fs.write");
    }

    #[test]
    fn keygen_then_sign_then_verify_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let priv_path = dir.path().join("key.priv");
        let pub_path = dir.path().join("key.pub");
        cmd_policy_keygen(&priv_path, &pub_path).unwrap();

        let bundle_path = dir.path().join("bundle.yaml");
        std::fs::write(
            &bundle_path,
            "version: v1\ndefaults:\n  decision: deny\nrules: []\n",
        )
        .unwrap();
        let sig_path = dir.path().join("bundle.sig");
        cmd_policy_sign(&bundle_path, &priv_path, &sig_path, "test-key").unwrap();

        let pubkey = std::fs::read_to_string(&pub_path).unwrap();
        cmd_policy_verify(&bundle_path, &sig_path, pubkey.trim()).unwrap();
    }

    #[test]
    fn parse_strategy_variants() {
        assert_eq!(parse_strategy("active").unwrap()["kind"], "active");
        assert_eq!(parse_strategy("canary:25").unwrap()["percent"], 25);
        assert_eq!(parse_strategy("explicit:a,b").unwrap()["tenants"][1], "b");
        assert!(parse_strategy("bogus").is_err());
    }
}
