//! `VeilDB` CLI tool for key management and one-shot value transforms.

#![warn(clippy::pedantic, clippy::nursery)]

use anyhow::{bail, Context as _};
use base64::Engine as _;
use clap::{Parser, Subcommand};
use rand::RngCore as _;
use std::path::PathBuf;
use veildb::client::{DataKeyOptions, EncryptOptions, EncryptionClient as _};
use veildb::client::{decode_ciphertext, encode_ciphertext};
use veildb::config::Algorithm;
use veildb_key_local::{LocalClient, MASTER_KEY_LEN, PROVIDER_NAME};

#[derive(Parser)]
#[command(name = "veildb")]
#[command(about = "VeilDB key management CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new local master key
    Keygen {
        /// Output file for the base64-encoded key
        #[arg(short, long, default_value = "./master.key")]
        output: PathBuf,
    },
    /// Encrypt a single JSON value with the local provider
    Encrypt {
        /// Master key file (as written by `keygen`)
        #[arg(short, long)]
        key: PathBuf,
        /// JSON value to encrypt, e.g. '"secret"' or '42'
        value: String,
        /// Data key alias
        #[arg(short, long, default_value = "default")]
        alias: String,
        /// Use randomized instead of deterministic encryption
        #[arg(long)]
        random: bool,
    },
    /// Decrypt a ciphertext marker produced by `encrypt`
    Decrypt {
        /// Master key file (as written by `keygen`)
        #[arg(short, long)]
        key: PathBuf,
        /// Marker JSON, e.g. '{"$cipher": "..."}'
        value: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen { output } => keygen(&output),
        Commands::Encrypt { key, value, alias, random } => encrypt(&key, &value, &alias, random),
        Commands::Decrypt { key, value } => decrypt(&key, &value),
    }
}

fn keygen(output: &PathBuf) -> anyhow::Result<()> {
    let mut key = vec![0u8; MASTER_KEY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut key);
    let encoded = base64::engine::general_purpose::STANDARD.encode(&key);
    std::fs::write(output, format!("{encoded}\n"))
        .with_context(|| format!("cannot write {}", output.display()))?;
    println!("wrote {MASTER_KEY_LEN}-byte master key to {}", output.display());
    Ok(())
}

fn client_from_key_file(path: &PathBuf) -> anyhow::Result<LocalClient> {
    let encoded = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim().as_bytes())
        .context("master key file is not base64")?;
    Ok(LocalClient::with_master_key(bytes)?)
}

fn encrypt(key: &PathBuf, value: &str, alias: &str, random: bool) -> anyhow::Result<()> {
    let client = client_from_key_file(key)?;
    client.create_data_key(
        PROVIDER_NAME,
        &DataKeyOptions { master_key: None, key_alt_names: vec![alias.to_string()] },
    )?;

    let parsed: serde_json::Value =
        serde_json::from_str(value).context("value is not valid JSON")?;
    let plaintext = serde_json::to_vec(&parsed)?;
    let algorithm = if random { Algorithm::Random } else { Algorithm::Deterministic };
    let ciphertext = client.encrypt(
        &plaintext,
        &EncryptOptions { key_alt_name: alias.to_string(), algorithm },
    )?;

    println!("{}", encode_ciphertext(&ciphertext));
    Ok(())
}

fn decrypt(key: &PathBuf, value: &str) -> anyhow::Result<()> {
    let client = client_from_key_file(key)?;
    let parsed: serde_json::Value =
        serde_json::from_str(value).context("value is not valid JSON")?;
    let Some(ciphertext) = decode_ciphertext(&parsed) else {
        bail!("value is not a ciphertext marker");
    };
    let plaintext = client.decrypt(&ciphertext)?;
    let decoded: serde_json::Value = serde_json::from_slice(&plaintext)?;
    println!("{decoded}");
    Ok(())
}
