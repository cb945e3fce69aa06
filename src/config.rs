use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use nostr::nips::nip19::{FromBech32, ToBech32};
use nostr::{Keys, PublicKey, SecretKey};
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(name = "eggbot", version, about)]
/// Nostr bot that sells eggs for sats over encrypted DMs and zaps.
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Start the bot: connect to relays, listen for DM commands and zaps
    Run {
        /// Path to the TOML config file
        #[arg(short, long, default_value = "eggbot.toml")]
        config: PathBuf,
    },
    /// Print version information
    Version,
}

/// On-disk configuration. Every key has a default so an empty (or
/// absent) file yields a working single-relay setup.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    pub verbose: bool,
    pub database: DatabaseConfig,
    pub nostr: NostrConfig,
    pub lightning: LightningConfig,
    pub pricing: PricingConfig,
    pub admins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: "eggbot.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NostrConfig {
    pub relays: Vec<String>,
    /// Expected bot pubkey; must match the key derived from EGGBOT_NSEC.
    pub bot_npub: String,
}

impl Default for NostrConfig {
    fn default() -> Self {
        NostrConfig {
            relays: vec!["wss://relay.damus.io".to_string()],
            bot_npub: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LightningConfig {
    /// Zap receipts must be signed by this npub. Empty accepts any signer.
    pub lnurl_npub: String,
    /// Lightning address used to fetch bolt11 invoices for order replies.
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub sats_per_half_dozen: i64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        PricingConfig {
            sats_per_half_dozen: 3200,
        }
    }
}

/// Runtime configuration: the file contents plus the keypair derived
/// from the EGGBOT_NSEC environment variable.
#[derive(Debug, Clone)]
pub struct Config {
    pub file: FileConfig,
    pub keys: Keys,
    pub bot_npub: String,
    pub lnurl_pubkey: Option<PublicKey>,
}

impl Config {
    /// Loads the config file (missing file means all defaults) and the
    /// secret key from the environment, and cross-checks them.
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let file = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            FileConfig::default()
        };

        let nsec = std::env::var("EGGBOT_NSEC")
            .map_err(|_| anyhow!("EGGBOT_NSEC environment variable is required"))?;
        Config::from_file_and_nsec(file, &nsec)
    }

    fn from_file_and_nsec(file: FileConfig, nsec: &str) -> anyhow::Result<Config> {
        let secret_key =
            SecretKey::from_bech32(nsec).context("EGGBOT_NSEC must be a valid nsec")?;
        let keys = Keys::new(secret_key);
        let derived_npub = keys.public_key().to_bech32()?;

        if !file.nostr.bot_npub.is_empty() {
            let configured = PublicKey::from_bech32(&file.nostr.bot_npub)
                .context("invalid nostr.bot_npub in config")?;
            if configured != keys.public_key() {
                bail!("EGGBOT_NSEC does not match nostr.bot_npub in config");
            }
        }

        let lnurl_pubkey = if file.lightning.lnurl_npub.is_empty() {
            None
        } else {
            Some(
                PublicKey::from_bech32(&file.lightning.lnurl_npub)
                    .context("invalid lightning.lnurl_npub in config")?,
            )
        };

        Ok(Config {
            file,
            keys,
            bot_npub: derived_npub,
            lnurl_pubkey,
        })
    }

    pub fn lightning_address(&self) -> Option<String> {
        let addr = self.file.lightning.address.trim();
        if addr.is_empty() {
            None
        } else {
            Some(addr.to_string())
        }
    }
}
