#![allow(dead_code)]

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;

const DEFAULT_BLOCK_STEP: u64 = 10_000;
const DEFAULT_MSG_EXPIRY_SECS: u64 = 60;
const DEFAULT_HTTP_PORT: u16 = 8000;
const DEFAULT_METRICS_PORT: u16 = 4242;

/// Broker run mode; test-only RPC endpoints refuse outside `Test`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Production,
    Test,
}

/// Main configuration for the broker
#[derive(Clone)]
pub struct Config {
    pub broker_private_key: String,
    pub database_url: String,
    pub http_port: u16,
    pub metrics_port: u16,
    pub msg_expiry: Duration,
    pub mode: Mode,
    pub blockchains: Vec<BlockchainConfig>,
    pub assets: Vec<TokenConfig>,
}

/// Custom Debug that redacts secrets (key material, database credentials).
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("broker_private_key", &"<redacted>")
            .field("database_url", &"<redacted>")
            .field("http_port", &self.http_port)
            .field("metrics_port", &self.metrics_port)
            .field("msg_expiry", &self.msg_expiry)
            .field("mode", &self.mode)
            .field("blockchains", &self.blockchains)
            .field("assets", &self.assets)
            .finish()
    }
}

/// One enabled chain with resolved RPC endpoint and contract addresses.
#[derive(Debug, Clone)]
pub struct BlockchainConfig {
    pub name: String,
    pub id: u32,
    pub rpc_url: String,
    pub block_step: u64,
    pub custody_address: String,
    pub adjudicator_address: String,
    pub balance_checker_address: String,
}

/// One enabled token, flattened from the asset/token hierarchy.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub symbol: String,
    pub chain_id: u32,
    pub address: String,
    pub decimals: u8,
}

// ============ YAML file shapes ============

#[derive(Debug, Deserialize)]
struct BlockchainsFile {
    default_contract_addresses: ContractAddresses,
    blockchains: Vec<BlockchainEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct ContractAddresses {
    custody: String,
    adjudicator: String,
    balance_checker: String,
}

#[derive(Debug, Deserialize)]
struct PartialContractAddresses {
    custody: Option<String>,
    adjudicator: Option<String>,
    balance_checker: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlockchainEntry {
    name: String,
    id: u32,
    #[serde(default)]
    disabled: bool,
    block_step: Option<u64>,
    contract_addresses: Option<PartialContractAddresses>,
}

#[derive(Debug, Deserialize)]
struct AssetsFile {
    assets: Vec<AssetEntry>,
}

#[derive(Debug, Deserialize)]
struct AssetEntry {
    name: Option<String>,
    symbol: String,
    #[serde(default)]
    disabled: bool,
    tokens: Vec<TokenEntry>,
}

#[derive(Debug, Deserialize)]
struct TokenEntry {
    name: Option<String>,
    symbol: Option<String>,
    blockchain_id: u32,
    #[serde(default)]
    disabled: bool,
    address: String,
    decimals: u8,
}

impl Config {
    /// Load configuration from the environment and the YAML config dir.
    /// Loads .env first when present.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let broker_private_key = env::var("BROKER_PRIVATE_KEY")
            .map_err(|_| eyre!("BROKER_PRIVATE_KEY environment variable is required"))?;
        let database_url = env::var("CLEARNODE_DATABASE_URL")
            .map_err(|_| eyre!("CLEARNODE_DATABASE_URL environment variable is required"))?;

        let config_dir: PathBuf = env::var("CLEARNODE_CONFIG_DIR_PATH")
            .unwrap_or_else(|_| "config".to_string())
            .into();

        let http_port = env::var("HTTP_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_HTTP_PORT);
        let metrics_port = env::var("METRICS_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_METRICS_PORT);
        let msg_expiry = Duration::from_secs(
            env::var("MSG_EXPIRY_TIME")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MSG_EXPIRY_SECS),
        );

        let mode = match env::var("CLEARNODE_MODE").as_deref() {
            Ok("test") => Mode::Test,
            Ok("production") | Err(_) => Mode::Production,
            Ok(other) => return Err(eyre!("CLEARNODE_MODE must be production or test, got {other:?}")),
        };

        let blockchains = load_blockchains(&config_dir.join("blockchains.yaml"))?;
        let assets = load_assets(&config_dir.join("assets.yaml"))?;

        let config = Config {
            broker_private_key,
            database_url,
            http_port,
            metrics_port,
            msg_expiry,
            mode,
            blockchains,
            assets,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn blockchain(&self, chain_id: u32) -> Option<&BlockchainConfig> {
        self.blockchains.iter().find(|b| b.id == chain_id)
    }

    fn validate(&self) -> Result<()> {
        if self.broker_private_key.trim_start_matches("0x").len() != 64 {
            return Err(eyre!("BROKER_PRIVATE_KEY must be 32 hex bytes"));
        }
        if self.database_url.is_empty() {
            return Err(eyre!("CLEARNODE_DATABASE_URL cannot be empty"));
        }
        let mut seen = HashMap::new();
        for chain in &self.blockchains {
            if let Some(prior) = seen.insert(chain.id, &chain.name) {
                return Err(eyre!(
                    "blockchain id {} configured twice ({} and {})",
                    chain.id,
                    prior,
                    chain.name
                ));
            }
        }
        for token in &self.assets {
            if self.blockchain(token.chain_id).is_none() {
                return Err(eyre!(
                    "asset {} references unknown blockchain id {}",
                    token.symbol,
                    token.chain_id
                ));
            }
        }
        Ok(())
    }
}

fn load_blockchains(path: &Path) -> Result<Vec<BlockchainConfig>> {
    let raw = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
    let file: BlockchainsFile = serde_yaml::from_str(&raw)
        .wrap_err_with(|| format!("Failed to parse {}", path.display()))?;
    resolve_blockchains(file, |name| {
        let var = format!("{}_BLOCKCHAIN_RPC", name.to_uppercase());
        env::var(&var).map_err(|_| eyre!("{var} environment variable is required"))
    })
}

fn resolve_blockchains(
    file: BlockchainsFile,
    rpc_lookup: impl Fn(&str) -> Result<String>,
) -> Result<Vec<BlockchainConfig>> {
    let defaults = file.default_contract_addresses;
    validate_address(&defaults.custody, "default custody address")?;
    validate_address(&defaults.adjudicator, "default adjudicator address")?;
    validate_address(&defaults.balance_checker, "default balance checker address")?;

    let mut out = Vec::new();
    for entry in file.blockchains {
        if !valid_chain_name(&entry.name) {
            return Err(eyre!(
                "blockchain name {:?} must match ^[a-z][a-z_]+[a-z]$",
                entry.name
            ));
        }
        if entry.disabled {
            continue;
        }

        let overrides = entry.contract_addresses;
        let custody = overrides
            .as_ref()
            .and_then(|o| o.custody.clone())
            .unwrap_or_else(|| defaults.custody.clone());
        let adjudicator = overrides
            .as_ref()
            .and_then(|o| o.adjudicator.clone())
            .unwrap_or_else(|| defaults.adjudicator.clone());
        let balance_checker = overrides
            .as_ref()
            .and_then(|o| o.balance_checker.clone())
            .unwrap_or_else(|| defaults.balance_checker.clone());
        validate_address(&custody, &format!("{} custody address", entry.name))?;
        validate_address(&adjudicator, &format!("{} adjudicator address", entry.name))?;
        validate_address(&balance_checker, &format!("{} balance checker address", entry.name))?;

        out.push(BlockchainConfig {
            rpc_url: rpc_lookup(&entry.name)?,
            name: entry.name,
            id: entry.id,
            block_step: entry.block_step.unwrap_or(DEFAULT_BLOCK_STEP),
            custody_address: custody,
            adjudicator_address: adjudicator,
            balance_checker_address: balance_checker,
        });
    }
    Ok(out)
}

fn load_assets(path: &Path) -> Result<Vec<TokenConfig>> {
    let raw = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
    let file: AssetsFile = serde_yaml::from_str(&raw)
        .wrap_err_with(|| format!("Failed to parse {}", path.display()))?;
    resolve_assets(file)
}

fn resolve_assets(file: AssetsFile) -> Result<Vec<TokenConfig>> {
    let mut out = Vec::new();
    for asset in file.assets {
        if asset.disabled {
            continue;
        }
        for token in asset.tokens {
            if token.disabled {
                continue;
            }
            validate_address(&token.address, "token address")?;
            // Token fields inherit from the parent asset.
            let symbol = token.symbol.unwrap_or_else(|| asset.symbol.clone());
            out.push(TokenConfig {
                symbol,
                chain_id: token.blockchain_id,
                address: token.address,
                decimals: token.decimals,
            });
        }
    }
    Ok(out)
}

/// Names must match ^[a-z][a-z_]+[a-z]$.
fn valid_chain_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.len() < 3 {
        return false;
    }
    if !bytes[0].is_ascii_lowercase() || !bytes[bytes.len() - 1].is_ascii_lowercase() {
        return false;
    }
    bytes[1..bytes.len() - 1]
        .iter()
        .all(|b| b.is_ascii_lowercase() || *b == b'_')
}

fn validate_address(address: &str, what: &str) -> Result<()> {
    let ok = address.len() == 42
        && address.starts_with("0x")
        && address[2..].bytes().all(|b| b.is_ascii_hexdigit());
    if ok {
        Ok(())
    } else {
        Err(eyre!("{what} must match ^0x[0-9a-fA-F]{{40}}$, got {address:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_chain_name() {
        assert!(valid_chain_name("polygon"));
        assert!(valid_chain_name("base_sepolia"));
        assert!(!valid_chain_name("po"));
        assert!(!valid_chain_name("Polygon"));
        assert!(!valid_chain_name("polygon_"));
        assert!(!valid_chain_name("_polygon"));
        assert!(!valid_chain_name("poly-gon"));
    }

    #[test]
    fn test_validate_address() {
        assert!(validate_address("0x5FbDB2315678afecb367f032d93F642f64180aa3", "t").is_ok());
        assert!(validate_address("5FbDB2315678afecb367f032d93F642f64180aa3", "t").is_err());
        assert!(validate_address("0x5FbD", "t").is_err());
        assert!(validate_address("0xZZbDB2315678afecb367f032d93F642f64180aa3", "t").is_err());
    }

    #[test]
    fn test_resolve_blockchains_defaults_and_overrides() {
        let yaml = r#"
default_contract_addresses:
  custody: "0x5FbDB2315678afecb367f032d93F642f64180aa3"
  adjudicator: "0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512"
  balance_checker: "0x9fE46736679d2D9a65F0992F2272dE9f3c7fa6e0"
blockchains:
  - name: polygon
    id: 137
  - name: celo
    id: 42220
    disabled: true
  - name: base
    id: 8453
    block_step: 5000
    contract_addresses:
      custody: "0xCf7Ed3AccA5a467e9e704C703E8D87F634fB0Fc9"
"#;
        let file: BlockchainsFile = serde_yaml::from_str(yaml).unwrap();
        let chains =
            resolve_blockchains(file, |name| Ok(format!("http://{name}.rpc.local"))).unwrap();
        assert_eq!(chains.len(), 2);

        let polygon = &chains[0];
        assert_eq!(polygon.id, 137);
        assert_eq!(polygon.block_step, DEFAULT_BLOCK_STEP);
        assert_eq!(
            polygon.custody_address,
            "0x5FbDB2315678afecb367f032d93F642f64180aa3"
        );
        assert_eq!(polygon.rpc_url, "http://polygon.rpc.local");

        let base = &chains[1];
        assert_eq!(base.block_step, 5000);
        assert_eq!(
            base.custody_address,
            "0xCf7Ed3AccA5a467e9e704C703E8D87F634fB0Fc9"
        );
        // Unoverridden fields fall back to the defaults.
        assert_eq!(
            base.adjudicator_address,
            "0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512"
        );
    }

    #[test]
    fn test_resolve_assets_inheritance() {
        let yaml = r#"
assets:
  - name: USD Coin
    symbol: usdc
    tokens:
      - blockchain_id: 137
        address: "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174"
        decimals: 6
      - blockchain_id: 8453
        symbol: usdbc
        address: "0xd9aAEc86B65D86f6A7B5B1b0c42FFA531710b6CA"
        decimals: 6
  - symbol: weth
    disabled: true
    tokens:
      - blockchain_id: 137
        address: "0x7ceB23fD6bC0adD59E62ac25578270cFf1b9f619"
        decimals: 18
"#;
        let file: AssetsFile = serde_yaml::from_str(yaml).unwrap();
        let tokens = resolve_assets(file).unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].symbol, "usdc");
        assert_eq!(tokens[1].symbol, "usdbc");
        assert_eq!(tokens[0].decimals, 6);
    }
}
