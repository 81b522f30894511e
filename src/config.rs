use std::env;

/// Process-wide, immutable-after-boot configuration. Populated once by
/// `from_env` and shared behind an `Arc` by every subsystem.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    // Source chain
    pub source_network_name: String,
    pub source_utxorpc_url: String,
    pub source_utxorpc_api_key: String,
    pub source_deposit_addresses: Vec<String>,

    // Destination chain
    pub dest_network_name: String,
    pub dest_utxorpc_url: String,
    pub dest_utxorpc_api_key: String,
    pub dest_lucid_provider: String,
    pub dest_lucid_network: String,
    pub dest_sender_addresses: Vec<String>,
    pub dest_sender_wallet_seed: String,

    // Bridge economics
    pub allowed_assets: Vec<String>,
    pub min_deposit_amount: u64,
    pub max_transfer_amount: u64,
    pub fee_amount: u64,

    // Retry / confirmation tuning
    pub required_confirmations: u32,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,

    // Ambient HTTP surface
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,

    // Durable store location (ambient: not named by the external config
    // surface contract, needed to point the SQLite backend at a file)
    pub store_path: String,
}

const DEFAULT_ALLOWED_ASSETS: &str = "ADA";
const MINIMUM_DESTINATION_OUTPUT: u64 = 1_000_000;

impl BridgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let source_network_name = require_env("SOURCE_NETWORK_NAME")?;
        let source_utxorpc_url = require_env("SOURCE_UTXORPC_URL")?;
        validate_endpoint(&source_utxorpc_url, "SOURCE_UTXORPC_URL")?;
        let source_utxorpc_api_key = require_env("SOURCE_UTXORPC_API_KEY")?;
        let source_deposit_addresses = require_csv("SOURCE_DEPOSIT_ADDRESSES")?;

        let dest_network_name = require_env("DEST_NETWORK_NAME")?;
        let dest_utxorpc_url = require_env("DEST_UTXORPC_URL")?;
        validate_endpoint(&dest_utxorpc_url, "DEST_UTXORPC_URL")?;
        reject_duplicate_ports(&source_utxorpc_url, &dest_utxorpc_url)?;
        let dest_utxorpc_api_key = require_env("DEST_UTXORPC_API_KEY")?;
        let dest_lucid_provider = require_env("DEST_LUCID_PROVIDER")?;
        let dest_lucid_network = require_env("DEST_LUCID_NETWORK")?;
        let dest_sender_addresses = require_csv("DEST_SENDER_ADDRESSES")?;
        let dest_sender_wallet_seed = require_env("DEST_SENDER_WALLET_SEED")?;

        let allowed_assets = env::var("BRIDGE_ALLOWED_ASSETS")
            .unwrap_or_else(|_| DEFAULT_ALLOWED_ASSETS.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        let min_deposit_amount: u64 = parse_env_or("BRIDGE_MIN_DEPOSIT_AMOUNT", 2_000_000)?;
        let max_transfer_amount: u64 =
            parse_env_or("BRIDGE_MAX_TRANSFER_AMOUNT", 100_000_000_000)?;
        let fee_amount: u64 = parse_env_or("BRIDGE_FEE_AMOUNT", 1_000_000)?;

        if fee_amount >= min_deposit_amount {
            return Err(ConfigError::Invalid(
                "BRIDGE_FEE_AMOUNT".into(),
                "must be less than BRIDGE_MIN_DEPOSIT_AMOUNT".into(),
            ));
        }
        if min_deposit_amount >= max_transfer_amount {
            return Err(ConfigError::Invalid(
                "BRIDGE_MIN_DEPOSIT_AMOUNT".into(),
                "must be less than BRIDGE_MAX_TRANSFER_AMOUNT".into(),
            ));
        }

        let required_confirmations: u32 = parse_env_or("SECURITY_REQUIRED_CONFIRMATIONS", 5)?;
        let retry_attempts: u32 = parse_env_or("SECURITY_RETRY_ATTEMPTS", 3)?;
        if retry_attempts == 0 {
            return Err(ConfigError::Invalid(
                "SECURITY_RETRY_ATTEMPTS".into(),
                "must be > 0".into(),
            ));
        }
        let retry_delay_ms: u64 = parse_env_or("SECURITY_RETRY_DELAY_MS", 30_000)?;

        let allowed_origins = env::var("BRIDGE_ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        Ok(Self {
            source_network_name,
            source_utxorpc_url,
            source_utxorpc_api_key,
            source_deposit_addresses,
            dest_network_name,
            dest_utxorpc_url,
            dest_utxorpc_api_key,
            dest_lucid_provider,
            dest_lucid_network,
            dest_sender_addresses,
            dest_sender_wallet_seed,
            allowed_assets,
            min_deposit_amount,
            max_transfer_amount,
            fee_amount,
            required_confirmations,
            retry_attempts,
            retry_delay_ms,
            host: env::var("BRIDGE_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("BRIDGE_PORT")
                .unwrap_or_else(|_| "3080".into())
                .parse()
                .map_err(|_| {
                    ConfigError::Invalid("BRIDGE_PORT".into(), "must be a valid port number".into())
                })?,
            allowed_origins,
            store_path: env::var("BRIDGE_STORE_PATH")
                .unwrap_or_else(|_| "bridge_relay.sqlite3".into()),
        })
    }

    pub fn is_asset_allowed(&self, asset: &str) -> bool {
        self.allowed_assets.iter().any(|a| a == asset)
    }

    pub fn minimum_destination_output(&self) -> u64 {
        MINIMUM_DESTINATION_OUTPUT
    }
}

fn require_env(name: &str) -> Result<String, ConfigError> {
    env::var(name)
        .map_err(|_| ConfigError::Missing(name.into()))
        .and_then(|v| {
            if v.is_empty() {
                Err(ConfigError::Missing(name.into()))
            } else {
                Ok(v)
            }
        })
}

fn require_csv(name: &str) -> Result<Vec<String>, ConfigError> {
    let raw = require_env(name)?;
    let values: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if values.is_empty() {
        return Err(ConfigError::Missing(format!("{name} (no valid entries found)")));
    }
    Ok(values)
}

fn parse_env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .map_err(|_| ConfigError::Invalid(name.into(), format!("could not parse '{v}'"))),
        _ => Ok(default),
    }
}

/// Boot validation rejects a source/destination pair that would dial the
/// same `host:port`, which almost always means a copy-pasted env var
/// pointing both adapters at one gRPC endpoint.
fn reject_duplicate_ports(source_url: &str, dest_url: &str) -> Result<(), ConfigError> {
    let source_authority = endpoint_authority(source_url);
    let dest_authority = endpoint_authority(dest_url);
    if source_authority == dest_authority {
        return Err(ConfigError::Invalid(
            "DEST_UTXORPC_URL".into(),
            format!(
                "must not use the same host:port as SOURCE_UTXORPC_URL ({source_authority})"
            ),
        ));
    }
    Ok(())
}

/// Extracts `host:port` from a `scheme://host[:port][/path]` URL,
/// filling in the scheme's default port when none is given explicitly.
fn endpoint_authority(url: &str) -> String {
    let lower = url.to_lowercase();
    let (scheme, rest) = match lower.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("", lower.as_str()),
    };
    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.rsplit_once(':').is_some_and(|(_, port)| port.chars().all(|c| c.is_ascii_digit())) {
        authority.to_string()
    } else {
        let default_port = if scheme == "https" { 443 } else { 80 };
        format!("{authority}:{default_port}")
    }
}

fn validate_endpoint(url: &str, name: &str) -> Result<(), ConfigError> {
    let lower = url.to_lowercase();
    if lower.starts_with("https://") {
        return Ok(());
    }
    if lower.starts_with("http://") {
        let host_part = lower.trim_start_matches("http://");
        if host_part.starts_with("localhost")
            || host_part.starts_with("127.0.0.1")
            || host_part.starts_with("[::1]")
        {
            return Ok(());
        }
        return Err(ConfigError::Invalid(
            name.into(),
            "must use HTTPS for non-localhost endpoints".into(),
        ));
    }
    Err(ConfigError::Invalid(
        name.into(),
        "must start with http:// or https://".into(),
    ))
}

#[derive(Debug)]
pub enum ConfigError {
    Missing(String),
    Invalid(String, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(name) => write!(f, "missing required env var: {name}"),
            ConfigError::Invalid(name, reason) => {
                write!(f, "invalid env var {name}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_minimal_env() {
        env::set_var("SOURCE_NETWORK_NAME", "cardano-preview");
        env::set_var("SOURCE_UTXORPC_URL", "https://source.example.com");
        env::set_var("SOURCE_UTXORPC_API_KEY", "source-key");
        env::set_var("SOURCE_DEPOSIT_ADDRESSES", "addr_test1watched");
        env::set_var("DEST_NETWORK_NAME", "cardano-preview");
        env::set_var("DEST_UTXORPC_URL", "https://dest.example.com");
        env::set_var("DEST_UTXORPC_API_KEY", "dest-key");
        env::set_var("DEST_LUCID_PROVIDER", "blockfrost");
        env::set_var("DEST_LUCID_NETWORK", "Preview");
        env::set_var("DEST_SENDER_ADDRESSES", "addr_test1sender");
        env::set_var("DEST_SENDER_WALLET_SEED", "test seed phrase");
    }

    #[test]
    fn loads_with_defaults_when_minimal_env_present() {
        set_minimal_env();
        let config = BridgeConfig::from_env().expect("config should load");
        assert_eq!(config.allowed_assets, vec!["ADA".to_string()]);
        assert_eq!(config.fee_amount, 1_000_000);
        assert!(config.fee_amount < config.min_deposit_amount);
        assert!(config.min_deposit_amount < config.max_transfer_amount);
    }

    #[test]
    fn rejects_fee_greater_or_equal_to_min() {
        set_minimal_env();
        env::set_var("BRIDGE_MIN_DEPOSIT_AMOUNT", "1000");
        env::set_var("BRIDGE_FEE_AMOUNT", "1000");
        let result = BridgeConfig::from_env();
        env::remove_var("BRIDGE_MIN_DEPOSIT_AMOUNT");
        env::remove_var("BRIDGE_FEE_AMOUNT");
        assert!(matches!(result, Err(ConfigError::Invalid(_, _))));
    }

    #[test]
    fn rejects_non_https_endpoint() {
        set_minimal_env();
        env::set_var("SOURCE_UTXORPC_URL", "ftp://source.example.com");
        let result = BridgeConfig::from_env();
        env::set_var("SOURCE_UTXORPC_URL", "https://source.example.com");
        assert!(matches!(result, Err(ConfigError::Invalid(_, _))));
    }

    #[test]
    fn rejects_duplicate_grpc_ports() {
        set_minimal_env();
        env::set_var("DEST_UTXORPC_URL", "https://source.example.com");
        let result = BridgeConfig::from_env();
        env::set_var("DEST_UTXORPC_URL", "https://dest.example.com");
        assert!(matches!(result, Err(ConfigError::Invalid(_, _))));
    }

    #[test]
    fn allows_same_host_on_different_ports() {
        set_minimal_env();
        env::set_var("SOURCE_UTXORPC_URL", "https://shared.example.com:50051");
        env::set_var("DEST_UTXORPC_URL", "https://shared.example.com:50052");
        let result = BridgeConfig::from_env();
        env::set_var("SOURCE_UTXORPC_URL", "https://source.example.com");
        env::set_var("DEST_UTXORPC_URL", "https://dest.example.com");
        assert!(result.is_ok());
    }

    #[test]
    fn rejects_empty_deposit_address_list() {
        set_minimal_env();
        env::set_var("SOURCE_DEPOSIT_ADDRESSES", "  ,  ,");
        let result = BridgeConfig::from_env();
        env::set_var("SOURCE_DEPOSIT_ADDRESSES", "addr_test1watched");
        assert!(matches!(result, Err(ConfigError::Missing(_))));
    }
}
