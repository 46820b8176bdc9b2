use crate::error::{Result, UserOpError};
use crate::owner::load_owner;
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use std::{fmt, fs, io::Write, path::Path};

pub const DEFAULT_ENTRY_POINT: &str = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789";
pub const DEFAULT_FACTORY: &str = "0x9406Cc6185a346906296840746125a0E44976454";
pub const DEFAULT_PAYMASTER_CONTEXT: &str = "payg";
const DEFAULT_POLL_INTERVAL_MS: u64 = 1500;
const DEFAULT_RECEIPT_TIMEOUT_SECS: u64 = 180;

/// One layer of settings: the JSON file, or the command line on top of it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundler_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_context: Option<String>,
    #[serde(
        default,
        alias = "entryPointAddress",
        skip_serializing_if = "Option::is_none"
    )]
    pub entry_point: Option<String>,
    #[serde(
        default,
        alias = "factoryAddress",
        skip_serializing_if = "Option::is_none"
    )]
    pub factory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_poll_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_timeout_secs: Option<u64>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| UserOpError::Config(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| UserOpError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Values set in `over` win.
    pub fn merge(self, over: ConfigFile) -> ConfigFile {
        ConfigFile {
            signing_key: over.signing_key.or(self.signing_key),
            rpc_url: over.rpc_url.or(self.rpc_url),
            bundler_url: over.bundler_url.or(self.bundler_url),
            paymaster_url: over.paymaster_url.or(self.paymaster_url),
            paymaster_context: over.paymaster_context.or(self.paymaster_context),
            entry_point: over.entry_point.or(self.entry_point),
            factory: over.factory.or(self.factory),
            salt: over.salt.or(self.salt),
            receipt_poll_interval_ms: over
                .receipt_poll_interval_ms
                .or(self.receipt_poll_interval_ms),
            receipt_timeout_secs: over.receipt_timeout_secs.or(self.receipt_timeout_secs),
        }
    }
}

/// Validated settings handed to the builder and the submitter.
#[derive(Clone)]
pub struct Config {
    pub signing_key: String,
    pub rpc_url: String,
    pub bundler_url: String,
    /// `None` disables sponsorship.
    pub paymaster_url: Option<String>,
    pub paymaster_context: String,
    pub entry_point: Address,
    pub factory: Address,
    pub salt: U256,
    pub receipt_poll_interval: Duration,
    pub receipt_timeout: Duration,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("signing_key", &"<redacted>")
            .field("rpc_url", &self.rpc_url)
            .field("bundler_url", &self.bundler_url)
            .field("paymaster_url", &self.paymaster_url)
            .field("paymaster_context", &self.paymaster_context)
            .field("entry_point", &self.entry_point)
            .field("factory", &self.factory)
            .field("salt", &self.salt)
            .field("receipt_poll_interval", &self.receipt_poll_interval)
            .field("receipt_timeout", &self.receipt_timeout)
            .finish()
    }
}

impl TryFrom<ConfigFile> for Config {
    type Error = UserOpError;

    fn try_from(raw: ConfigFile) -> Result<Self> {
        let signing_key = raw
            .signing_key
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| UserOpError::Config("missing signing key (AA_SIGNING_KEY)".into()))?;
        // Fail early on a bad key rather than at signing time.
        load_owner(&signing_key, 1)?;

        let rpc_url = non_empty(raw.rpc_url)
            .ok_or_else(|| UserOpError::Config("missing rpc url (AA_RPC_URL)".into()))?;
        let bundler_url = non_empty(raw.bundler_url).unwrap_or_else(|| rpc_url.clone());
        let paymaster_url = non_empty(raw.paymaster_url);
        for url in [Some(&rpc_url), Some(&bundler_url), paymaster_url.as_ref()]
            .into_iter()
            .flatten()
        {
            warn_if_keyed(url);
        }

        let entry_point = parse_address(
            "entryPoint",
            raw.entry_point.as_deref().unwrap_or(DEFAULT_ENTRY_POINT),
        )?;
        let factory = parse_address("factory", raw.factory.as_deref().unwrap_or(DEFAULT_FACTORY))?;

        let receipt_poll_interval = Duration::from_millis(
            raw.receipt_poll_interval_ms
                .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        );
        if receipt_poll_interval.is_zero() {
            return Err(UserOpError::Config(
                "receiptPollIntervalMs must be positive".into(),
            ));
        }

        Ok(Config {
            signing_key,
            rpc_url,
            bundler_url,
            paymaster_url,
            paymaster_context: non_empty(raw.paymaster_context)
                .unwrap_or_else(|| DEFAULT_PAYMASTER_CONTEXT.to_string()),
            entry_point,
            factory,
            salt: U256::from(raw.salt.unwrap_or(0)),
            receipt_poll_interval,
            receipt_timeout: Duration::from_secs(
                raw.receipt_timeout_secs
                    .unwrap_or(DEFAULT_RECEIPT_TIMEOUT_SECS),
            ),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_address(field: &str, s: &str) -> Result<Address> {
    s.trim()
        .parse::<Address>()
        .map_err(|e| UserOpError::Config(format!("invalid {field} address {s}: {e}")))
}

fn warn_if_keyed(url: &str) {
    if looks_like_api_key(url) {
        tracing::warn!("an endpoint URL appears to embed an API key; keep config files private");
    }
}

/// Heuristic: a query parameter named like a key, or a long opaque path segment.
fn looks_like_api_key(url: &str) -> bool {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let (path, query) = rest.split_once('?').unwrap_or((rest, ""));

    let keyed_query = query.split('&').any(|pair| {
        let name = pair.split('=').next().unwrap_or("").to_ascii_lowercase();
        name.contains("key") || name.contains("token")
    });
    let opaque_segment = path.split('/').skip(1).any(|segment| {
        segment.len() >= 20 && segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    });
    keyed_query || opaque_segment
}

/// Write a fresh config file holding `contents`. Unix permissions are set to 0600.
pub fn write_config_file(path: &Path, contents: &ConfigFile, force: bool) -> Result<()> {
    let io_err = |e: std::io::Error| UserOpError::Config(format!("{}: {e}", path.display()));

    if path.exists() && !force {
        return Err(UserOpError::Config(format!(
            "{} already exists; pass --force to overwrite",
            path.display()
        )));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let json = serde_json::to_string_pretty(contents)
        .map_err(|e| UserOpError::Config(format!("serializing config: {e}")))?;
    let mut file = fs::File::create(path).map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(io_err)?;
    }

    file.write_all(json.as_bytes()).map_err(io_err)?;
    file.write_all(b"\n").map_err(io_err)?;
    Ok(())
}
