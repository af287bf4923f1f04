//! Indexer configuration: layered defaults, validation and environment loading.
//!
//! A configuration is assembled from JSON layers merged lowest-priority-first
//! with [`deep_merge`]:
//!
//! 1. The base defaults shared by every indexer ([`base_layer`])
//! 2. A layer derived from the flavor name ([`flavor_layer`]): logger name
//!    and persistence file path
//! 3. The flavor's own default layers (batch sizes, timeouts, ...)
//! 4. The user configuration
//!
//! The user object is validated before merging. Anything it gets wrong is a
//! [`IndexerError::ConfigError`]: fatal, raised synchronously, never retried.
//!
//! ## Recognized options
//!
//! | Key                    | Type                   | Default                       |
//! |------------------------|------------------------|-------------------------------|
//! | `wsUrl`                | `ws[s][+unix]://` URL  | required                      |
//! | `startingBlock`        | integer or `"latest"`  | `0`                           |
//! | `endingBlock`          | integer or `"latest"`  | `"latest"`                    |
//! | `reconnectTimeout`     | milliseconds           | `5000`                        |
//! | `maxReconnectAttempts` | integer                | `10`                          |
//! | `maxRequestRetries`    | integer                | `10`                          |
//! | `requestRetryTimeout`  | milliseconds           | `5000`                        |
//! | `persistenceFilePath`  | path                   | `./.<flavor>-indexer.db`      |
//! | `persist`              | boolean                | `true`                        |
//! | `logger`               | [`LoggerConfig`]       | `<Flavor>Indexer`, `info`     |
//!
//! Flavor specific keys live in the same object and are deserialized into
//! the flattened `extra` field.
//!
//! ## Example
//!
//! ```
//! use bloxer::config::{BlockTag, IndexerConfig, NoExtras};
//! use serde_json::json;
//!
//! let config: IndexerConfig<NoExtras> = IndexerConfig::build(
//!     "Ethers",
//!     Vec::new(),
//!     json!({ "wsUrl": "wss://node.example", "startingBlock": 100 }),
//! )?;
//!
//! assert_eq!(config.starting_block, BlockTag::Number(100));
//! assert_eq!(config.ending_block, BlockTag::Latest);
//! assert_eq!(config.logger.name, "EthersIndexer");
//! # Ok::<(), bloxer::error::IndexerError>(())
//! ```

mod merge;

pub use merge::{deep_merge, merge_layers};

use crate::error::{IndexerError, IndexerResult};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// URL schemes accepted for `wsUrl`.
pub const WS_SCHEMES: [&str; 4] = ["ws://", "wss://", "ws+unix://", "wss+unix://"];

/// A block position: a literal height or the chain head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawBlockTag", into = "RawBlockTag")]
pub enum BlockTag {
    /// A literal block height.
    Number(u64),
    /// The latest known block height at the time of resolution.
    Latest,
}

impl BlockTag {
    /// Resolves the tag against the latest known height.
    #[must_use]
    pub const fn resolve(self, latest: u64) -> u64 {
        match self {
            Self::Number(block) => block,
            Self::Latest => latest,
        }
    }

    /// Returns `true` for [`BlockTag::Latest`].
    #[must_use]
    pub const fn is_latest(self) -> bool {
        matches!(self, Self::Latest)
    }
}

impl Default for BlockTag {
    fn default() -> Self {
        Self::Number(0)
    }
}

impl fmt::Display for BlockTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(block) => write!(f, "{block}"),
            Self::Latest => write!(f, "latest"),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawBlockTag {
    Number(u64),
    Text(String),
}

impl TryFrom<RawBlockTag> for BlockTag {
    type Error = String;

    fn try_from(raw: RawBlockTag) -> Result<Self, Self::Error> {
        match raw {
            RawBlockTag::Number(block) => Ok(Self::Number(block)),
            RawBlockTag::Text(text) if text == "latest" => Ok(Self::Latest),
            RawBlockTag::Text(text) => Err(format!(
                "expected a non-negative block number or \"latest\", got \"{text}\""
            )),
        }
    }
}

impl From<BlockTag> for RawBlockTag {
    fn from(tag: BlockTag) -> Self {
        match tag {
            BlockTag::Number(block) => Self::Number(block),
            BlockTag::Latest => Self::Text("latest".to_string()),
        }
    }
}

/// Logging options carried by every indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggerConfig {
    /// Name recorded on the indexer's tracing span.
    pub name: String,
    /// Default filter directive, used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON on the console instead of pretty output.
    pub json: bool,
    /// Optional file receiving daily-rotated JSON logs.
    pub file: Option<PathBuf>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            name: "Bloxer Indexer".to_string(),
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

/// Placeholder for flavors without configuration of their own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoExtras {}

/// Fully merged configuration of an indexer.
///
/// `X` holds the flavor specific options, flattened into the same JSON
/// object as the common ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexerConfig<X = NoExtras> {
    /// WebSocket endpoint of the node.
    pub ws_url: String,
    /// First block to scan when no checkpoint exists.
    pub starting_block: BlockTag,
    /// Last block to scan.
    pub ending_block: BlockTag,
    /// Delay between reconnection attempts, in milliseconds.
    pub reconnect_timeout: u64,
    /// Reconnection attempts allowed before giving up.
    pub max_reconnect_attempts: u32,
    /// Retries allowed per request.
    pub max_request_retries: u32,
    /// Delay between request retries, in milliseconds.
    pub request_retry_timeout: u64,
    /// Location of the persistence store.
    pub persistence_file_path: PathBuf,
    /// Whether checkpoints and pending events are persisted.
    pub persist: bool,
    /// Logging options.
    pub logger: LoggerConfig,
    /// Flavor specific options.
    #[serde(flatten)]
    pub extra: X,
}

impl<X: DeserializeOwned> IndexerConfig<X> {
    /// Validates `user` and merges it over the default layers.
    ///
    /// `flavor_name` derives the logger name and persistence path; `layers`
    /// are the flavor's defaults, lowest priority first.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::ConfigError`] when the user object is invalid
    /// or the merged object does not deserialize.
    pub fn build(flavor_name: &str, layers: Vec<Value>, user: Value) -> IndexerResult<Self> {
        validate(&user)?;

        let merged = merge_layers(
            [base_layer(), flavor_layer(flavor_name)]
                .into_iter()
                .chain(layers)
                .chain(std::iter::once(user)),
        );

        serde_json::from_value(merged).map_err(|e| {
            IndexerError::config(format!("Invalid configuration: {e}"), Some(Box::new(e)))
        })
    }
}

impl<X> IndexerConfig<X> {
    /// Delay between reconnection attempts.
    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout)
    }

    /// Delay between request retries.
    #[must_use]
    pub const fn request_retry_delay(&self) -> Duration {
        Duration::from_millis(self.request_retry_timeout)
    }
}

/// Defaults shared by every indexer.
#[must_use]
pub fn base_layer() -> Value {
    json!({
        "startingBlock": 0,
        "endingBlock": "latest",
        "reconnectTimeout": 5000,
        "maxReconnectAttempts": 10,
        "maxRequestRetries": 10,
        "requestRetryTimeout": 5000,
        "persistenceFilePath": ".bloxer-indexer.db",
        "persist": true,
        "logger": LoggerConfig::default(),
    })
}

/// Layer derived from a flavor name.
///
/// `"XrplAccount"` yields the logger name `XrplAccountIndexer` and the
/// persistence path `./.xrpl-account-indexer.db`.
#[must_use]
pub fn flavor_layer(flavor_name: &str) -> Value {
    if flavor_name.is_empty() {
        return Value::Object(Map::new());
    }
    json!({
        "logger": { "name": format!("{flavor_name}Indexer") },
        "persistenceFilePath": format!("./.{}-indexer.db", to_kebab_case(flavor_name)),
    })
}

fn to_kebab_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                out.push('-');
            }
            out.extend(c.to_lowercase());
        } else if c == '_' || c == ' ' {
            out.push('-');
        } else {
            out.push(c);
        }
    }
    out
}

/// Validates a user configuration object before it is merged.
///
/// Only keys that are present and non-null are checked, except `wsUrl`
/// which is required.
///
/// # Errors
///
/// Returns [`IndexerError::ConfigError`] describing the first violation.
pub fn validate(user: &Value) -> IndexerResult<()> {
    let Some(object) = user.as_object() else {
        return Err(IndexerError::config("Configuration must be an object", None));
    };

    match object.get("wsUrl").and_then(Value::as_str) {
        Some(url) if WS_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) => {}
        _ => {
            return Err(IndexerError::config(
                "Node url must start with `wss://`, `ws://`, `wss+unix://`, or `ws+unix://`.",
                None,
            ))
        }
    }

    for key in ["startingBlock", "endingBlock"] {
        match present(object, key) {
            None => {}
            Some(value) if value.as_u64().is_some() || value.as_str() == Some("latest") => {}
            Some(_) => {
                return Err(IndexerError::config(
                    format!("{key} must be greater than or equal to 0 or 'latest'."),
                    None,
                ))
            }
        }
    }

    for key in ["reconnectTimeout", "requestRetryTimeout"] {
        if let Some(value) = present(object, key) {
            if value.as_u64().is_none() {
                return Err(IndexerError::config(
                    format!("{key} must be an integer greater than or equal to 0."),
                    None,
                ));
            }
        }
    }

    for key in ["maxReconnectAttempts", "maxRequestRetries"] {
        if let Some(value) = present(object, key) {
            let fits = value
                .as_u64()
                .is_some_and(|n| u32::try_from(n).is_ok());
            if !fits {
                return Err(IndexerError::config(
                    format!("{key} must be an integer greater than or equal to 0."),
                    None,
                ));
            }
        }
    }

    if let Some(value) = present(object, "persist") {
        if !value.is_boolean() {
            return Err(IndexerError::config("persist must be a boolean.", None));
        }
    }

    Ok(())
}

fn present<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    object.get(key).filter(|value| !value.is_null())
}

/// Builds a user configuration object from environment variables.
///
/// Loads `.env` first (if present), then reads `<PREFIX>_<KEY>` for each
/// recognized option:
///
/// - `WS_URL`, `STARTING_BLOCK`, `ENDING_BLOCK`
/// - `RECONNECT_TIMEOUT`, `MAX_RECONNECT_ATTEMPTS`
/// - `MAX_REQUEST_RETRIES`, `REQUEST_RETRY_TIMEOUT`
/// - `PERSISTENCE_FILE_PATH`, `PERSIST`
/// - `LOG_NAME`, `LOG_LEVEL`, `LOG_JSON`, `LOG_FILE`
///
/// Unset variables are left out so the defaults apply. The result is meant
/// to be passed to an indexer constructor, which validates it.
///
/// # Errors
///
/// Returns [`IndexerError::ConfigError`] if a numeric or boolean variable
/// does not parse.
///
/// # Example
///
/// ```no_run
/// use bloxer::config::from_env;
///
/// // BLOXER_WS_URL=wss://node.example BLOXER_STARTING_BLOCK=latest
/// let user = from_env("BLOXER")?;
/// assert_eq!(user["startingBlock"], "latest");
/// # Ok::<(), bloxer::error::IndexerError>(())
/// ```
pub fn from_env(prefix: &str) -> IndexerResult<Value> {
    // Load .env file if present (ignore error if file doesn't exist)
    dotenvy::dotenv().ok();

    let var = |key: &str| env::var(format!("{prefix}_{key}")).ok();
    let mut user = Map::new();
    let mut logger = Map::new();

    if let Some(url) = var("WS_URL") {
        user.insert("wsUrl".to_string(), Value::String(url));
    }
    for (key, name) in [("STARTING_BLOCK", "startingBlock"), ("ENDING_BLOCK", "endingBlock")] {
        if let Some(raw) = var(key) {
            let value = if raw == "latest" {
                Value::String(raw)
            } else {
                Value::from(parse_number(prefix, key, &raw)?)
            };
            user.insert(name.to_string(), value);
        }
    }
    for (key, name) in [
        ("RECONNECT_TIMEOUT", "reconnectTimeout"),
        ("MAX_RECONNECT_ATTEMPTS", "maxReconnectAttempts"),
        ("MAX_REQUEST_RETRIES", "maxRequestRetries"),
        ("REQUEST_RETRY_TIMEOUT", "requestRetryTimeout"),
    ] {
        if let Some(raw) = var(key) {
            user.insert(name.to_string(), Value::from(parse_number(prefix, key, &raw)?));
        }
    }
    if let Some(path) = var("PERSISTENCE_FILE_PATH") {
        user.insert("persistenceFilePath".to_string(), Value::String(path));
    }
    if let Some(raw) = var("PERSIST") {
        user.insert("persist".to_string(), Value::Bool(parse_bool(prefix, "PERSIST", &raw)?));
    }

    if let Some(name) = var("LOG_NAME") {
        logger.insert("name".to_string(), Value::String(name));
    }
    if let Some(level) = var("LOG_LEVEL") {
        logger.insert("level".to_string(), Value::String(level));
    }
    if let Some(raw) = var("LOG_JSON") {
        logger.insert("json".to_string(), Value::Bool(parse_bool(prefix, "LOG_JSON", &raw)?));
    }
    if let Some(file) = var("LOG_FILE") {
        logger.insert("file".to_string(), Value::String(file));
    }
    if !logger.is_empty() {
        user.insert("logger".to_string(), Value::Object(logger));
    }

    Ok(Value::Object(user))
}

fn parse_number(prefix: &str, key: &str, raw: &str) -> IndexerResult<u64> {
    raw.trim().parse::<u64>().map_err(|e| {
        IndexerError::config(
            format!("{prefix}_{key} must be a non-negative integer, got \"{raw}\""),
            Some(Box::new(e)),
        )
    })
}

fn parse_bool(prefix: &str, key: &str, raw: &str) -> IndexerResult<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(IndexerError::config(
            format!("{prefix}_{key} must be a boolean, got \"{raw}\""),
            None,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct AccountExtras {
        transactions_batch_size: u64,
    }

    fn user() -> Value {
        json!({ "wsUrl": "wss://node.example" })
    }

    #[test]
    fn test_defaults_applied() {
        let config: IndexerConfig = IndexerConfig::build("", Vec::new(), user())
            .expect("config should build");

        assert_eq!(config.starting_block, BlockTag::Number(0));
        assert_eq!(config.ending_block, BlockTag::Latest);
        assert_eq!(config.reconnect_timeout, 5000);
        assert_eq!(config.max_reconnect_attempts, 10);
        assert_eq!(config.max_request_retries, 10);
        assert_eq!(config.request_retry_timeout, 5000);
        assert_eq!(config.persistence_file_path, PathBuf::from(".bloxer-indexer.db"));
        assert!(config.persist);
        assert_eq!(config.logger.name, "Bloxer Indexer");
    }

    #[test]
    fn test_flavor_layers() {
        let config: IndexerConfig<AccountExtras> = IndexerConfig::build(
            "XrplAccount",
            vec![json!({ "transactionsBatchSize": 10000 })],
            user(),
        )
        .expect("config should build");

        assert_eq!(config.logger.name, "XrplAccountIndexer");
        assert_eq!(
            config.persistence_file_path,
            PathBuf::from("./.xrpl-account-indexer.db")
        );
        assert_eq!(config.extra.transactions_batch_size, 10000);
    }

    #[test]
    fn test_user_overrides_layers() {
        let mut raw = user();
        raw["transactionsBatchSize"] = json!(50);
        raw["logger"] = json!({ "level": "debug" });
        raw["endingBlock"] = json!(400);

        let config: IndexerConfig<AccountExtras> = IndexerConfig::build(
            "XrplAccount",
            vec![json!({ "transactionsBatchSize": 10000 })],
            raw,
        )
        .expect("config should build");

        assert_eq!(config.extra.transactions_batch_size, 50);
        assert_eq!(config.logger.level, "debug");
        assert_eq!(config.logger.name, "XrplAccountIndexer");
        assert_eq!(config.ending_block, BlockTag::Number(400));
    }

    #[test]
    fn test_ws_url_required() {
        let err = IndexerConfig::<NoExtras>::build("", Vec::new(), json!({})).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_ws_url_schemes() {
        for url in ["ws://a", "wss://a", "ws+unix:///tmp/a.sock", "wss+unix:///tmp/a.sock"] {
            assert!(validate(&json!({ "wsUrl": url })).is_ok(), "{url} should be accepted");
        }
        for url in ["http://a", "a", "", "tcp://a"] {
            assert!(validate(&json!({ "wsUrl": url })).is_err(), "{url} should be rejected");
        }
    }

    #[test]
    fn test_negative_numbers_rejected() {
        for key in [
            "startingBlock",
            "endingBlock",
            "reconnectTimeout",
            "maxReconnectAttempts",
            "maxRequestRetries",
            "requestRetryTimeout",
        ] {
            let mut raw = user();
            raw[key] = json!(-1);
            let err = validate(&raw).unwrap_err();
            assert!(err.is_config(), "{key} = -1 should be rejected");
        }
    }

    #[test]
    fn test_block_tag_strings() {
        let mut raw = user();
        raw["startingBlock"] = json!("latest");
        assert!(validate(&raw).is_ok());

        raw["startingBlock"] = json!("earliest");
        assert!(validate(&raw).is_err());
    }

    #[test]
    fn test_null_options_use_defaults() {
        let mut raw = user();
        raw["reconnectTimeout"] = Value::Null;
        let config: IndexerConfig = IndexerConfig::build("", Vec::new(), raw)
            .expect("config should build");
        assert_eq!(config.reconnect_timeout, 5000);
    }

    #[test]
    fn test_block_tag_serde() {
        assert_eq!(serde_json::to_value(BlockTag::Latest).unwrap(), json!("latest"));
        assert_eq!(serde_json::to_value(BlockTag::Number(7)).unwrap(), json!(7));
        assert_eq!(
            serde_json::from_value::<BlockTag>(json!("latest")).unwrap(),
            BlockTag::Latest
        );
        assert_eq!(BlockTag::Latest.resolve(900), 900);
        assert_eq!(BlockTag::Number(5).resolve(900), 5);
    }

    #[test]
    fn test_kebab_case() {
        assert_eq!(to_kebab_case("Ethers"), "ethers");
        assert_eq!(to_kebab_case("XrplAccount"), "xrpl-account");
        assert_eq!(to_kebab_case("EthersTypechainContract"), "ethers-typechain-contract");
    }

    #[test]
    fn test_from_env() {
        env::set_var("BLOXER_CFG_TEST_WS_URL", "ws://localhost:6006");
        env::set_var("BLOXER_CFG_TEST_STARTING_BLOCK", "latest");
        env::set_var("BLOXER_CFG_TEST_MAX_REQUEST_RETRIES", "3");
        env::set_var("BLOXER_CFG_TEST_PERSIST", "false");
        env::set_var("BLOXER_CFG_TEST_LOG_LEVEL", "debug");

        let raw = from_env("BLOXER_CFG_TEST").expect("env config should load");

        assert_eq!(raw["wsUrl"], "ws://localhost:6006");
        assert_eq!(raw["startingBlock"], "latest");
        assert_eq!(raw["maxRequestRetries"], 3);
        assert_eq!(raw["persist"], false);
        assert_eq!(raw["logger"]["level"], "debug");
        assert!(raw.get("endingBlock").is_none());
    }

    #[test]
    fn test_from_env_rejects_bad_number() {
        env::set_var("BLOXER_CFG_BAD_RECONNECT_TIMEOUT", "soon");
        let err = from_env("BLOXER_CFG_BAD").unwrap_err();
        assert!(err.is_config());
    }
}
