//! Configuration types.
//!
//! Account definitions and rule files are JSON; engine-level settings come
//! from `MAILFLOW_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;

/// Per-account throttling and retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessingLimits {
    /// Upper bound on messages handled in one account run, across all folders.
    pub max_messages_per_session: usize,
    /// Minimum gap between two mailbox actions.
    pub inter_action_delay_ms: u64,
    /// Sliding one-minute action budget.
    pub max_actions_per_minute: u32,
    /// Total attempts for a transport-level operation.
    pub max_retry_attempts: u32,
    /// Fixed delay between attempts.
    pub retry_delay_seconds: u64,
}

impl Default for ProcessingLimits {
    fn default() -> Self {
        Self {
            max_messages_per_session: 100,
            inter_action_delay_ms: 500,
            max_actions_per_minute: 60,
            max_retry_attempts: 3,
            retry_delay_seconds: 5,
        }
    }
}

impl ProcessingLimits {
    pub fn inter_action_delay(&self) -> Duration {
        Duration::from_millis(self.inter_action_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    /// Limits with no pacing, for tests and local tooling.
    pub fn unthrottled() -> Self {
        Self {
            inter_action_delay_ms: 0,
            max_actions_per_minute: u32::MAX,
            retry_delay_seconds: 0,
            ..Self::default()
        }
    }
}

/// One mailbox account.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountConfig {
    /// Account name, matched case-sensitively against rule account lists.
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub use_tls: bool,
    pub username: String,
    #[serde(deserialize_with = "deserialize_secret")]
    pub password: SecretString,
    /// Folders to process, in order.
    #[serde(default = "default_folders")]
    pub folders: Vec<String>,
    #[serde(default)]
    pub limits: ProcessingLimits,
}

impl AccountConfig {
    /// Minimal account for tests and in-process gateways.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            host: "localhost".into(),
            port: default_port(),
            use_tls: true,
            username: name.clone(),
            password: SecretString::from(String::new()),
            folders: default_folders(),
            limits: ProcessingLimits::default(),
            name,
        }
    }

    pub fn with_folders(mut self, folders: &[&str]) -> Self {
        self.folders = folders.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_limits(mut self, limits: ProcessingLimits) -> Self {
        self.limits = limits;
        self
    }
}

fn default_port() -> u16 {
    993
}

fn default_true() -> bool {
    true
}

fn default_folders() -> Vec<String> {
    vec!["INBOX".to_string()]
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

/// Load account definitions from a JSON array.
pub fn load_accounts(path: &Path) -> Result<Vec<AccountConfig>, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_accounts(&content)
}

/// Parse account definitions, rejecting duplicate names.
pub fn parse_accounts(json: &str) -> Result<Vec<AccountConfig>, ConfigError> {
    let accounts: Vec<AccountConfig> = serde_json::from_str(json)
        .map_err(|e| ConfigError::ParseError(format!("accounts: {e}")))?;

    let mut seen = std::collections::HashSet::new();
    for account in &accounts {
        if account.name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "name".into(),
                message: "account name must not be empty".into(),
            });
        }
        if !seen.insert(account.name.as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "name".into(),
                message: format!("duplicate account name '{}'", account.name),
            });
        }
    }
    Ok(accounts)
}

/// Engine-wide settings, built from environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub rules_path: PathBuf,
    pub accounts_path: PathBuf,
    pub dry_run: bool,
    pub retention_days: u32,
    pub run_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/mailflow.db"),
            rules_path: PathBuf::from("./rules.json"),
            accounts_path: PathBuf::from("./accounts.json"),
            dry_run: false,
            retention_days: 90,
            run_interval: Duration::from_secs(900),
        }
    }
}

impl EngineConfig {
    /// Build config from `MAILFLOW_*` environment variables.
    /// Missing or unparseable values fall back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let path_var = |key: &str, fallback: PathBuf| {
            std::env::var(key).map(PathBuf::from).unwrap_or(fallback)
        };

        let dry_run = std::env::var("MAILFLOW_DRY_RUN")
            .map(|v| parse_bool(&v))
            .unwrap_or(false);

        let retention_days: u32 = std::env::var("MAILFLOW_RETENTION_DAYS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.retention_days);

        let run_interval = parse_interval_secs(std::env::var("MAILFLOW_RUN_INTERVAL_SECS").ok())
            .unwrap_or(defaults.run_interval);

        Self {
            db_path: path_var("MAILFLOW_DB_PATH", defaults.db_path),
            rules_path: path_var("MAILFLOW_RULES_PATH", defaults.rules_path),
            accounts_path: path_var("MAILFLOW_ACCOUNTS_PATH", defaults.accounts_path),
            dry_run,
            retention_days,
            run_interval,
        }
    }
}

/// Whole seconds, greater than zero.
fn parse_interval_secs(value: Option<String>) -> Option<Duration> {
    value?
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|&secs| secs > 0)
        .map(Duration::from_secs)
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn limits_defaults_fill_missing_fields() {
        let limits: ProcessingLimits =
            serde_json::from_str(r#"{"maxActionsPerMinute": 2}"#).unwrap();
        assert_eq!(limits.max_actions_per_minute, 2);
        assert_eq!(limits.max_messages_per_session, 100);
        assert_eq!(limits.inter_action_delay(), Duration::from_millis(500));
        assert_eq!(limits.retry_delay(), Duration::from_secs(5));
    }

    #[test]
    fn parse_account_with_defaults() {
        let json = r#"[{"name": "work", "host": "imap.example.com", "username": "me", "password": "hunter2"}]"#;
        let accounts = parse_accounts(json).unwrap();
        assert_eq!(accounts.len(), 1);
        let account = &accounts[0];
        assert_eq!(account.port, 993);
        assert!(account.use_tls);
        assert_eq!(account.folders, vec!["INBOX".to_string()]);
        assert_eq!(account.password.expose_secret(), "hunter2");
    }

    #[test]
    fn password_is_redacted_in_debug() {
        let json = r#"[{"name": "work", "host": "h", "username": "me", "password": "hunter2"}]"#;
        let accounts = parse_accounts(json).unwrap();
        assert!(!format!("{:?}", accounts[0]).contains("hunter2"));
    }

    #[test]
    fn duplicate_account_names_rejected() {
        let json = r#"[
            {"name": "work", "host": "a", "username": "u", "password": "p"},
            {"name": "work", "host": "b", "username": "u", "password": "p"}
        ]"#;
        assert!(matches!(
            parse_accounts(json),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn malformed_accounts_is_parse_error() {
        assert!(matches!(
            parse_accounts("{not json"),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn interval_parsing_rejects_zero() {
        assert_eq!(parse_interval_secs(Some("60".into())), Some(Duration::from_secs(60)));
        assert_eq!(parse_interval_secs(Some("0".into())), None);
        assert_eq!(parse_interval_secs(Some("soon".into())), None);
        assert_eq!(parse_interval_secs(None), None);
    }

    #[test]
    fn bool_parsing() {
        assert!(parse_bool("1"));
        assert!(parse_bool("TRUE"));
        assert!(parse_bool(" yes "));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("nope"));
    }
}
