//! Rule model, rule-file loading, and rule selection.
//!
//! Rules are evaluated per message in ascending priority. Ties keep their
//! declaration order, so the same rule file always yields the same audit
//! trail.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::pipeline::actions::Action;
use crate::pipeline::conditions::{self, Condition};
use crate::pipeline::types::Message;

/// Account-list sentinel matching every account.
pub const ALL_ACCOUNTS: &str = "ALL";

/// A named condition with the actions to run when it matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Account names, or `"ALL"`.
    #[serde(default = "default_accounts")]
    pub accounts: Vec<String>,
    /// Lower runs first.
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default, alias = "condition")]
    pub conditions: Condition,
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Skip lower-priority rules once this one matches.
    #[serde(default)]
    pub stop_processing: bool,
}

fn default_true() -> bool {
    true
}

fn default_accounts() -> Vec<String> {
    vec![ALL_ACCOUNTS.to_string()]
}

fn default_priority() -> i32 {
    100
}

impl Rule {
    /// Rule with defaults, matching everything and doing nothing.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            accounts: default_accounts(),
            priority: default_priority(),
            conditions: Condition::default(),
            actions: Vec::new(),
            stop_processing: false,
        }
    }

    /// Case-sensitive account match, or the `ALL` sentinel.
    pub fn applies_to(&self, account: &str) -> bool {
        self.accounts
            .iter()
            .any(|a| a == ALL_ACCOUNTS || a == account)
    }

    pub fn matches(&self, message: &Message) -> bool {
        conditions::evaluate(message, &self.conditions)
    }
}

/// Enabled rules for `account`, in evaluation order.
pub fn select_ordered<'a>(account: &str, rules: &'a [Rule]) -> Vec<&'a Rule> {
    let mut selected: Vec<&Rule> = rules
        .iter()
        .filter(|rule| rule.enabled && rule.applies_to(account))
        .collect();
    // `sort_by_key` is stable: equal priorities keep declaration order.
    selected.sort_by_key(|rule| rule.priority);
    debug!(
        account,
        total = rules.len(),
        selected = selected.len(),
        "Selected rules"
    );
    selected
}

/// Load rules from a JSON file.
pub fn load_rules(path: &Path) -> Result<Vec<Rule>, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_rules(&content)
}

/// Parse a rule list: either a bare array or `{"rules": [...]}`.
pub fn parse_rules(json: &str) -> Result<Vec<Rule>, ConfigError> {
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(format!("rules: {e}")))?;

    let list = match value {
        serde_json::Value::Object(mut map) => map.remove("rules").ok_or_else(|| {
            ConfigError::ParseError("rules: expected an array or an object with a `rules` key".into())
        })?,
        other => other,
    };

    let rules: Vec<Rule> =
        serde_json::from_value(list).map_err(|e| ConfigError::ParseError(format!("rules: {e}")))?;

    let mut seen = HashSet::new();
    for rule in &rules {
        if rule.name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "name".into(),
                message: "rule name must not be empty".into(),
            });
        }
        if !seen.insert(rule.name.as_str()) {
            return Err(ConfigError::DuplicateRule(rule.name.clone()));
        }
    }
    Ok(rules)
}

/// A non-fatal problem found in a rule set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleIssue {
    pub rule: String,
    pub message: String,
}

impl fmt::Display for RuleIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.rule, self.message)
    }
}

/// Check a rule set for problems that would only show up at run time.
///
/// `known_accounts` may be empty, in which case account names are not
/// checked.
pub fn validate_rules(rules: &[Rule], known_accounts: &[String]) -> Vec<RuleIssue> {
    let mut issues = Vec::new();
    let mut issue = |rule: &Rule, message: String| {
        issues.push(RuleIssue {
            rule: rule.name.clone(),
            message,
        })
    };

    for rule in rules {
        if !rule.enabled {
            issue(rule, "disabled, never evaluated".into());
        }
        if rule.accounts.is_empty() {
            issue(rule, "applies to no account".into());
        }
        if !known_accounts.is_empty() {
            for account in &rule.accounts {
                if account != ALL_ACCOUNTS && !known_accounts.contains(account) {
                    issue(rule, format!("unknown account '{account}'"));
                }
            }
        }
        if rule.actions.is_empty() {
            issue(rule, "has no actions".into());
        }
        for (field, tc) in rule.conditions.text_conditions() {
            if let Some(err) = tc.regex_error() {
                issue(rule, format!("invalid regex in {field}: {err}"));
            }
        }
        for (i, action) in rule.actions.iter().enumerate() {
            if let Err(reason) = action.validate() {
                issue(rule, format!("action {} ({}): {reason}", i + 1, action.label()));
            }
        }
    }
    issues
}
