use anyhow::{Context, bail};

use mailflow::config::{EngineConfig, load_accounts};
use mailflow::pipeline::{load_rules, select_ordered, validate_rules};
use mailflow::store::{IdempotencyStore, LibSqlBackend};

const USAGE: &str = "\
Usage: mailflow <command>

Commands:
  rules [ACCOUNT]   Validate the rule file and print evaluation order
  cleanup [DAYS]    Delete idempotency records older than DAYS
  stats ACCOUNT     Count processed messages for ACCOUNT

Environment:
  MAILFLOW_DB_PATH, MAILFLOW_RULES_PATH, MAILFLOW_ACCOUNTS_PATH,
  MAILFLOW_RETENTION_DAYS";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EngineConfig::from_env();
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.first().map(String::as_str) {
        Some("rules") => check_rules(&config, args.get(1).map(String::as_str)),
        Some("cleanup") => {
            let days = match args.get(1) {
                Some(days) => days
                    .parse()
                    .with_context(|| format!("invalid retention days '{days}'"))?,
                None => config.retention_days,
            };
            cleanup(&config, days).await
        }
        Some("stats") => {
            let Some(account) = args.get(1) else {
                bail!("stats requires an account name\n\n{USAGE}");
            };
            stats(&config, account).await
        }
        Some("-h" | "--help" | "help") | None => {
            println!("{USAGE}");
            Ok(())
        }
        Some(other) => bail!("unknown command '{other}'\n\n{USAGE}"),
    }
}

fn check_rules(config: &EngineConfig, account: Option<&str>) -> anyhow::Result<()> {
    let rules = load_rules(&config.rules_path)
        .with_context(|| format!("loading rules from {}", config.rules_path.display()))?;

    // Account names are only checked when the accounts file is readable.
    let known_accounts: Vec<String> = match load_accounts(&config.accounts_path) {
        Ok(accounts) => accounts.into_iter().map(|a| a.name).collect(),
        Err(e) => {
            tracing::debug!(error = %e, "Accounts file not loaded, skipping account checks");
            Vec::new()
        }
    };

    let issues = validate_rules(&rules, &known_accounts);
    println!("{} rules loaded from {}", rules.len(), config.rules_path.display());
    for issue in &issues {
        println!("  warning: {issue}");
    }

    let ordered: Vec<_> = match account {
        Some(account) => {
            println!("\nEvaluation order for '{account}':");
            select_ordered(account, &rules)
        }
        None => {
            println!("\nEvaluation order (all enabled rules):");
            let mut enabled: Vec<_> = rules.iter().filter(|r| r.enabled).collect();
            enabled.sort_by_key(|r| r.priority);
            enabled
        }
    };
    for (i, rule) in ordered.iter().enumerate() {
        let stop = if rule.stop_processing { "  [stop]" } else { "" };
        println!(
            "  {:>2}. [{:>4}] {} ({} actions){stop}",
            i + 1,
            rule.priority,
            rule.name,
            rule.actions.len()
        );
    }
    Ok(())
}

async fn cleanup(config: &EngineConfig, retention_days: u32) -> anyhow::Result<()> {
    let store = LibSqlBackend::new_local(&config.db_path)
        .await
        .with_context(|| format!("opening database at {}", config.db_path.display()))?;
    let report = store.cleanup(retention_days).await?;
    println!(
        "Deleted {} processed records and {} transfer records older than {retention_days} days",
        report.processed_deleted, report.moves_deleted
    );
    Ok(())
}

async fn stats(config: &EngineConfig, account: &str) -> anyhow::Result<()> {
    let store = LibSqlBackend::new_local(&config.db_path)
        .await
        .with_context(|| format!("opening database at {}", config.db_path.display()))?;
    let count = store.processed_count(account).await?;
    println!("{account}: {count} processed messages");
    Ok(())
}
