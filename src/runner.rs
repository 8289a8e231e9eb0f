//! Multi-account orchestration.
//!
//! Every account gets its own gateway and its own `AccountProcessor`; the
//! idempotency store is the only thing they share. Accounts run
//! concurrently and one account's failure never touches another's run.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::AccountConfig;
use crate::error::{GatewayError, ProcessorError};
use crate::gateway::{AccountConnector, BackupPolicy, Credentials, GatewayFactory, MailboxGateway};
use crate::pipeline::processor::{AccountProcessor, RunSummary};
use crate::pipeline::rules::Rule;
use crate::retry::RetryPolicy;
use crate::store::IdempotencyStore;

/// Shortest period `spawn_periodic` will tick at.
pub const MIN_RUN_INTERVAL: Duration = Duration::from_secs(1);

/// Opens authenticated gateways to configured accounts, for transfers.
pub struct ConfiguredConnector {
    accounts: Arc<[AccountConfig]>,
    factory: Arc<dyn GatewayFactory>,
}

impl ConfiguredConnector {
    pub fn new(accounts: Arc<[AccountConfig]>, factory: Arc<dyn GatewayFactory>) -> Self {
        Self { accounts, factory }
    }
}

#[async_trait]
impl AccountConnector for ConfiguredConnector {
    async fn open_account(&self, account: &str) -> Result<Box<dyn MailboxGateway>, GatewayError> {
        let config = self
            .accounts
            .iter()
            .find(|a| a.name == account)
            .ok_or_else(|| GatewayError::UnknownAccount(account.to_string()))?;

        let gateway = self.factory.create(config);
        gateway
            .connect(&config.host, config.port, config.use_tls)
            .await?;
        gateway.authenticate(Credentials::for_account(config)).await?;
        Ok(gateway)
    }
}

/// Result of one account within a `run_all` pass.
#[derive(Debug)]
pub struct AccountRun {
    pub account: String,
    pub outcome: Result<RunSummary, ProcessorError>,
}

/// Runs the pipeline over every configured account.
pub struct Runner {
    accounts: Arc<[AccountConfig]>,
    rules: Arc<[Rule]>,
    store: Arc<dyn IdempotencyStore>,
    factory: Arc<dyn GatewayFactory>,
    connector: Arc<dyn AccountConnector>,
    backup: Option<Arc<dyn BackupPolicy>>,
    dry_run: bool,
    cancel: Arc<AtomicBool>,
}

impl Runner {
    pub fn new(
        accounts: Vec<AccountConfig>,
        rules: Vec<Rule>,
        store: Arc<dyn IdempotencyStore>,
        factory: Arc<dyn GatewayFactory>,
    ) -> Self {
        let accounts: Arc<[AccountConfig]> = accounts.into();
        let connector = Arc::new(ConfiguredConnector::new(
            Arc::clone(&accounts),
            Arc::clone(&factory),
        ));
        Self {
            accounts,
            rules: rules.into(),
            store,
            factory,
            connector,
            backup: None,
            dry_run: false,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_backup(mut self, backup: Arc<dyn BackupPolicy>) -> Self {
        self.backup = Some(backup);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Flag that cancels in-flight runs at the next message boundary.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Process all accounts concurrently.
    pub async fn run_all(&self) -> Vec<AccountRun> {
        let runs = self.accounts.iter().map(|account| async move {
            AccountRun {
                account: account.name.clone(),
                outcome: self.run_account(account).await,
            }
        });
        join_all(runs).await
    }

    async fn run_account(&self, account: &AccountConfig) -> Result<RunSummary, ProcessorError> {
        let gateway = self.factory.create(account);
        let mut processor = AccountProcessor::new(
            Arc::clone(&self.rules),
            Arc::clone(&self.store),
            Arc::clone(&self.connector),
            RetryPolicy::from_limits(&account.limits),
        )
        .with_dry_run(self.dry_run)
        .with_cancel(Arc::clone(&self.cancel));
        if let Some(backup) = &self.backup {
            processor = processor.with_backup(Arc::clone(backup));
        }
        processor.run(account, gateway.as_ref()).await
    }

    /// Spawn a background task that runs every account on a timer.
    ///
    /// The first pass starts immediately. Setting the returned flag stops
    /// the loop and cancels the pass in progress at its next message
    /// boundary. Intervals below `MIN_RUN_INTERVAL` are raised to it.
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration) -> (JoinHandle<()>, Arc<AtomicBool>) {
        let shutdown = self.cancel_flag();
        if interval < MIN_RUN_INTERVAL {
            warn!(?interval, "Run interval too short, using {:?}", MIN_RUN_INTERVAL);
        }
        let interval = interval.max(MIN_RUN_INTERVAL);

        let handle = tokio::spawn(async move {
            info!(
                accounts = self.accounts.len(),
                "Runner started, processing every {}s",
                interval.as_secs()
            );

            let mut tick = tokio::time::interval(interval);

            loop {
                tick.tick().await;

                if self.cancel.load(Ordering::Relaxed) {
                    info!("Runner shutting down");
                    return;
                }

                for run in self.run_all().await {
                    if let Err(e) = run.outcome {
                        error!(account = %run.account, error = %e, "Account run failed, retried next tick");
                    }
                }
            }
        });

        (handle, shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use crate::config::ProcessingLimits;
    use crate::gateway::{MemoryServer, OpKind};
    use crate::pipeline::actions::Action;
    use crate::pipeline::conditions::TextCondition;
    use crate::pipeline::types::Uid;
    use crate::store::LibSqlBackend;

    fn account(name: &str) -> AccountConfig {
        AccountConfig::new(name).with_limits(ProcessingLimits::unthrottled())
    }

    fn deliver(server: &MemoryServer, account: &str, subject: &str) -> Uid {
        let raw = format!("From: boss@corp.com\r\nTo: me@example.com\r\nSubject: {subject}\r\n\r\nHi\r\n");
        server
            .deliver_raw(account, "INBOX", raw.as_bytes(), BTreeSet::new(), None)
            .unwrap()
    }

    fn read_all() -> Rule {
        let mut rule = Rule::new("Read everything");
        rule.actions = vec![Action::MarkRead];
        rule
    }

    #[tokio::test]
    async fn one_account_failing_does_not_affect_others() {
        let server = MemoryServer::new();
        server.add_account("work");
        server.add_account("home");
        deliver(&server, "work", "Status");
        deliver(&server, "home", "Dinner");
        server.fail_next(
            "work",
            OpKind::Authenticate,
            GatewayError::Auth {
                account: "work".into(),
                reason: "bad password".into(),
            },
        );

        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let runner = Runner::new(
            vec![account("work"), account("home")],
            vec![read_all()],
            store.clone(),
            Arc::new(server.clone()),
        );

        let runs = runner.run_all().await;
        assert_eq!(runs.len(), 2);
        assert!(matches!(
            runs[0].outcome,
            Err(ProcessorError::Authenticate { .. })
        ));
        assert_eq!(runs[1].outcome.as_ref().unwrap().processed, 1);

        assert!(!store.is_processed("work", Uid(1)).await.unwrap());
        assert!(store.is_processed("home", Uid(1)).await.unwrap());
    }

    #[tokio::test]
    async fn connector_rejects_unconfigured_account() {
        let server = MemoryServer::new();
        server.add_account("work");
        let connector = ConfiguredConnector::new(vec![account("work")].into(), Arc::new(server));

        assert!(connector.open_account("work").await.is_ok());
        assert!(matches!(
            connector.open_account("ghost").await,
            Err(GatewayError::UnknownAccount(_))
        ));
    }

    #[tokio::test]
    async fn transfers_between_configured_accounts() {
        let server = MemoryServer::new();
        server.add_account("work");
        server.add_account("home");
        let uid = deliver(&server, "work", "Personal: photos");

        let mut rule = Rule::new("Personal to home");
        rule.accounts = vec!["work".into()];
        rule.conditions.subject = Some(TextCondition::starts_with("personal"));
        rule.actions = vec![Action::MoveToAccount {
            target_account: "home".into(),
            target_folder: None,
            mark_processed: true,
        }];

        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let runner = Runner::new(
            vec![account("work"), account("home")],
            vec![rule],
            store.clone(),
            Arc::new(server.clone()),
        );
        runner.run_all().await;

        assert!(server.uids("work", "INBOX").is_empty());
        let record = store.get_cross_account_move("work", uid).await.unwrap().unwrap();
        assert_eq!(record.target_account, "home");
        assert_eq!(server.uids("home", "INBOX"), vec![record.target_uid]);
    }

    #[tokio::test]
    async fn periodic_runner_stops_on_shutdown() {
        let server = MemoryServer::new();
        server.add_account("work");
        deliver(&server, "work", "Status");

        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let runner = Arc::new(Runner::new(
            vec![account("work")],
            vec![read_all()],
            store.clone(),
            Arc::new(server.clone()),
        ));

        let (handle, shutdown) = runner.spawn_periodic(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.store(true, Ordering::Relaxed);
        handle.await.unwrap();

        assert!(store.is_processed("work", Uid(1)).await.unwrap());
        assert!(server.message("work", "INBOX", Uid(1)).unwrap().is_seen());
    }

    #[tokio::test]
    async fn zero_interval_is_raised_to_minimum() {
        let server = MemoryServer::new();
        server.add_account("work");
        deliver(&server, "work", "Status");

        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let runner = Arc::new(Runner::new(
            vec![account("work")],
            vec![read_all()],
            store.clone(),
            Arc::new(server.clone()),
        ));

        let (handle, shutdown) = runner.spawn_periodic(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.store(true, Ordering::Relaxed);

        // A zero period would have panicked inside the task.
        handle.await.unwrap();
        assert!(store.is_processed("work", Uid(1)).await.unwrap());
    }
}
