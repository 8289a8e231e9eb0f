//! Account processor: one sequential run over one account's folders.
//!
//! Connect → authenticate → for each folder: open, locate unprocessed UIDs,
//! then fetch / select rules / evaluate / execute / record each message in
//! turn → disconnect.
//!
//! A failure in connect, authenticate, open or search aborts the account's
//! run. Any other failure is scoped to the message: it is logged, counted,
//! and the message is left unrecorded so the next run picks it up again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::AccountConfig;
use crate::error::ProcessorError;
use crate::gateway::{AccountConnector, BackupPolicy, Credentials, MailboxGateway};
use crate::pipeline::actions::ActionExecutor;
use crate::pipeline::rules::{Rule, select_ordered};
use crate::pipeline::types::{ActionResult, FolderHandle, ProcessingContext, Uid};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::store::IdempotencyStore;

/// Outcome of one account run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub account: String,
    pub run_id: Uuid,
    /// Folders opened.
    pub folders: usize,
    /// Messages fetched.
    pub examined: usize,
    /// Messages at least one rule matched.
    pub matched: usize,
    /// Messages that finished the pipeline.
    pub processed: usize,
    /// Messages left unprocessed after an error.
    pub failed: usize,
    /// Messages not reached because the run was cancelled.
    pub skipped_cancelled: usize,
    pub actions: Vec<ActionResult>,
}

impl RunSummary {
    fn new(account: &str, run_id: Uuid) -> Self {
        Self {
            account: account.to_string(),
            run_id,
            folders: 0,
            examined: 0,
            matched: 0,
            processed: 0,
            failed: 0,
            skipped_cancelled: 0,
            actions: Vec::new(),
        }
    }

    pub fn failed_actions(&self) -> usize {
        self.actions.iter().filter(|a| !a.success).count()
    }
}

/// Runs the rule pipeline over one account.
pub struct AccountProcessor {
    rules: Arc<[Rule]>,
    store: Arc<dyn IdempotencyStore>,
    executor: ActionExecutor,
    retry: RetryPolicy,
    dry_run: bool,
    cancel: Arc<AtomicBool>,
}

impl AccountProcessor {
    pub fn new(
        rules: Arc<[Rule]>,
        store: Arc<dyn IdempotencyStore>,
        connector: Arc<dyn AccountConnector>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            executor: ActionExecutor::new(Arc::clone(&store), connector, retry),
            rules,
            store,
            retry,
            dry_run: false,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_backup(mut self, backup: Arc<dyn BackupPolicy>) -> Self {
        self.executor = self.executor.with_backup(backup);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Share a cancellation flag, checked before each message.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Process every configured folder of `account` through `gateway`.
    pub async fn run(
        &self,
        account: &AccountConfig,
        gateway: &dyn MailboxGateway,
    ) -> Result<RunSummary, ProcessorError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("account_run", account = %account.name, %run_id);
        self.run_inner(account, gateway, run_id).instrument(span).await
    }

    async fn run_inner(
        &self,
        account: &AccountConfig,
        gateway: &dyn MailboxGateway,
        run_id: Uuid,
    ) -> Result<RunSummary, ProcessorError> {
        info!(dry_run = self.dry_run, folders = account.folders.len(), "Account run started");

        gateway
            .connect(&account.host, account.port, account.use_tls)
            .await
            .map_err(|source| ProcessorError::Connect {
                account: account.name.clone(),
                source,
            })?;

        let result = match gateway.authenticate(Credentials::for_account(account)).await {
            Ok(()) => self.process_folders(account, gateway, run_id).await,
            Err(source) => Err(ProcessorError::Authenticate {
                account: account.name.clone(),
                source,
            }),
        };

        if let Err(e) = gateway.disconnect().await {
            warn!(error = %e, "Disconnect failed");
        }

        match &result {
            Ok(summary) => info!(
                examined = summary.examined,
                matched = summary.matched,
                processed = summary.processed,
                failed = summary.failed,
                skipped_cancelled = summary.skipped_cancelled,
                "Account run complete"
            ),
            Err(e) => error!(error = %e, "Account run aborted"),
        }
        result
    }

    async fn process_folders(
        &self,
        account: &AccountConfig,
        gateway: &dyn MailboxGateway,
        run_id: Uuid,
    ) -> Result<RunSummary, ProcessorError> {
        let mut summary = RunSummary::new(&account.name, run_id);
        let mut limiter = RateLimiter::from_limits(&account.limits);
        let mut budget = account.limits.max_messages_per_session;

        for path in &account.folders {
            if budget == 0 {
                debug!(folder = %path, "Session message limit reached, skipping folder");
                continue;
            }
            let folder = gateway
                .open_folder(path, !self.dry_run)
                .await
                .map_err(|source| ProcessorError::OpenFolder {
                    folder: path.clone(),
                    source,
                })?;
            summary.folders += 1;

            let pending = self
                .locate_unprocessed(account, gateway, &folder, budget, &mut summary)
                .await?;
            budget -= pending.len();
            debug!(folder = %path, pending = pending.len(), "Located unprocessed messages");

            for (i, uid) in pending.iter().copied().enumerate() {
                if self.cancel.load(Ordering::Relaxed) {
                    summary.skipped_cancelled += pending.len() - i;
                    info!(folder = %path, remaining = pending.len() - i, "Run cancelled");
                    return Ok(summary);
                }

                limiter.pace().await;

                if let Err(e) = self
                    .process_message(account, gateway, &folder, uid, &mut limiter, &mut summary)
                    .await
                {
                    error!(
                        account = %account.name,
                        folder = %path,
                        uid = %uid,
                        error = %e,
                        "Message processing failed, left for next run"
                    );
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Candidate UIDs not yet recorded, at most `limit` of them.
    async fn locate_unprocessed(
        &self,
        account: &AccountConfig,
        gateway: &dyn MailboxGateway,
        folder: &FolderHandle,
        limit: usize,
        summary: &mut RunSummary,
    ) -> Result<Vec<Uid>, ProcessorError> {
        let candidates = self
            .retry
            .run("search", || gateway.search_unprocessed(folder))
            .await
            .map_err(|source| ProcessorError::Search {
                folder: folder.path.clone(),
                source,
            })?;

        let mut pending = Vec::new();
        for uid in candidates {
            if pending.len() >= limit {
                break;
            }
            match self.store.is_processed(&account.name, uid).await {
                Ok(true) => {}
                Ok(false) => pending.push(uid),
                Err(e) => {
                    error!(folder = %folder.path, uid = %uid, error = %e, "Idempotency lookup failed");
                    summary.failed += 1;
                }
            }
        }
        Ok(pending)
    }

    async fn process_message(
        &self,
        account: &AccountConfig,
        gateway: &dyn MailboxGateway,
        folder: &FolderHandle,
        uid: Uid,
        limiter: &mut RateLimiter,
        summary: &mut RunSummary,
    ) -> Result<(), ProcessorError> {
        let message = self
            .retry
            .run("fetch", || gateway.fetch_message(folder, uid))
            .await?;
        summary.examined += 1;

        let depth = self
            .store
            .chain_depth_of(&account.name, uid)
            .await?
            .unwrap_or(0);
        let mut ctx =
            ProcessingContext::new(&account.name, folder.clone(), uid, depth, self.dry_run);
        let mut rules_applied = Vec::new();

        for rule in select_ordered(&account.name, &self.rules) {
            if ctx.is_removed() {
                debug!(uid = %uid, "Message no longer present, skipping remaining rules");
                break;
            }
            if !rule.matches(&message) {
                continue;
            }

            info!(uid = %uid, rule = %rule.name, subject = %message.subject, "Rule matched");
            rules_applied.push(rule.name.clone());

            for action in &rule.actions {
                let result = self
                    .executor
                    .execute(gateway, limiter, action, &message, &mut ctx)
                    .await?;
                log_result(uid, &rule.name, &result);
                summary.actions.push(result);
            }

            if rule.stop_processing {
                debug!(uid = %uid, rule = %rule.name, "Stop processing");
                break;
            }
        }

        if !rules_applied.is_empty() {
            summary.matched += 1;
        }

        if self.dry_run {
            debug!(uid = %uid, "Dry run, not recording");
        } else {
            self.store
                .mark_processed(
                    &account.name,
                    uid,
                    &rules_applied,
                    message.message_id.as_deref(),
                    Some(&message.subject),
                )
                .await?;
        }
        summary.processed += 1;
        Ok(())
    }
}

fn log_result(uid: Uid, rule: &str, result: &ActionResult) {
    if !result.success {
        warn!(
            uid = %uid,
            rule,
            action = %result.action,
            detail = %result.detail,
            error = result.error.as_deref().unwrap_or_default(),
            "Action failed"
        );
    } else if result.dry_run {
        info!(uid = %uid, rule, action = %result.action, "[dry run] would {}", result.detail);
    } else {
        info!(uid = %uid, rule, action = %result.action, detail = %result.detail, "Action applied");
    }
}
