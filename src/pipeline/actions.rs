//! Rule actions and the executor that applies them to a mailbox.
//!
//! Validation (unknown flag, chain depth, removed message) happens before
//! any mailbox call and before the dry-run short circuit, so a dry run
//! reports exactly what a live run would accept or reject.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{GatewayError, ProcessorError};
use crate::gateway::{AccountConnector, BackupPolicy, MailboxGateway};
use crate::pipeline::types::{
    ActionResult, Flag, Location, MAX_CHAIN_DEPTH, Message, ProcessingContext, Uid,
};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::store::IdempotencyStore;

/// Folder used when a cross-account move names no target folder.
pub const DEFAULT_TARGET_FOLDER: &str = "INBOX";

/// One step of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Action {
    MoveToFolder {
        folder: String,
    },
    MoveToAccount {
        target_account: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_folder: Option<String>,
        /// Delete the source copy once the transfer is recorded.
        #[serde(default)]
        mark_processed: bool,
    },
    Delete,
    MarkRead,
    MarkUnread,
    AddFlag {
        flag: String,
    },
    RemoveFlag {
        flag: String,
    },
}

impl Action {
    /// Short label used in results and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::MoveToFolder { .. } => "move_to_folder",
            Self::MoveToAccount { .. } => "move_to_account",
            Self::Delete => "delete",
            Self::MarkRead => "mark_read",
            Self::MarkUnread => "mark_unread",
            Self::AddFlag { .. } => "add_flag",
            Self::RemoveFlag { .. } => "remove_flag",
        }
    }

    /// What the action does, identical for live and dry runs.
    pub fn describe(&self) -> String {
        match self {
            Self::MoveToFolder { folder } => format!("move to folder '{folder}'"),
            Self::MoveToAccount {
                target_account,
                target_folder,
                mark_processed,
            } => {
                let folder = target_folder.as_deref().unwrap_or(DEFAULT_TARGET_FOLDER);
                if *mark_processed {
                    format!("move to account '{target_account}' folder '{folder}', delete source")
                } else {
                    format!("copy to account '{target_account}' folder '{folder}'")
                }
            }
            Self::Delete => "delete message".into(),
            Self::MarkRead => "mark as read".into(),
            Self::MarkUnread => "mark as unread".into(),
            Self::AddFlag { flag } => format!("add flag '{flag}'"),
            Self::RemoveFlag { flag } => format!("remove flag '{flag}'"),
        }
    }

    /// Configuration problems detectable without a message.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::MoveToFolder { folder } if folder.trim().is_empty() => {
                Err("destination folder is empty".into())
            }
            Self::MoveToAccount { target_account, .. } if target_account.trim().is_empty() => {
                Err("target account is empty".into())
            }
            Self::AddFlag { flag } | Self::RemoveFlag { flag } => {
                flag.parse::<Flag>().map(|_| ()).map_err(|e| e.to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Applies actions to the mailbox a message was fetched from.
pub struct ActionExecutor {
    store: Arc<dyn IdempotencyStore>,
    connector: Arc<dyn AccountConnector>,
    backup: Option<Arc<dyn BackupPolicy>>,
    retry: RetryPolicy,
}

impl ActionExecutor {
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        connector: Arc<dyn AccountConnector>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            connector,
            backup: None,
            retry,
        }
    }

    pub fn with_backup(mut self, backup: Arc<dyn BackupPolicy>) -> Self {
        self.backup = Some(backup);
        self
    }

    /// Run one action.
    ///
    /// Configuration problems and permanent gateway errors come back as a
    /// failed `ActionResult`. `Err` means the message cannot be finished in
    /// this run: retries were exhausted or the store failed.
    pub async fn execute(
        &self,
        gateway: &dyn MailboxGateway,
        limiter: &mut RateLimiter,
        action: &Action,
        message: &Message,
        ctx: &mut ProcessingContext,
    ) -> Result<ActionResult, ProcessorError> {
        let label = action.label();
        let detail = action.describe();

        if ctx.is_removed() {
            return Ok(ActionResult::failed(
                label,
                detail,
                "message no longer present",
            ));
        }
        if let Err(reason) = action.validate() {
            return Ok(ActionResult::failed(label, detail, reason));
        }
        if matches!(action, Action::MoveToAccount { .. }) && ctx.chain_depth >= MAX_CHAIN_DEPTH {
            return Ok(ActionResult::failed(
                label,
                detail,
                format!("max chain depth {MAX_CHAIN_DEPTH} reached"),
            ));
        }

        if ctx.dry_run {
            return Ok(ActionResult::done(label, detail, true));
        }

        limiter.acquire().await;

        match self.apply(gateway, action, message, ctx).await {
            Ok(()) => Ok(ActionResult::done(label, detail, false)),
            Err(ProcessorError::Gateway(e)) if !e.is_retryable() => {
                Ok(ActionResult::failed(label, detail, e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn apply(
        &self,
        gateway: &dyn MailboxGateway,
        action: &Action,
        message: &Message,
        ctx: &mut ProcessingContext,
    ) -> Result<(), ProcessorError> {
        match action {
            Action::MoveToFolder { folder } => self.move_to_folder(gateway, folder, ctx).await,
            Action::MoveToAccount {
                target_account,
                target_folder,
                mark_processed,
            } => {
                let target_folder = target_folder.as_deref().unwrap_or(DEFAULT_TARGET_FOLDER);
                self.move_to_account(message, target_account, target_folder, ctx)
                    .await?;
                if *mark_processed {
                    self.delete(gateway, ctx).await?;
                }
                Ok(())
            }
            Action::Delete => {
                if let Some(backup) = &self.backup {
                    if let Err(e) = backup.backup(&ctx.account, message).await {
                        warn!(
                            account = %ctx.account,
                            uid = %ctx.uid,
                            error = %e,
                            "Backup failed, deleting anyway"
                        );
                    }
                }
                self.delete(gateway, ctx).await
            }
            Action::MarkRead => self.set_flag(gateway, Flag::Seen, true, ctx).await,
            Action::MarkUnread => self.set_flag(gateway, Flag::Seen, false, ctx).await,
            Action::AddFlag { flag } | Action::RemoveFlag { flag } => {
                let flag = flag
                    .parse::<Flag>()
                    .map_err(|e| GatewayError::Protocol(e.to_string()))?;
                let add = matches!(action, Action::AddFlag { .. });
                self.set_flag(gateway, flag, add, ctx).await
            }
        }
    }

    async fn move_to_folder(
        &self,
        gateway: &dyn MailboxGateway,
        dest: &str,
        ctx: &mut ProcessingContext,
    ) -> Result<(), ProcessorError> {
        let (folder, uid) = addressable(ctx)?;
        ensure_folder(&self.retry, gateway, dest).await?;

        let new_uid = self
            .retry
            .run("move", || gateway.move_message(&folder, uid, dest))
            .await?;

        debug!(account = %ctx.account, from = %folder, to = dest, ?new_uid, "Message moved");
        ctx.location = match new_uid {
            Some(uid) => Location::At {
                folder: dest.to_string(),
                uid,
            },
            None => Location::Moved {
                folder: dest.to_string(),
            },
        };
        Ok(())
    }

    async fn move_to_account(
        &self,
        message: &Message,
        target_account: &str,
        target_folder: &str,
        ctx: &mut ProcessingContext,
    ) -> Result<(), ProcessorError> {
        // A previous run may have appended and recorded the transfer but
        // failed before finishing the message.
        if let Some(existing) = self
            .store
            .get_cross_account_move(&ctx.account, ctx.uid)
            .await?
        {
            debug!(
                account = %ctx.account,
                uid = %ctx.uid,
                target_account = %existing.target_account,
                target_uid = %existing.target_uid,
                "Transfer already recorded, skipping append"
            );
            ctx.chain_depth = existing.chain_depth;
            return Ok(());
        }

        let target = self
            .retry
            .run("connect", || self.connector.open_account(target_account))
            .await?;

        let appended = async {
            ensure_folder(&self.retry, target.as_ref(), target_folder).await?;
            self.retry
                .run("append", || target.append(target_folder, message))
                .await
        }
        .await;

        if let Err(e) = target.disconnect().await {
            debug!(target_account, error = %e, "Disconnect from transfer target failed");
        }
        let target_uid = appended?;

        let depth = ctx.chain_depth + 1;
        self.store
            .mark_cross_account_move(&ctx.account, ctx.uid, target_account, target_uid, depth)
            .await?;
        ctx.chain_depth = depth;
        Ok(())
    }

    async fn delete(
        &self,
        gateway: &dyn MailboxGateway,
        ctx: &mut ProcessingContext,
    ) -> Result<(), ProcessorError> {
        let (folder, uid) = addressable(ctx)?;
        self.retry
            .run("set_flags", || gateway.set_flags(&folder, uid, &[Flag::Deleted]))
            .await?;
        self.retry
            .run("expunge", || gateway.expunge(&folder))
            .await?;
        ctx.location = Location::Removed;
        Ok(())
    }

    async fn set_flag(
        &self,
        gateway: &dyn MailboxGateway,
        flag: Flag,
        add: bool,
        ctx: &mut ProcessingContext,
    ) -> Result<(), ProcessorError> {
        let (folder, uid) = addressable(ctx)?;
        let flags = [flag];
        if add {
            self.retry
                .run("set_flags", || gateway.set_flags(&folder, uid, &flags))
                .await?;
        } else {
            self.retry
                .run("clear_flags", || gateway.clear_flags(&folder, uid, &flags))
                .await?;
        }
        Ok(())
    }
}

/// Current folder and UID, or a permanent error when the message cannot be
/// addressed any more.
fn addressable(ctx: &ProcessingContext) -> Result<(String, Uid), GatewayError> {
    match &ctx.location {
        Location::At { folder, uid } => Ok((folder.clone(), *uid)),
        Location::Moved { folder } => Err(GatewayError::Protocol(format!(
            "message moved to {folder} and its new UID is unknown"
        ))),
        Location::Removed => Err(GatewayError::Protocol("message no longer present".into())),
    }
}

async fn ensure_folder(
    retry: &RetryPolicy,
    gateway: &dyn MailboxGateway,
    path: &str,
) -> Result<(), GatewayError> {
    let exists = retry
        .run("folder_exists", || gateway.folder_exists(path))
        .await?;
    if !exists {
        debug!(folder = path, "Creating missing folder");
        retry
            .run("create_folder", || gateway.create_folder(path))
            .await?;
    }
    Ok(())
}
